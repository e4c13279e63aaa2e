//! Network isolation planner.
//!
//! Compiles a `Policy` into the concrete enforcement plan applied to a
//! sandbox's network namespace before any command runs: an ordered
//! firewall rule list, the DNS resolvers, and the container network mode.
//!
//! Rule order is part of the contract. Enforcement is first-match-wins, so
//! the plan is always laid out as:
//!
//! 1. `LOG` (optional) + `DROP` per blocked CIDR
//! 2. `DROP` per cloud metadata address
//! 3. `DROP` ICMP unless allowed
//! 4. with `default_deny`: `ACCEPT` per allowed port, then a catch-all `DROP`

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use tracing::warn;

use crate::guard::cidr::{self, Cidr};
use crate::policy::document::default_dns_servers;
use crate::policy::Policy;

const LOG_PREFIX: &str = "fluux-guard-deny: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Outbound web access through the container bridge.
    Bridge,
    /// No network interface besides loopback.
    None,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Bridge => "bridge",
            NetworkMode::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Log,
    Drop,
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum RuleTarget {
    Cidr(Cidr),
    Icmp,
    TcpPort(u16),
    UdpPort(u16),
    /// Catch-all.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirewallRule {
    pub target: RuleTarget,
    pub action: RuleAction,
}

impl FirewallRule {
    fn new(target: RuleTarget, action: RuleAction) -> Self {
        Self { target, action }
    }

    /// `(binary, args)` pairs implementing this rule on the OUTPUT chain.
    /// CIDR rules go to the matching address family only; protocol and
    /// catch-all rules are emitted for both.
    fn commands(&self) -> Vec<Vec<String>> {
        let jump: Vec<&str> = match self.action {
            RuleAction::Log => vec!["-j", "LOG", "--log-prefix", LOG_PREFIX],
            RuleAction::Drop => vec!["-j", "DROP"],
            RuleAction::Accept => vec!["-j", "ACCEPT"],
        };
        let build = |binary: &str, matcher: Vec<String>| {
            let mut cmd = vec![binary.to_string(), "-A".to_string(), "OUTPUT".to_string()];
            cmd.extend(matcher);
            cmd.extend(jump.iter().map(|s| s.to_string()));
            cmd
        };
        let both = |matcher: Vec<String>| {
            vec![build("iptables", matcher.clone()), build("ip6tables", matcher)]
        };

        match self.target {
            RuleTarget::Cidr(cidr) => {
                let binary = if cidr.is_ipv6() { "ip6tables" } else { "iptables" };
                vec![build(binary, vec!["-d".to_string(), cidr.to_string()])]
            }
            RuleTarget::Icmp => vec![
                build("iptables", vec!["-p".to_string(), "icmp".to_string()]),
                build("ip6tables", vec!["-p".to_string(), "ipv6-icmp".to_string()]),
            ],
            RuleTarget::TcpPort(port) => both(vec![
                "-p".to_string(),
                "tcp".to_string(),
                "--dport".to_string(),
                port.to_string(),
            ]),
            RuleTarget::UdpPort(port) => both(vec![
                "-p".to_string(),
                "udp".to_string(),
                "--dport".to_string(),
                port.to_string(),
            ]),
            RuleTarget::Any => both(Vec::new()),
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            RuleAction::Log => "LOG",
            RuleAction::Drop => "DROP",
            RuleAction::Accept => "ACCEPT",
        };
        match self.target {
            RuleTarget::Cidr(cidr) => write!(f, "{action} to {cidr}"),
            RuleTarget::Icmp => write!(f, "{action} icmp"),
            RuleTarget::TcpPort(p) => write!(f, "{action} tcp/{p}"),
            RuleTarget::UdpPort(p) => write!(f, "{action} udp/{p}"),
            RuleTarget::Any => write!(f, "{action} all"),
        }
    }
}

/// Concrete network enforcement for sandboxes created under one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationPlan {
    /// Version of the policy snapshot this plan was compiled from.
    pub policy_version: u64,
    pub rules: Vec<FirewallRule>,
    pub dns_servers: Vec<IpAddr>,
    pub network_mode: NetworkMode,
}

impl IsolationPlan {
    /// Same plan with networking removed, for actions that need none.
    pub fn offline(&self) -> Self {
        Self {
            network_mode: NetworkMode::None,
            ..self.clone()
        }
    }

    pub fn has_network(&self) -> bool {
        self.network_mode == NetworkMode::Bridge
    }

    /// Firewall commands in enforcement order (`argv[0]` is the binary).
    pub fn iptables_commands(&self) -> Vec<Vec<String>> {
        self.rules.iter().flat_map(|r| r.commands()).collect()
    }

    /// Container runtime arguments for the network namespace.
    pub fn docker_network_args(&self) -> Vec<String> {
        let mut args = vec!["--network".to_string(), self.network_mode.as_str().to_string()];
        if self.has_network() {
            for dns in &self.dns_servers {
                args.push("--dns".to_string());
                args.push(dns.to_string());
            }
        }
        args
    }
}

/// Compiles `policy` into its isolation plan. Pure and deterministic.
pub fn compile(policy: &Policy) -> IsolationPlan {
    let settings = &policy.network;
    let mut rules = Vec::new();

    let mut denied: Vec<Cidr> = Vec::new();
    if settings.block_reserved_ranges {
        denied.extend(cidr::reserved_ranges().copied());
    }
    for blocked in &policy.blocked_cidrs {
        if !denied.contains(blocked) {
            denied.push(*blocked);
        }
    }
    for cidr in denied {
        if settings.log_blocked {
            rules.push(FirewallRule::new(RuleTarget::Cidr(cidr), RuleAction::Log));
        }
        rules.push(FirewallRule::new(RuleTarget::Cidr(cidr), RuleAction::Drop));
    }

    if settings.block_metadata {
        for addr in cidr::METADATA_ADDRESSES {
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            if let Ok(host) = Cidr::new(*addr, prefix) {
                rules.push(FirewallRule::new(RuleTarget::Cidr(host), RuleAction::Drop));
            }
        }
    }

    if !settings.allow_icmp {
        rules.push(FirewallRule::new(RuleTarget::Icmp, RuleAction::Drop));
    }

    if settings.default_deny {
        for port in &settings.allowed_tcp_ports {
            rules.push(FirewallRule::new(RuleTarget::TcpPort(*port), RuleAction::Accept));
        }
        for port in &settings.allowed_udp_ports {
            rules.push(FirewallRule::new(RuleTarget::UdpPort(*port), RuleAction::Accept));
        }
        rules.push(FirewallRule::new(RuleTarget::Any, RuleAction::Drop));
    }

    IsolationPlan {
        policy_version: policy.version,
        rules,
        dns_servers: public_resolvers(&settings.dns_servers),
        network_mode: if settings.outbound_web {
            NetworkMode::Bridge
        } else {
            NetworkMode::None
        },
    }
}

/// Keeps only public resolver addresses; a loopback or private resolver
/// would be the host's own (possibly logging) DNS.
fn public_resolvers(configured: &[String]) -> Vec<IpAddr> {
    let accepted: Vec<IpAddr> = configured
        .iter()
        .filter_map(|s| match s.parse::<IpAddr>() {
            Ok(ip) if cidr::classify(ip).is_none() => Some(ip),
            Ok(ip) => {
                warn!("DNS resolver {ip} is not a public address, dropping it from the plan");
                None
            }
            Err(_) => {
                warn!("DNS resolver '{s}' is not an IP address, dropping it from the plan");
                None
            }
        })
        .collect();

    if accepted.is_empty() {
        default_dns_servers()
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    } else {
        accepted
    }
}
