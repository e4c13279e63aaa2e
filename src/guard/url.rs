//! URL gatekeeper: decides whether the agent may touch a URL.
//!
//! Checks run in a fixed order and the first match wins:
//!
//! 1. scheme not allowed (`file:`, `gopher:`, `data:` …)
//! 2. loopback / private / link-local / metadata address literal,
//!    IPv4 and IPv6 (IPv4-mapped and NAT64 forms unwrapped)
//! 3. blocked file extension
//! 4. blocklisted domain (exact or parent domain)
//! 5. blocklisted glob pattern on `host/path`
//! 6. router / admin / intranet hostname heuristics
//!
//! Anything else is allowed, and tagged `is_allowlisted` when the host is
//! on the allowlist. The allowlist is informational and never overrides a
//! block. Numeric IPv4 obfuscations (`http://2130706433/`, `0x7f.1`,
//! octal) are normalised by the WHATWG parser before step 2.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use url::{Host, Url};

use super::cidr::{self, RangeKind};
use crate::policy::{Policy, PolicyStore};

/// First labels that designate network equipment or admin consoles.
const ROUTER_LABELS: &[&str] = &[
    "router",
    "gateway",
    "modem",
    "admin",
    "administrator",
    "routerlogin",
    "firewall",
    "nas",
    "printer",
    "ilo",
    "idrac",
];

/// Suffixes that only resolve on private networks.
const INTERNAL_SUFFIXES: &[&str] = &[
    "local",
    "lan",
    "internal",
    "intranet",
    "corp",
    "home",
    "localdomain",
    "home.arpa",
    "box",
];

/// Public names that redirect to the user's home router.
const ROUTER_DOMAINS: &[&str] = &[
    "routerlogin.net",
    "routerlogin.com",
    "tplinkwifi.net",
    "tplinklogin.net",
    "miwifi.com",
    "speedport.ip",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    InvalidUrl,
    Scheme,
    PrivateAddress,
    Extension,
    Domain,
    Pattern,
    Hostname,
}

/// Result of a URL check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlVerdict {
    pub allowed: bool,
    /// User-facing explanation; never contains a blocklist pattern.
    pub reason: String,
    /// Internal rule identifier, for the audit trail.
    pub matched_rule: Option<String>,
    pub kind: Option<BlockKind>,
    pub is_allowlisted: bool,
    pub host: Option<String>,
    /// Canonical serialization of the URL that was judged. Set only when
    /// allowed; this exact string is what may be handed to a fetcher.
    pub target: Option<String>,
}

impl UrlVerdict {
    fn block(kind: BlockKind, reason: impl Into<String>, rule: impl Into<String>, host: Option<&str>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            matched_rule: Some(rule.into()),
            kind: Some(kind),
            is_allowlisted: false,
            host: host.map(str::to_string),
            target: None,
        }
    }

    fn allow(url: &Url, host: &str, is_allowlisted: bool) -> Self {
        Self {
            allowed: true,
            reason: if is_allowlisted {
                "allowed (allowlisted domain)".to_string()
            } else {
                "allowed".to_string()
            },
            matched_rule: None,
            kind: None,
            is_allowlisted,
            host: Some(host.to_string()),
            target: Some(url.as_str().to_string()),
        }
    }
}

/// Checks URLs against the current policy snapshot.
pub struct UrlGatekeeper {
    store: Arc<PolicyStore>,
}

impl UrlGatekeeper {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn check(&self, url: &str) -> UrlVerdict {
        evaluate(&self.store.policy(), url)
    }
}

/// Pure check of `input` against `policy`.
pub fn evaluate(policy: &Policy, input: &str) -> UrlVerdict {
    let parsed = match Url::parse(input.trim()) {
        Ok(u) => u,
        Err(_) => {
            return UrlVerdict::block(BlockKind::InvalidUrl, "invalid URL", "parse", None);
        }
    };

    // 1. Scheme
    let scheme = parsed.scheme();
    if !policy.scheme_allowed(scheme) {
        return UrlVerdict::block(
            BlockKind::Scheme,
            format!("URL scheme '{scheme}' is not allowed"),
            format!("scheme:{scheme}"),
            None,
        );
    }

    let host = match parsed.host() {
        Some(h) => h,
        None => return UrlVerdict::block(BlockKind::InvalidUrl, "invalid URL", "no-host", None),
    };
    let host_str = match &host {
        Host::Domain(d) => d.to_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };

    // 2. Loopback / private address literals
    if let Some(verdict) = check_address(policy, &host, &host_str) {
        return verdict;
    }

    // 3. File extension
    if let Some(ext) = policy.has_blocked_extension(parsed.path()) {
        return UrlVerdict::block(
            BlockKind::Extension,
            format!("Downloading .{ext} files is not allowed"),
            format!("extension:{ext}"),
            Some(&host_str),
        );
    }

    // 4. Domain blocklist
    if let Host::Domain(_) = host {
        if let Some(category) = policy.blocked_domain_category(&host_str) {
            return UrlVerdict::block(
                BlockKind::Domain,
                policy.block_reason(category),
                format!("domain:{category}"),
                Some(&host_str),
            );
        }
    }

    // 5. Glob patterns
    let target = format!("{host_str}{}", parsed.path());
    if let Some(rule) = policy.matching_pattern(&target) {
        return UrlVerdict::block(
            BlockKind::Pattern,
            "URL matches a blocked pattern",
            format!("pattern:{}", rule.glob),
            Some(&host_str),
        );
    }

    // 6. Hostname heuristics
    if let Host::Domain(_) = host {
        if let Some(reason) = suspicious_hostname(&host_str) {
            return UrlVerdict::block(
                BlockKind::Hostname,
                reason,
                "hostname-heuristic",
                Some(&host_str),
            );
        }
    }

    // 7. Allowed
    UrlVerdict::allow(&parsed, &host_str, policy.is_allowlisted(&host_str))
}

fn check_address(policy: &Policy, host: &Host<&str>, host_str: &str) -> Option<UrlVerdict> {
    let ip = match host {
        Host::Ipv4(ip) => IpAddr::V4(*ip),
        Host::Ipv6(ip) => IpAddr::V6(*ip),
        Host::Domain(d) => {
            let d = d.trim_end_matches('.').to_lowercase();
            if d == "localhost" || d.ends_with(".localhost") {
                return Some(UrlVerdict::block(
                    BlockKind::PrivateAddress,
                    format!("Access to {} is not allowed", RangeKind::Loopback.describe()),
                    "range:loopback",
                    Some(host_str),
                ));
            }
            return None;
        }
    };

    if let Some(kind) = cidr::classify(ip) {
        return Some(UrlVerdict::block(
            BlockKind::PrivateAddress,
            format!("Access to {} is not allowed", kind.describe()),
            format!("range:{kind:?}").to_lowercase(),
            Some(host_str),
        ));
    }

    let unwrapped = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
        IpAddr::V4(_) => None,
    };
    let blocked = policy
        .blocked_cidrs
        .iter()
        .find(|c| c.contains(ip) || unwrapped.is_some_and(|v4| c.contains(v4)));
    blocked.map(|c| {
        UrlVerdict::block(
            BlockKind::PrivateAddress,
            "Access to this address range is not allowed",
            format!("cidr:{c}"),
            Some(host_str),
        )
    })
}

/// Router-, admin- or intranet-looking hostnames.
fn suspicious_hostname(host: &str) -> Option<String> {
    let host = host.trim_end_matches('.');

    if !host.contains('.') {
        return Some("Single-label hostnames only resolve on private networks".to_string());
    }

    if ROUTER_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    {
        return Some("Router administration hostname is not allowed".to_string());
    }

    if let Some(suffix) = INTERNAL_SUFFIXES
        .iter()
        .find(|s| host.ends_with(&format!(".{s}")))
    {
        return Some(format!("Internal network domain (.{suffix}) is not allowed"));
    }

    let first = host.split('.').next().unwrap_or(host);
    if ROUTER_LABELS.contains(&first) {
        return Some("Router or administration hostname is not allowed".to_string());
    }

    None
}
