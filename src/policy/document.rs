//! Serialized policy document (`policy.toml`).
//!
//! Every section and field is optional; a document that only overrides the
//! blocklist still gets the standard limits, content rules and network
//! settings. When the document cannot be read or parsed at all, the store
//! uses `PolicyDocument::minimal()` instead.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::catalog::PatternDef;
use super::PolicyError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyDocument {
    pub blocklist: BlocklistSection,
    pub allowlist: AllowlistSection,
    pub content: ContentRules,
    /// Custom additions to the built-in sensitive catalog.
    pub sensitive_patterns: Vec<PatternDef>,
    pub limits: ResourceLimits,
    pub rate_limits: RateLimits,
    pub network: NetworkSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlocklistSection {
    /// Extra CIDRs on top of the built-in reserved ranges.
    pub cidrs: Vec<String>,
    /// Blocked domains grouped by category (`malware = ["..."]`).
    pub domains: BTreeMap<String, Vec<String>>,
    /// Human-readable reason per category.
    pub reasons: BTreeMap<String, String>,
    /// Glob patterns matched against `host/path`.
    pub patterns: Vec<String>,
    /// File extensions (without the dot) that are never fetched.
    pub extensions: Vec<String>,
}

impl Default for BlocklistSection {
    fn default() -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(
            "exfiltration".to_string(),
            vec![
                "pastebin.com".to_string(),
                "transfer.sh".to_string(),
                "ngrok.io".to_string(),
                "ngrok-free.app".to_string(),
                "requestbin.net".to_string(),
                "webhook.site".to_string(),
                "interact.sh".to_string(),
                "burpcollaborator.net".to_string(),
            ],
        );
        domains.insert(
            "tracking".to_string(),
            vec![
                "doubleclick.net".to_string(),
                "google-analytics.com".to_string(),
            ],
        );
        let mut reasons = BTreeMap::new();
        reasons.insert(
            "exfiltration".to_string(),
            "Domain is commonly used for data exfiltration".to_string(),
        );
        reasons.insert(
            "tracking".to_string(),
            "Tracking or advertising domain".to_string(),
        );
        Self {
            cidrs: Vec::new(),
            domains,
            reasons,
            patterns: vec![
                "*/wp-admin*".to_string(),
                "*/phpmyadmin*".to_string(),
                "*/.git/*".to_string(),
                "*/.env".to_string(),
            ],
            extensions: default_blocked_extensions(),
        }
    }
}

fn default_blocked_extensions() -> Vec<String> {
    [
        "exe", "msi", "bat", "cmd", "com", "scr", "ps1", "vbs", "sh", "bash", "jar", "apk",
        "dmg", "pkg", "deb", "rpm", "dll", "so",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AllowlistSection {
    pub schemes: Vec<String>,
    /// Informational: matching URLs are tagged `is_allowlisted`.
    pub domains: Vec<String>,
}

impl Default for AllowlistSection {
    fn default() -> Self {
        Self {
            schemes: vec!["http".to_string(), "https".to_string()],
            domains: vec![
                "wikipedia.org".to_string(),
                "github.com".to_string(),
                "docs.rs".to_string(),
                "crates.io".to_string(),
            ],
        }
    }
}

/// Rules applied to fetched content before it reaches the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentRules {
    /// Raw payloads above this size are rejected without being parsed.
    pub max_raw_bytes: usize,
    /// Extracted text is truncated to this many characters.
    pub max_text_chars: usize,
    pub strip_scripts: bool,
    pub strip_styles: bool,
    pub strip_event_handlers: bool,
    pub strip_comments: bool,
    /// `<iframe>`, `<object>`, `<embed>`, `<applet>`.
    pub strip_embeds: bool,
    pub extract_text: bool,
    pub preserve_links: bool,
    /// Catalog pattern names whose presence rejects inbound content.
    pub block_on: Vec<String>,
    /// Catalog pattern names that only produce a warning.
    pub warn_on: Vec<String>,
}

impl Default for ContentRules {
    fn default() -> Self {
        Self {
            max_raw_bytes: 5 * 1024 * 1024,
            max_text_chars: 20_000,
            strip_scripts: true,
            strip_styles: true,
            strip_event_handlers: true,
            strip_comments: true,
            strip_embeds: true,
            extract_text: true,
            preserve_links: true,
            block_on: [
                "private_key",
                "api_key",
                "aws_access_key",
                "aws_secret_key",
                "github_token",
                "slack_token",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            warn_on: ["jwt", "bearer_token", "connection_string", "secret_assignment"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Per-sandbox resource bounds, fixed at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_shares: u32,
    pub pids_limit: u32,
    pub exec_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Captured stdout/stderr is cut at this many bytes.
    pub max_output_bytes: usize,
    pub read_only_root: bool,
    pub tmpfs_size_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_shares: 512,
            pids_limit: 128,
            exec_timeout_secs: 60,
            fetch_timeout_secs: 30,
            max_output_bytes: 1024 * 1024,
            read_only_root: true,
            tmpfs_size_mb: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: 30,
            per_hour: 500,
        }
    }
}

/// Inputs for the network isolation planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Emit a LOG rule before each CIDR deny.
    pub log_blocked: bool,
    pub block_metadata: bool,
    /// Also firewall the built-in reserved ranges, not only `blocklist.cidrs`.
    pub block_reserved_ranges: bool,
    pub allow_icmp: bool,
    pub default_deny: bool,
    pub allowed_tcp_ports: Vec<u16>,
    pub allowed_udp_ports: Vec<u16>,
    /// Non-logging public resolvers; never the host's own resolver.
    pub dns_servers: Vec<String>,
    /// Whether web actions may use a bridged network at all.
    pub outbound_web: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            log_blocked: false,
            block_metadata: true,
            block_reserved_ranges: true,
            allow_icmp: false,
            default_deny: true,
            allowed_tcp_ports: vec![80, 443],
            allowed_udp_ports: vec![53],
            dns_servers: default_dns_servers(),
            outbound_web: true,
        }
    }
}

/// Quad9 and Cloudflare, both documented as non-logging.
pub fn default_dns_servers() -> Vec<String> {
    vec!["9.9.9.9".to_string(), "1.1.1.1".to_string()]
}

impl PolicyDocument {
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path).map_err(|e| PolicyError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, PolicyError> {
        toml::from_str(content).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    /// Conservative fallback: small blocklist, short timeouts, tight
    /// sandbox limits and strict rate limits.
    pub fn minimal() -> Self {
        let mut blocklist = BlocklistSection {
            cidrs: Vec::new(),
            domains: BTreeMap::new(),
            reasons: BTreeMap::new(),
            patterns: Vec::new(),
            extensions: default_blocked_extensions(),
        };
        blocklist.domains.insert(
            "exfiltration".to_string(),
            vec![
                "pastebin.com".to_string(),
                "transfer.sh".to_string(),
                "webhook.site".to_string(),
            ],
        );
        blocklist.reasons.insert(
            "exfiltration".to_string(),
            "Domain is commonly used for data exfiltration".to_string(),
        );

        Self {
            blocklist,
            allowlist: AllowlistSection {
                schemes: vec!["https".to_string(), "http".to_string()],
                domains: Vec::new(),
            },
            content: ContentRules {
                max_raw_bytes: 1024 * 1024,
                max_text_chars: 10_000,
                ..ContentRules::default()
            },
            sensitive_patterns: Vec::new(),
            limits: ResourceLimits {
                memory_mb: 128,
                cpu_shares: 256,
                pids_limit: 32,
                exec_timeout_secs: 15,
                fetch_timeout_secs: 10,
                max_output_bytes: 256 * 1024,
                read_only_root: true,
                tmpfs_size_mb: 16,
            },
            rate_limits: RateLimits {
                per_minute: 10,
                per_hour: 100,
            },
            network: NetworkSettings {
                log_blocked: true,
                allowed_tcp_ports: vec![443],
                ..NetworkSettings::default()
            },
        }
    }
}
