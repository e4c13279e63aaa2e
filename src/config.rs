use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    /// Missing or malformed → built-in minimal policy
    #[serde(default = "default_policy_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    /// Keep separate from the application log directory
    #[serde(default = "default_audit_dir")]
    pub dir: PathBuf,
    /// One file per UTC day
    #[serde(default = "default_true")]
    pub rotate_daily: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Container runtime CLI (docker or a compatible one, e.g. podman)
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,
    /// Image for command execution
    #[serde(default = "default_exec_image")]
    pub exec_image: String,
    /// Image for web fetches, must provide curl
    #[serde(default = "default_fetch_image")]
    pub fetch_image: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Grace period given to `docker rm -f` before the teardown is abandoned
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Bound on container creation and on firewall setup, each
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("./config/policy.toml")
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from("./data/audit")
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    90
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_exec_image() -> String {
    "alpine:3.20".to_string()
}

fn default_fetch_image() -> String {
    "curlimages/curl:8.10.1".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_setup_timeout_secs() -> u64 {
    120
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            path: default_policy_path(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
            rotate_daily: true,
            retention_days: default_retention_days(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_binary: default_runtime_binary(),
            exec_image: default_exec_image(),
            fetch_image: default_fetch_image(),
            max_concurrent: default_max_concurrent(),
            stop_grace_secs: default_stop_grace_secs(),
            setup_timeout_secs: default_setup_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${FLUUX_AUDIT_DIR}
        let expanded = shellexpand::env(content)?;
        let mut config: Config = toml::from_str(&expanded)?;
        if config.sandbox.max_concurrent == 0 {
            anyhow::bail!("sandbox.max_concurrent must be at least 1");
        }
        config.sandbox.runtime_binary = config.sandbox.runtime_binary.trim().to_string();
        Ok(config)
    }
}
