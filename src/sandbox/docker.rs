//! Docker CLI backend.
//!
//! Containers are started detached with an idle `sleep` entrypoint and
//! `--rm`, so a lost teardown still ends with the container removing
//! itself once `max_lifetime` runs out. Hardening applied to every
//! container: read-only root (unless the policy says otherwise), a small
//! `noexec` tmpfs on `/tmp`, all capabilities dropped, no privilege
//! escalation, `nobody` user, memory/swap/CPU/pid limits.
//!
//! The isolation plan is applied from the host by entering the container's
//! network namespace (`nsenter -t <pid> -n`) and running each firewall
//! command there. The container itself never holds `NET_ADMIN`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info};

use super::{ContainerBackend, ContainerSpec, ExecOutput, SandboxError};
use crate::network::IsolationPlan;

/// Unprivileged `nobody:nogroup`.
const SANDBOX_USER: &str = "65534:65534";

const NSENTER: &str = "nsenter";

pub struct DockerBackend {
    binary: String,
}

impl DockerBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Fails with `RuntimeUnavailable` if the daemon cannot be reached.
    pub async fn check_available(&self) -> Result<String, SandboxError> {
        let output = Command::new(&self.binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("{}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(SandboxError::RuntimeUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Container runtime {} available (server {version})", self.binary);
        Ok(version)
    }

    async fn container_pid(&self, name: &str) -> Result<u32, SandboxError> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Pid}}", name])
            .output()
            .await
            .map_err(|e| network_error(name, e))?;
        if !output.status.success() {
            return Err(network_error(name, String::from_utf8_lossy(&output.stderr).trim()));
        }
        let pid = String::from_utf8_lossy(&output.stdout).trim().parse::<u32>();
        match pid {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(network_error(name, "container is not running")),
        }
    }
}

/// `docker run` arguments for `spec`.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let limits = &spec.limits;
    let mut args: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--rm".into(),
        "--name".into(),
        spec.name.clone(),
        "--label".into(),
        "fluux-guard.sandbox=1".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--user".into(),
        SANDBOX_USER.into(),
        "--memory".into(),
        format!("{}m", limits.memory_mb),
        "--memory-swap".into(),
        format!("{}m", limits.memory_mb),
        "--cpu-shares".into(),
        limits.cpu_shares.to_string(),
        "--pids-limit".into(),
        limits.pids_limit.to_string(),
        "--tmpfs".into(),
        format!("/tmp:rw,noexec,nosuid,nodev,size={}m", limits.tmpfs_size_mb),
        "--workdir".into(),
        "/tmp".into(),
    ];
    if limits.read_only_root {
        args.push("--read-only".into());
    }
    args.extend(spec.network_args.iter().cloned());
    args.extend([
        "--entrypoint".into(),
        "sleep".into(),
        spec.image.clone(),
        spec.max_lifetime.as_secs().max(1).to_string(),
    ]);
    args
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError> {
        let output = Command::new(&self.binary)
            .args(run_args(spec))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Create {
                id: spec.name.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(SandboxError::Create {
                id: spec.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!("Container {} started from {}", spec.name, spec.image);
        Ok(())
    }

    async fn apply_network_plan(&self, name: &str, plan: &IsolationPlan) -> Result<(), SandboxError> {
        if !plan.has_network() {
            // --network none: nothing to firewall
            return Ok(());
        }
        let pid = self.container_pid(name).await?.to_string();

        for argv in plan.iptables_commands() {
            let output = Command::new(NSENTER)
                .args(["-t", pid.as_str(), "-n", "--"])
                .args(&argv)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| network_error(name, e))?;
            if !output.status.success() {
                return Err(network_error(
                    name,
                    format!(
                        "`{}` failed: {}",
                        argv.join(" "),
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                ));
            }
        }
        debug!(
            "Applied {} firewall rule(s) to {name} (policy v{})",
            plan.rules.len(),
            plan.policy_version
        );
        Ok(())
    }

    async fn exec(&self, name: &str, argv: &[String], max_output: usize) -> Result<ExecOutput, SandboxError> {
        let mut child = Command::new(&self.binary)
            .arg("exec")
            .arg(name)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                id: name.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out, err) = tokio::join!(read_capped(stdout, max_output), read_capped(stderr, max_output));
        let status = child.wait().await.map_err(|e| SandboxError::Spawn {
            id: name.to_string(),
            reason: e.to_string(),
        })?;

        let exit_code = status.code().unwrap_or(-1);
        Ok(ExecOutput {
            exit_code,
            signal: exit_signal(exit_code),
            truncated: out.1 || err.1,
            stdout: out.0,
            stderr: err.0,
        })
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        let output = Command::new(&self.binary)
            .args(["rm", "--force", name])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_absent(&stderr) {
            debug!("Container {name} already gone");
            return Ok(());
        }
        Err(SandboxError::RuntimeUnavailable(stderr.trim().to_string()))
    }
}

fn network_error(name: &str, reason: impl std::fmt::Display) -> SandboxError {
    SandboxError::NetworkPlan {
        id: name.to_string(),
        reason: reason.to_string(),
    }
}

/// `docker exec` reports death by signal as 128 + signal.
fn exit_signal(exit_code: i32) -> Option<i32> {
    (129..=159).contains(&exit_code).then(|| exit_code - 128)
}

fn is_absent(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("is already in progress")
}

/// Reads all of `reader`, keeping the first `max` bytes. The rest is
/// drained so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, max: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}
