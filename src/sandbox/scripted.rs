//! Scripted in-memory backend for lifecycle tests. Records every call.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerBackend, ContainerSpec, ExecOutput, SandboxError};
use crate::network::{IsolationPlan, NetworkMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Create {
        name: String,
        image: String,
        network_args: Vec<String>,
    },
    ApplyNetworkPlan {
        name: String,
        mode: NetworkMode,
        rules: usize,
    },
    Exec {
        name: String,
        argv: Vec<String>,
    },
    Remove {
        name: String,
    },
}

impl Call {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Call::Create { .. } => "create",
            Call::ApplyNetworkPlan { .. } => "apply_network_plan",
            Call::Exec { .. } => "exec",
            Call::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone)]
enum Behavior {
    Reply(ExecOutput),
    Hang,
    SpawnError,
}

pub(crate) struct ScriptedBackend {
    calls: Mutex<Vec<Call>>,
    /// Consumed one per exec before falling back to `default`.
    queued: Mutex<VecDeque<Behavior>>,
    default: Behavior,
    fail_create: bool,
    fail_network: bool,
    hang_setup: bool,
    vanish: bool,
    exec_delay: Duration,
    containers: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    fn with_default(default: Behavior) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            queued: Mutex::new(VecDeque::new()),
            default,
            fail_create: false,
            fail_network: false,
            hang_setup: false,
            vanish: false,
            exec_delay: Duration::ZERO,
            containers: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn succeeding(stdout: &[u8]) -> Self {
        Self::with_default(Behavior::Reply(ExecOutput {
            stdout: stdout.to_vec(),
            ..ExecOutput::default()
        }))
    }

    pub(crate) fn crashing(signal: i32) -> Self {
        Self::with_default(Behavior::Reply(ExecOutput {
            exit_code: 128 + signal,
            signal: Some(signal),
            ..ExecOutput::default()
        }))
    }

    pub(crate) fn hanging() -> Self {
        Self::with_default(Behavior::Hang)
    }

    pub(crate) fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::succeeding(b"")
        }
    }

    pub(crate) fn failing_network() -> Self {
        Self {
            fail_network: true,
            ..Self::succeeding(b"")
        }
    }

    /// `create` never returns (stalled daemon, endless image pull).
    pub(crate) fn hanging_create() -> Self {
        Self {
            hang_setup: true,
            ..Self::succeeding(b"")
        }
    }

    pub(crate) fn failing_exec() -> Self {
        Self::with_default(Behavior::SpawnError)
    }

    /// Replies in order, one per exec.
    pub(crate) fn replying(outputs: Vec<ExecOutput>) -> Self {
        let backend = Self::succeeding(b"");
        backend
            .queued
            .lock()
            .unwrap()
            .extend(outputs.into_iter().map(Behavior::Reply));
        backend
    }

    pub(crate) fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// The container disappears on its own after exec (`--rm`).
    pub(crate) fn with_container_vanishing(mut self) -> Self {
        self.vanish = true;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn execs(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Exec { argv, .. } => Some(argv),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn removals(&self) -> usize {
        self.calls().iter().filter(|c| c.kind() == "remove").count()
    }

    pub(crate) fn max_concurrent_execs(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerBackend for ScriptedBackend {
    async fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError> {
        self.record(Call::Create {
            name: spec.name.clone(),
            image: spec.image.clone(),
            network_args: spec.network_args.clone(),
        });
        if self.hang_setup {
            std::future::pending::<()>().await;
        }
        if self.fail_create {
            return Err(SandboxError::Create {
                id: spec.name.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        self.containers.lock().unwrap().insert(spec.name.clone());
        Ok(())
    }

    async fn apply_network_plan(&self, name: &str, plan: &IsolationPlan) -> Result<(), SandboxError> {
        self.record(Call::ApplyNetworkPlan {
            name: name.to_string(),
            mode: plan.network_mode,
            rules: plan.rules.len(),
        });
        if self.fail_network {
            return Err(SandboxError::NetworkPlan {
                id: name.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn exec(&self, name: &str, argv: &[String], max_output: usize) -> Result<ExecOutput, SandboxError> {
        self.record(Call::Exec {
            name: name.to_string(),
            argv: argv.to_vec(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }
        let behavior = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.vanish {
            self.containers.lock().unwrap().remove(name);
        }

        match behavior {
            Behavior::Reply(mut output) => {
                if output.stdout.len() > max_output {
                    output.stdout.truncate(max_output);
                    output.truncated = true;
                }
                Ok(output)
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(ExecOutput::default())
            }
            Behavior::SpawnError => Err(SandboxError::Spawn {
                id: name.to_string(),
                reason: "scripted failure".to_string(),
            }),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        self.record(Call::Remove {
            name: name.to_string(),
        });
        // Absent containers are fine
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }
}
