//! Ephemeral execution sandboxes.
//!
//! Every execution gets its own container, named `fluux-sbx-<uuid>`, and
//! walks one state machine:
//!
//! ```text
//! CREATED → RUNNING → { COMPLETED(code) | TIMED_OUT | KILLED(signal) } → CLEANED_UP
//! ```
//!
//! The isolation plan is applied to the container's network namespace
//! before the command starts: the container is created with an idle
//! entrypoint, firewalled, and only then is the command exec'd into it.
//!
//! Teardown is owned by a guard. The normal path awaits it; if the
//! execution future is dropped (caller cancellation), the guard's `Drop`
//! spawns the teardown instead. Either way CLEANED_UP is reached exactly
//! once, and removing an already-absent container is not an error.
//!
//! Only bookkeeping (the handle registry) is behind a lock; the semaphore
//! caps how many sandboxes exist at the same time.

pub mod docker;
#[cfg(test)]
pub(crate) mod scripted;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::network::IsolationPlan;
use crate::policy::ResourceLimits;

pub use docker::DockerBackend;

const ID_PREFIX: &str = "fluux-sbx-";

/// Default bound on container creation plus network setup.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Recorded when the command could not be run and the container is
/// force-removed.
const SIGKILL: i32 = 9;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("sandbox {id} could not be created: {reason}")]
    Create { id: String, reason: String },
    #[error("isolation plan could not be applied to sandbox {id}: {reason}")]
    NetworkPlan { id: String, reason: String },
    #[error("command could not be started in sandbox {id}: {reason}")]
    Spawn { id: String, reason: String },
    #[error("sandbox id {0} is already in use")]
    DuplicateHandle(String),
    #[error("sandbox runtime is shutting down")]
    Closed,
    #[error("empty command")]
    EmptyCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Running,
    Completed { exit_code: i32 },
    TimedOut,
    Killed { signal: i32 },
    CleanedUp,
}

impl SandboxState {
    pub fn is_terminal_run_state(&self) -> bool {
        matches!(
            self,
            SandboxState::Completed { .. } | SandboxState::TimedOut | SandboxState::Killed { .. }
        )
    }

    /// Legal transitions. Teardown may interrupt any state.
    fn can_become(&self, next: &SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (CleanedUp, _) => false,
            (_, CleanedUp) => true,
            (Created, Running) => true,
            (Running, next) => next.is_terminal_run_state(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxState::Created => write!(f, "created"),
            SandboxState::Running => write!(f, "running"),
            SandboxState::Completed { exit_code } => write!(f, "completed({exit_code})"),
            SandboxState::TimedOut => write!(f, "timed_out"),
            SandboxState::Killed { signal } => write!(f, "killed({signal})"),
            SandboxState::CleanedUp => write!(f, "cleaned_up"),
        }
    }
}

/// Lifecycle notification, sent on the optional event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxEvent {
    pub sandbox_id: String,
    pub state: SandboxState,
}

/// One execution's identity. Never reused.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxHandle {
    pub id: String,
    pub state: SandboxState,
    pub limits: ResourceLimits,
    pub started_at: DateTime<Utc>,
}

/// What the backend needs to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub limits: ResourceLimits,
    pub network_args: Vec<String>,
    /// The container removes itself after this long even if teardown is lost.
    pub max_lifetime: Duration,
}

/// Raw result of one exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Set when the process died from a signal (including OOM kills).
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Output beyond `max_output` bytes was discarded.
    pub truncated: bool,
}

/// Container runtime operations. `remove` must succeed when the container
/// does not exist.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError>;

    async fn apply_network_plan(&self, name: &str, plan: &IsolationPlan) -> Result<(), SandboxError>;

    async fn exec(&self, name: &str, argv: &[String], max_output: usize) -> Result<ExecOutput, SandboxError>;

    async fn remove(&self, name: &str) -> Result<(), SandboxError>;
}

/// One sandboxed command.
#[derive(Debug, Clone)]
pub struct SandboxTask {
    /// `argv[0]` is the program; no shell is involved.
    pub argv: Vec<String>,
    pub image: String,
    pub limits: ResourceLimits,
    pub timeout: Duration,
    pub plan: Arc<IsolationPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub sandbox_id: String,
    pub exit_code: Option<i32>,
    #[serde(skip)]
    pub stdout: Vec<u8>,
    #[serde(skip)]
    pub stderr: Vec<u8>,
    pub output_truncated: bool,
    pub timed_out: bool,
    pub killed_signal: Option<i32>,
    pub duration: Duration,
    /// State reached before teardown.
    pub run_state: SandboxState,
    /// Always `CleanedUp`.
    pub final_state: SandboxState,
    pub cleanup_error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.run_state == SandboxState::Completed { exit_code: 0 }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

type Registry = Arc<Mutex<HashSet<String>>>;

pub struct SandboxRuntime {
    backend: Arc<dyn ContainerBackend>,
    semaphore: Arc<Semaphore>,
    registry: Registry,
    events: Option<mpsc::UnboundedSender<SandboxEvent>>,
    setup_timeout: Duration,
    teardown_timeout: Duration,
}

impl SandboxRuntime {
    pub fn new(backend: Arc<dyn ContainerBackend>, max_concurrent: usize, teardown_timeout: Duration) -> Self {
        Self {
            backend,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            registry: Arc::new(Mutex::new(HashSet::new())),
            events: None,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            teardown_timeout,
        }
    }

    /// Bounds `create` and `apply_network_plan`, each on its own.
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SandboxEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sandboxes currently registered (not yet cleaned up).
    pub fn active(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Runs `task` in a fresh sandbox. Creation failures are returned as
    /// errors and never retried here.
    pub async fn execute(&self, task: SandboxTask) -> Result<ExecutionResult, SandboxError> {
        if task.argv.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }

        // Held by the lifecycle until the container is gone
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Closed)?;

        let id = format!("{ID_PREFIX}{}", uuid::Uuid::new_v4());
        let mut lifecycle = self.register(id, task.limits.clone(), permit)?;
        let started = Instant::now();

        let outcome = self.run(&mut lifecycle, &task).await;
        let run_state = lifecycle.handle.state;
        let cleanup_error = lifecycle.teardown().await;

        let output = outcome?;
        let (exit_code, killed_signal, timed_out) = match run_state {
            SandboxState::Completed { exit_code } => (Some(exit_code), None, false),
            SandboxState::Killed { signal } => (None, Some(signal), false),
            SandboxState::TimedOut => (None, None, true),
            _ => (None, None, false),
        };

        Ok(ExecutionResult {
            sandbox_id: lifecycle.handle.id.clone(),
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            output_truncated: output.truncated,
            timed_out,
            killed_signal,
            duration: started.elapsed(),
            run_state,
            final_state: lifecycle.handle.state,
            cleanup_error,
        })
    }

    async fn run(&self, lifecycle: &mut Lifecycle, task: &SandboxTask) -> Result<ExecOutput, SandboxError> {
        let id = lifecycle.handle.id.clone();
        let spec = ContainerSpec {
            name: id.clone(),
            image: task.image.clone(),
            limits: task.limits.clone(),
            network_args: task.plan.docker_network_args(),
            max_lifetime: 2 * self.setup_timeout + task.timeout + self.teardown_timeout + Duration::from_secs(30),
        };

        debug!("Creating sandbox {id} ({}, network {})", spec.image, task.plan.network_mode.as_str());
        let setup_secs = self.setup_timeout.as_secs();
        tokio::time::timeout(self.setup_timeout, self.backend.create(&spec))
            .await
            .map_err(|_| SandboxError::Create {
                id: id.clone(),
                reason: format!("creation timed out after {setup_secs}s"),
            })??;
        tokio::time::timeout(self.setup_timeout, self.backend.apply_network_plan(&id, &task.plan))
            .await
            .map_err(|_| SandboxError::NetworkPlan {
                id: id.clone(),
                reason: format!("timed out after {setup_secs}s"),
            })??;

        lifecycle.transition(SandboxState::Running);
        let exec = self
            .backend
            .exec(&id, &task.argv, task.limits.max_output_bytes);

        match tokio::time::timeout(task.timeout, exec).await {
            Ok(Ok(output)) => {
                let state = match output.signal {
                    Some(signal) => SandboxState::Killed { signal },
                    None => SandboxState::Completed {
                        exit_code: output.exit_code,
                    },
                };
                lifecycle.transition(state);
                Ok(output)
            }
            Ok(Err(e)) => {
                warn!("Sandbox {id}: {e}");
                lifecycle.transition(SandboxState::Killed { signal: SIGKILL });
                Err(e)
            }
            Err(_) => {
                warn!("Sandbox {id} timed out after {}s, reclaiming", task.timeout.as_secs());
                lifecycle.transition(SandboxState::TimedOut);
                Ok(ExecOutput::default())
            }
        }
    }

    fn register(
        &self,
        id: String,
        limits: ResourceLimits,
        permit: OwnedSemaphorePermit,
    ) -> Result<Lifecycle, SandboxError> {
        if !lock(&self.registry).insert(id.clone()) {
            return Err(SandboxError::DuplicateHandle(id));
        }
        let handle = SandboxHandle {
            id,
            state: SandboxState::Created,
            limits,
            started_at: Utc::now(),
        };
        emit(&self.events, &handle.id, handle.state);
        Ok(Lifecycle {
            handle,
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            teardown_timeout: self.teardown_timeout,
            cleaned: false,
            permit: Some(permit),
        })
    }
}

/// Owns a handle until CLEANED_UP.
struct Lifecycle {
    handle: SandboxHandle,
    backend: Arc<dyn ContainerBackend>,
    registry: Registry,
    events: Option<mpsc::UnboundedSender<SandboxEvent>>,
    teardown_timeout: Duration,
    cleaned: bool,
    /// Concurrency slot, released only once the container is removed.
    permit: Option<OwnedSemaphorePermit>,
}

impl Lifecycle {
    fn transition(&mut self, next: SandboxState) {
        if !self.handle.state.can_become(&next) {
            error!(
                "Sandbox {}: illegal transition {} → {next}",
                self.handle.id, self.handle.state
            );
            return;
        }
        debug!("Sandbox {}: {} → {next}", self.handle.id, self.handle.state);
        self.handle.state = next;
        emit(&self.events, &self.handle.id, next);
    }

    /// Removes the container and marks the handle cleaned up. Returns the
    /// removal error, if any; the handle is released either way.
    async fn teardown(&mut self) -> Option<String> {
        if self.cleaned {
            return None;
        }
        // If this future is dropped during removal, Drop takes over
        let result = remove_container(&*self.backend, &self.handle.id, self.teardown_timeout).await;
        self.cleaned = true;
        self.transition(SandboxState::CleanedUp);
        lock(&self.registry).remove(&self.handle.id);
        self.permit.take();
        result.err()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        let id = self.handle.id.clone();
        let backend = self.backend.clone();
        let registry = self.registry.clone();
        let events = self.events.clone();
        let timeout = self.teardown_timeout;
        let permit = self.permit.take();

        info!("Sandbox {id} abandoned mid-run, scheduling teardown");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = remove_container(&*backend, &id, timeout).await {
                        error!("Deferred teardown of sandbox {id} failed: {e}");
                    }
                    lock(&registry).remove(&id);
                    emit(&events, &id, SandboxState::CleanedUp);
                    drop(permit);
                });
            }
            Err(_) => {
                error!("No async runtime to tear down sandbox {id}; container will expire on its own");
                lock(&registry).remove(&id);
                emit(&events, &id, SandboxState::CleanedUp);
            }
        }
    }
}

async fn remove_container(backend: &dyn ContainerBackend, id: &str, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, backend.remove(id)).await {
        Ok(Ok(())) => {
            debug!("Sandbox {id} removed");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Sandbox {id} removal failed: {e}");
            Err(e.to_string())
        }
        Err(_) => {
            error!("Sandbox {id} removal timed out after {}s", timeout.as_secs());
            Err(format!("removal timed out after {}s", timeout.as_secs()))
        }
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<SandboxEvent>>, id: &str, state: SandboxState) {
    if let Some(events) = events {
        let _ = events.send(SandboxEvent {
            sandbox_id: id.to_string(),
            state,
        });
    }
}

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashSet<String>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}
