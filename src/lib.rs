//! Security guardrail pipeline for agent actions.
//!
//! Leaves first: `policy` → `guard` (URL gatekeeper, rate limiter) →
//! `network` (isolation planner) → `sandbox` → `content` (sanitizer) →
//! `censor` (outbound redaction) → `audit` → `executor` (orchestration).

pub mod audit;
pub mod censor;
pub mod config;
pub mod content;
pub mod executor;
pub mod guard;
pub mod network;
pub mod policy;
pub mod sandbox;

pub use audit::{AuditEntry, AuditEventType, SecurityAuditLog};
pub use censor::{Censor, ScanMatch, ScanResult, SensitiveDataScanner};
pub use content::{ContentSanitizer, SanitizeResult};
pub use executor::{ActionExecutor, ActionOutcome, CensoredSink, OutboundSink};
pub use guard::{RateLimiter, UrlGatekeeper, UrlVerdict};
pub use network::IsolationPlan;
pub use policy::{Policy, PolicyError, PolicyStore};
pub use sandbox::{ContainerBackend, DockerBackend, SandboxRuntime};
