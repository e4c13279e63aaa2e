//! Security audit log.
//!
//! Append-only JSONL record of every block, redaction and sandbox
//! violation, written to its own directory, separate from the application
//! log. Entries carry metadata about findings (pattern, category, length)
//! and never the matched value; when a scanner is attached, every entry is
//! scanned once more before it is written.
//!
//! Layout:
//!   {dir}/security-audit-YYYY-MM-DD.jsonl   one file per UTC day (rotation on)
//!   {dir}/security-audit.jsonl              single file (rotation off)
//!
//! Recording never fails from the caller's point of view: a write error is
//! reported on stderr, counted, and escalated on the alert channel, but the
//! action being audited carries on.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::censor::SensitiveDataScanner;
use crate::config::AuditConfig;
use crate::policy::Severity;

const FILE_PREFIX: &str = "security-audit";
const FILE_SUFFIX: &str = ".jsonl";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    UrlBlocked,
    /// Outbound text contained sensitive data (detected before redaction).
    LeakAttempt,
    /// Outbound text was redacted before delivery.
    LeakBlocked,
    ContentRejected,
    ContentWarning,
    RateLimited,
    SandboxTimeout,
    SandboxFailure,
    SandboxViolation,
    PolicyFallback,
    PolicyChange,
    RetentionPrune,
    /// Never persisted: only raised on the alert channel.
    AuditWriteFailure,
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub description: String,
    /// Metadata only: counts, lengths, categories, rule identifiers.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub blocked: bool,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            severity,
            description: description.into(),
            context: Value::Null,
            session_id: None,
            blocked: false,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn in_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }
}

/// Outcome of a retention prune.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub files_removed: usize,
    pub entries_removed: usize,
}

pub struct SecurityAuditLog {
    dir: PathBuf,
    rotate_daily: bool,
    /// Serializes appends and prunes within the process.
    writer: Mutex<()>,
    scanner: Option<Arc<SensitiveDataScanner>>,
    alerts: Option<mpsc::UnboundedSender<AuditEntry>>,
    write_failures: AtomicU64,
}

impl SecurityAuditLog {
    pub fn open(config: &AuditConfig) -> Result<Self, AuditError> {
        fs::create_dir_all(&config.dir)?;
        info!(
            "Security audit log at {} (daily rotation: {})",
            config.dir.display(),
            config.rotate_daily
        );
        Ok(Self {
            dir: config.dir.clone(),
            rotate_daily: config.rotate_daily,
            writer: Mutex::new(()),
            scanner: None,
            alerts: None,
            write_failures: AtomicU64::new(0),
        })
    }

    /// Scan every entry before persisting it.
    pub fn with_scanner(mut self, scanner: Arc<SensitiveDataScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// High and critical entries (and write failures) are sent here.
    pub fn with_alerts(mut self, alerts: mpsc::UnboundedSender<AuditEntry>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of entries that could not be persisted.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Appends `entry` and returns what was actually written.
    pub fn record(&self, entry: AuditEntry) -> AuditEntry {
        let entry = self.scrub(entry);

        debug!(
            audit_id = %entry.id,
            severity = ?entry.severity,
            blocked = entry.blocked,
            "Audit: {:?}",
            entry.event_type
        );

        if let Err(e) = self.append(&entry) {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            eprintln!(
                "fluux-guard: SECURITY AUDIT WRITE FAILED ({:?} {}): {e}",
                entry.event_type, entry.id
            );
            error!("Security audit write failed for {}: {e}", entry.id);
            self.alert(
                AuditEntry::new(
                    AuditEventType::AuditWriteFailure,
                    Severity::High,
                    format!("Audit entry {} could not be persisted", entry.id),
                )
                .with_context(json!({ "error": e.to_string() })),
            );
        }

        if entry.severity.is_alerting() {
            self.alert(entry.clone());
        }
        entry
    }

    /// Most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let mut files = self.log_files()?;
        files.sort_by(|a, b| b.cmp(a));

        let mut entries = Vec::new();
        for path in files {
            let mut in_file = read_entries(&path)?;
            in_file.reverse();
            entries.extend(in_file);
            if entries.len() >= limit {
                break;
            }
        }
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Removes entries older than `retention_days`. The only deletion path;
    /// the prune itself is recorded with the operator who requested it.
    pub fn prune(&self, retention_days: u32, operator: &str) -> Result<PruneReport, AuditError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut report = PruneReport {
            files_removed: 0,
            entries_removed: 0,
        };

        {
            let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            for path in self.log_files()? {
                let whole_file_expired = file_date(&path)
                    .is_some_and(|day| day < cutoff.date_naive());
                if whole_file_expired {
                    report.entries_removed += count_lines(&path)?;
                    fs::remove_file(&path)?;
                    report.files_removed += 1;
                } else {
                    report.entries_removed += rewrite_without_expired(&path, cutoff)?;
                }
            }
        }

        info!(
            "Audit retention prune by {operator}: {} file(s), {} entr(ies) removed",
            report.files_removed, report.entries_removed
        );
        self.record(
            AuditEntry::new(
                AuditEventType::RetentionPrune,
                Severity::Medium,
                format!("Audit entries older than {retention_days} days pruned"),
            )
            .with_context(json!({
                "operator": operator,
                "retention_days": retention_days,
                "files_removed": report.files_removed,
                "entries_removed": report.entries_removed,
            })),
        );
        Ok(report)
    }

    // ── Internals ──────────────────────────────────────

    fn scrub(&self, mut entry: AuditEntry) -> AuditEntry {
        let Some(scanner) = &self.scanner else {
            return entry;
        };

        let description = scanner.scan(&entry.description);
        let mut scrubbed = description.matches.len();
        entry.description = description.redacted_text;

        if !entry.context.is_null() {
            let raw = entry.context.to_string();
            let context = scanner.scan(&raw);
            if context.had_match() {
                scrubbed += context.matches.len();
                entry.context = serde_json::from_str(&context.redacted_text)
                    .unwrap_or_else(|_| json!({ "redacted": true }));
            }
        }

        if scrubbed > 0 {
            warn!(
                "Audit entry {} carried {scrubbed} sensitive value(s), redacted before persisting",
                entry.id
            );
        }
        entry
    }

    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.current_file(entry.timestamp);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        // One write per line: O_APPEND keeps whole lines atomic
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn alert(&self, entry: AuditEntry) {
        if let Some(alerts) = &self.alerts {
            let _ = alerts.send(entry);
        }
    }

    fn current_file(&self, at: DateTime<Utc>) -> PathBuf {
        if self.rotate_daily {
            self.dir
                .join(format!("{FILE_PREFIX}-{}{FILE_SUFFIX}", at.format("%Y-%m-%d")))
        } else {
            self.dir.join(format!("{FILE_PREFIX}{FILE_SUFFIX}"))
        }
    }

    fn log_files(&self) -> Result<Vec<PathBuf>, AuditError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX));
            if is_log {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// Date encoded in a rotated file name, if any.
fn file_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let date = name
        .strip_prefix(&format!("{FILE_PREFIX}-"))?
        .strip_suffix(FILE_SUFFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    let file = fs::File::open(path)?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping malformed audit line in {}: {e}", path.display()),
        }
    }
    Ok(entries)
}

fn count_lines(path: &Path) -> Result<usize, AuditError> {
    let file = fs::File::open(path)?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// Rewrites `path` keeping entries at or after `cutoff` (and any line that
/// cannot be dated). Returns the number of entries dropped.
fn rewrite_without_expired(path: &Path, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
    let file = fs::File::open(path)?;
    let mut kept = String::new();
    let mut dropped = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let expired = serde_json::from_str::<AuditEntry>(&line)
            .map(|e| e.timestamp < cutoff)
            .unwrap_or(false);
        if expired {
            dropped += 1;
        } else {
            kept.push_str(&line);
            kept.push('\n');
        }
    }

    if dropped > 0 {
        let tmp = path.with_extension("jsonl.prune");
        fs::write(&tmp, kept)?;
        fs::rename(&tmp, path)?;
    }
    Ok(dropped)
}
