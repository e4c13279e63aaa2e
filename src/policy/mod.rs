//! Policy: the immutable configuration snapshot every guardrail reads.
//!
//! A `Policy` is compiled once from a `PolicyDocument` (CIDRs parsed, globs
//! turned into regexes, sensitive catalog validated) and never mutated
//! afterwards. The `PolicyStore` hands out `Arc` snapshots; reloading or
//! adding a custom pattern builds a new snapshot and swaps it in, together
//! with the isolation plan compiled from it.

pub mod catalog;
pub mod document;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::guard::cidr::{Cidr, CidrError};
use crate::network::{self, IsolationPlan};

pub use catalog::{PatternCatalog, PatternCategory, PatternDef, SensitivePattern, Severity};
pub use document::{ContentRules, NetworkSettings, PolicyDocument, RateLimits, ResourceLimits};

const DEFAULT_BLOCK_REASON: &str = "Domain is blocklisted";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("cannot read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed policy document: {0}")]
    Parse(String),
    #[error("invalid blocked CIDR: {0}")]
    InvalidCidr(#[from] CidrError),
    #[error("invalid blocked pattern '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },
    #[error("invalid sensitive pattern '{name}': {reason}")]
    InvalidPattern { name: String, reason: String },
    #[error("sensitive pattern '{0}' already exists")]
    DuplicatePattern(String),
}

/// Where a policy snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    File(PathBuf),
    /// Standard defaults (no document given).
    Defaults,
    /// Conservative fallback after a missing or malformed document.
    BuiltinMinimal,
}

/// A blocklist glob compiled to an anchored, case-insensitive regex.
#[derive(Debug, Clone)]
pub struct GlobRule {
    pub glob: String,
    regex: Regex,
}

impl GlobRule {
    pub fn compile(glob: &str) -> Result<Self, PolicyError> {
        let mut pattern = String::from("(?i)^");
        for c in glob.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        pattern.push('$');
        let regex = Regex::new(&pattern).map_err(|e| PolicyError::InvalidGlob {
            pattern: glob.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, target: &str) -> bool {
        self.regex.is_match(target)
    }
}

/// Immutable, compiled policy snapshot.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Monotonic snapshot number within a store.
    pub version: u64,
    pub source: PolicySource,
    pub blocked_cidrs: Vec<Cidr>,
    /// `(domain, category)`, lowercased, without leading `*.`.
    blocked_domains: Vec<(String, String)>,
    block_reasons: BTreeMap<String, String>,
    blocked_patterns: Vec<GlobRule>,
    blocked_extensions: Vec<String>,
    allowed_schemes: Vec<String>,
    allowed_domains: Vec<String>,
    pub catalog: PatternCatalog,
    pub content: ContentRules,
    pub limits: ResourceLimits,
    pub rate_limits: RateLimits,
    pub network: NetworkSettings,
}

impl Policy {
    pub fn compile(doc: PolicyDocument, source: PolicySource) -> Result<Self, PolicyError> {
        let blocked_cidrs = doc
            .blocklist
            .cidrs
            .iter()
            .map(|c| c.parse::<Cidr>())
            .collect::<Result<Vec<_>, _>>()?;

        let blocked_domains = doc
            .blocklist
            .domains
            .iter()
            .flat_map(|(category, domains)| {
                domains
                    .iter()
                    .map(move |d| (normalize_domain(d), category.clone()))
            })
            .filter(|(d, _)| !d.is_empty())
            .collect();

        let blocked_patterns = doc
            .blocklist
            .patterns
            .iter()
            .map(|g| GlobRule::compile(g))
            .collect::<Result<Vec<_>, _>>()?;

        let mut catalog = PatternCatalog::builtin()?;
        for def in &doc.sensitive_patterns {
            catalog = catalog.with_pattern(def)?;
        }

        for name in doc.content.block_on.iter().chain(doc.content.warn_on.iter()) {
            if catalog.get(name).is_none() {
                warn!("Content rule references unknown sensitive pattern '{name}', ignoring");
            }
        }

        Ok(Self {
            version: 0,
            source,
            blocked_cidrs,
            blocked_domains,
            block_reasons: doc.blocklist.reasons,
            blocked_patterns,
            blocked_extensions: doc
                .blocklist
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            allowed_schemes: doc
                .allowlist
                .schemes
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            allowed_domains: doc
                .allowlist
                .domains
                .iter()
                .map(|d| normalize_domain(d))
                .collect(),
            catalog,
            content: doc.content,
            limits: doc.limits,
            rate_limits: doc.rate_limits,
            network: doc.network,
        })
    }

    /// The standard policy used when no document is configured.
    pub fn standard() -> Result<Self, PolicyError> {
        Self::compile(PolicyDocument::default(), PolicySource::Defaults)
    }

    /// The conservative fallback policy.
    pub fn builtin_minimal() -> Result<Self, PolicyError> {
        Self::compile(PolicyDocument::minimal(), PolicySource::BuiltinMinimal)
    }

    pub fn scheme_allowed(&self, scheme: &str) -> bool {
        let scheme = scheme.to_lowercase();
        self.allowed_schemes.iter().any(|s| *s == scheme)
    }

    /// Category of the blocklist entry matching `host` exactly or as a
    /// parent domain.
    pub fn blocked_domain_category(&self, host: &str) -> Option<&str> {
        let host = normalize_domain(host);
        self.blocked_domains
            .iter()
            .find(|(domain, _)| domain_matches(&host, domain))
            .map(|(_, category)| category.as_str())
    }

    /// Human-readable reason for a blocklist category.
    pub fn block_reason(&self, category: &str) -> String {
        self.block_reasons
            .get(category)
            .cloned()
            .unwrap_or_else(|| DEFAULT_BLOCK_REASON.to_string())
    }

    pub fn matching_pattern(&self, target: &str) -> Option<&GlobRule> {
        self.blocked_patterns.iter().find(|rule| rule.is_match(target))
    }

    /// The blocked extension the last path segment ends with, if any.
    pub fn has_blocked_extension(&self, path: &str) -> Option<&str> {
        let last = path.rsplit('/').next().unwrap_or(path);
        let (_, ext) = last.rsplit_once('.')?;
        let ext = ext.to_lowercase();
        self.blocked_extensions
            .iter()
            .find(|blocked| **blocked == ext)
            .map(|s| s.as_str())
    }

    pub fn is_allowlisted(&self, host: &str) -> bool {
        let host = normalize_domain(host);
        self.allowed_domains.iter().any(|d| domain_matches(&host, d))
    }
}

fn normalize_domain(domain: &str) -> String {
    domain
        .trim()
        .trim_start_matches("*.")
        .trim_end_matches('.')
        .to_lowercase()
}

/// Exact match or `host` is a subdomain of `domain`.
fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

// ── PolicyStore ──────────────────────────────────────────

struct Snapshot {
    policy: Arc<Policy>,
    plan: Arc<IsolationPlan>,
}

/// Holds the current policy snapshot and its isolation plan.
///
/// Readers take cheap `Arc` clones; writers build a complete replacement
/// and swap it under a short write lock.
pub struct PolicyStore {
    current: RwLock<Snapshot>,
    path: Option<PathBuf>,
    fallback_reason: Option<String>,
}

impl PolicyStore {
    /// Loads the policy at `path`, falling back to the built-in minimal
    /// policy when the document is missing or malformed. Only errors if
    /// the built-in policy itself cannot be compiled.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let loaded = PolicyDocument::from_file(path)
            .and_then(|doc| Policy::compile(doc, PolicySource::File(path.to_path_buf())));

        let (policy, fallback_reason) = match loaded {
            Ok(policy) => {
                info!("Policy loaded from {}", path.display());
                (policy, None)
            }
            Err(e) => {
                warn!("Policy {} unusable ({e}), falling back to built-in minimal policy", path.display());
                (Policy::builtin_minimal()?, Some(e.to_string()))
            }
        };

        Ok(Self {
            current: RwLock::new(snapshot(policy, 1)),
            path: Some(path.to_path_buf()),
            fallback_reason,
        })
    }

    /// Wraps an already compiled policy (tests, embedding).
    pub fn from_policy(policy: Policy) -> Self {
        Self {
            current: RwLock::new(snapshot(policy, 1)),
            path: None,
            fallback_reason: None,
        }
    }

    /// Set when `load` had to fall back to the minimal policy.
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn policy(&self) -> Arc<Policy> {
        self.read().policy.clone()
    }

    pub fn plan(&self) -> Arc<IsolationPlan> {
        self.read().plan.clone()
    }

    /// Policy and plan from the same snapshot.
    pub fn snapshot(&self) -> (Arc<Policy>, Arc<IsolationPlan>) {
        let current = self.read();
        (current.policy.clone(), current.plan.clone())
    }

    /// Re-reads the policy file. On error the current snapshot is kept.
    pub fn reload(&self) -> Result<u64, PolicyError> {
        let Some(path) = &self.path else {
            return Ok(self.policy().version);
        };
        let doc = PolicyDocument::from_file(path)?;
        let policy = Policy::compile(doc, PolicySource::File(path.clone()))?;
        Ok(self.replace(policy))
    }

    /// Validates and adds a custom sensitive pattern, returning the new
    /// catalog version.
    pub fn add_custom_pattern(&self, def: &PatternDef) -> Result<u32, PolicyError> {
        let mut current = self.write();
        let mut next = (*current.policy).clone();
        next.catalog = current.policy.catalog.with_pattern(def)?;
        let catalog_version = next.catalog.version;
        let version = current.policy.version + 1;
        *current = snapshot(next, version);
        info!(
            "Sensitive pattern '{}' added (catalog v{catalog_version}, policy v{version})",
            def.name
        );
        Ok(catalog_version)
    }

    /// Swaps in `policy` and its freshly compiled plan.
    pub fn replace(&self, policy: Policy) -> u64 {
        let mut current = self.write();
        let version = current.policy.version + 1;
        *current = snapshot(policy, version);
        info!("Policy replaced (v{version})");
        version
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn snapshot(mut policy: Policy, version: u64) -> Snapshot {
    policy.version = version;
    let plan = network::compile(&policy);
    Snapshot {
        policy: Arc::new(policy),
        plan: Arc::new(plan),
    }
}
