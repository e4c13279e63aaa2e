use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use fluux_guard::audit::{AuditEntry, SecurityAuditLog};
use fluux_guard::config::Config;
use fluux_guard::executor::{ActionExecutor, ActionOutcome, CensoredSink, OutboundSink, SandboxImages};
use fluux_guard::policy::PolicyStore;
use fluux_guard::sandbox::{DockerBackend, SandboxEvent, SandboxRuntime};
use fluux_guard::SensitiveDataScanner;

const DEFAULT_CONFIG: &str = "config/guard.toml";

/// Session id recorded in audit entries for CLI-initiated actions.
const CLI_SESSION: &str = "cli";

fn print_help() {
    println!(
        "\
fluux-guard v{}

Security guardrails for agent actions: URL policy, sandboxed execution,
content sanitization and secret redaction, with a security audit log.

USAGE:
    fluux-guard [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    check-url <URL>                 Evaluate a URL against the policy
    fetch <URL>                     Fetch a URL in a sandbox, print sanitized text
    exec -- <PROGRAM> [ARGS...]     Run a command in an offline sandbox
    scan                            Redact sensitive data from stdin
    plan                            Print the network isolation plan
    audit recent [N]                Show the N most recent audit entries [default: 20]
    audit prune [DAYS] <OPERATOR>   Delete audit entries older than DAYS
                                    [default: audit.retention_days]

OPTIONS:
    -c, --config <PATH>    Operator configuration [default: {DEFAULT_CONFIG}]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, written to stderr
                (e.g. debug, fluux_guard=debug,warn)

EXAMPLES:
    fluux-guard check-url http://169.254.169.254/latest/meta-data/
    fluux-guard fetch https://docs.rs/regex
    fluux-guard exec -- python3 -c 'print(1 + 1)'
    echo 'key sk-...' | fluux-guard scan
    fluux-guard -c /etc/fluux/guard.toml audit prune 90 ops@example.com",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parsed command line.
#[derive(Debug, PartialEq)]
enum Command {
    CheckUrl(String),
    Fetch(String),
    Exec(Vec<String>),
    Scan,
    Plan,
    AuditRecent(usize),
    /// `days: None` falls back to `audit.retention_days`.
    AuditPrune { days: Option<u32>, operator: String },
}

fn parse_args(args: Vec<String>) -> Result<(PathBuf, Command)> {
    let mut config = PathBuf::from(DEFAULT_CONFIG);
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                config = iter
                    .next()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("{arg} needs a path"))?;
            }
            "--" => {
                rest.push(arg);
                rest.extend(iter.by_ref());
            }
            // Legacy form: config path as first positional argument
            _ if rest.is_empty() && arg.ends_with(".toml") => config = PathBuf::from(arg),
            _ => rest.push(arg),
        }
    }

    let mut words = rest.into_iter();
    let command = match words.next().as_deref() {
        Some("check-url") => Command::CheckUrl(words.next().ok_or_else(|| anyhow!("check-url needs a URL"))?),
        Some("fetch") => Command::Fetch(words.next().ok_or_else(|| anyhow!("fetch needs a URL"))?),
        Some("exec") => {
            let argv: Vec<String> = words.skip_while(|w| w == "--").collect();
            if argv.is_empty() {
                bail!("exec needs a program");
            }
            Command::Exec(argv)
        }
        Some("scan") => Command::Scan,
        Some("plan") => Command::Plan,
        Some("audit") => match words.next().as_deref() {
            Some("recent") => {
                let n = match words.next() {
                    Some(n) => n.parse().with_context(|| format!("invalid count '{n}'"))?,
                    None => 20,
                };
                Command::AuditRecent(n)
            }
            Some("prune") => match (words.next(), words.next()) {
                (Some(days), Some(operator)) => {
                    let days = days.parse().with_context(|| format!("invalid day count '{days}'"))?;
                    Command::AuditPrune {
                        days: Some(days),
                        operator,
                    }
                }
                // A lone number is a day count missing its operator
                (Some(operator), None) if !operator.chars().all(|c| c.is_ascii_digit()) => {
                    Command::AuditPrune { days: None, operator }
                }
                _ => bail!("audit prune needs [DAYS] <OPERATOR>"),
            },
            other => bail!("unknown audit command {other:?}, expected 'recent' or 'prune'"),
        },
        Some(other) => bail!("unknown command '{other}', see --help"),
        None => bail!("no command given, see --help"),
    };
    Ok((config, command))
}

/// Final delivery to the terminal.
struct StdoutSink;

#[async_trait]
impl OutboundSink for StdoutSink {
    async fn send(&self, text: &str) -> Result<()> {
        println!("{text}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--" => break,
            "--version" | "-V" => {
                println!("fluux-guard v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr so stdout stays machine readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_guard=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config_path, command) = parse_args(std::env::args().skip(1).collect())?;
    let config_path = config_path.to_string_lossy().into_owned();
    debug!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)
        .with_context(|| format!("cannot load configuration {config_path}"))?;

    let store = Arc::new(PolicyStore::load(&config.policy.path)?);
    let policy = store.policy();
    info!(
        "Policy v{} ({:?}), catalog v{} with {} pattern(s)",
        policy.version,
        policy.source,
        policy.catalog.version,
        policy.catalog.len()
    );

    match command {
        Command::CheckUrl(url) => {
            let verdict = fluux_guard::UrlGatekeeper::new(store).check(&url);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if !verdict.allowed {
                std::process::exit(2);
            }
            Ok(())
        }
        Command::Plan => {
            let plan = store.plan();
            println!("# policy v{}, network {}", plan.policy_version, plan.network_mode.as_str());
            for (i, rule) in plan.rules.iter().enumerate() {
                println!("# {:>3}. {rule}", i + 1);
            }
            println!("# docker {}", plan.docker_network_args().join(" "));
            for argv in plan.iptables_commands() {
                println!("{}", argv.join(" "));
            }
            Ok(())
        }
        Command::Scan => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            let audit = Arc::new(open_audit(&config, &store)?);
            let censor = SensitiveDataScanner::new(store);
            let result = censor.scan(&input);
            for m in &result.matches {
                // Metadata only, never the value
                eprintln!(
                    "{:>6}..{:<6} {:<18} {:?}/{:?} ({} bytes)",
                    m.start,
                    m.end,
                    m.pattern,
                    m.category,
                    m.severity,
                    m.len()
                );
            }
            let redacted =
                fluux_guard::executor::censor_outbound(&censor, &audit, &input, Some(CLI_SESSION));
            print!("{redacted}");
            Ok(())
        }
        Command::AuditRecent(n) => {
            let audit = open_audit(&config, &store)?;
            for entry in audit.recent(n)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(())
        }
        Command::AuditPrune { days, operator } => {
            let days = days.unwrap_or(config.audit.retention_days);
            let audit = open_audit(&config, &store)?;
            info!("Pruning audit entries older than {days} days");
            let report = audit.prune(days, &operator)?;
            println!(
                "Pruned {} entr(ies) in {} removed file(s)",
                report.entries_removed, report.files_removed
            );
            Ok(())
        }
        Command::Fetch(url) => {
            let executor = build_executor(&config, store).await?;
            let outcome = executor.fetch(&url, Some(CLI_SESSION)).await?;
            report_outcome(&executor, outcome).await
        }
        Command::Exec(argv) => {
            let executor = build_executor(&config, store).await?;
            let outcome = executor.run_command(&argv, Some(CLI_SESSION)).await?;
            report_outcome(&executor, outcome).await
        }
    }
}

fn open_audit(config: &Config, store: &Arc<PolicyStore>) -> Result<SecurityAuditLog> {
    let (alerts_tx, mut alerts_rx) = mpsc::unbounded_channel::<AuditEntry>();
    tokio::spawn(async move {
        while let Some(alert) = alerts_rx.recv().await {
            error!(
                "SECURITY ALERT [{:?}/{:?}] {}",
                alert.event_type, alert.severity, alert.description
            );
        }
    });

    let audit = SecurityAuditLog::open(&config.audit)
        .with_context(|| format!("cannot open audit directory {}", config.audit.dir.display()))?
        .with_scanner(Arc::new(SensitiveDataScanner::new(store.clone())))
        .with_alerts(alerts_tx);
    Ok(audit)
}

async fn build_executor(config: &Config, store: Arc<PolicyStore>) -> Result<ActionExecutor> {
    let backend = DockerBackend::new(&config.sandbox.runtime_binary);
    backend.check_available().await?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SandboxEvent>();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            debug!("Sandbox {} → {}", event.sandbox_id, event.state);
        }
    });

    let sandbox = SandboxRuntime::new(
        Arc::new(backend),
        config.sandbox.max_concurrent,
        Duration::from_secs(config.sandbox.stop_grace_secs),
    )
    .with_setup_timeout(Duration::from_secs(config.sandbox.setup_timeout_secs))
    .with_events(events_tx);

    let audit = Arc::new(open_audit(config, &store)?);
    let executor = ActionExecutor::new(store, Arc::new(sandbox), audit, SandboxImages::from(&config.sandbox))?;
    Ok(executor)
}

async fn report_outcome(executor: &ActionExecutor, outcome: ActionOutcome) -> Result<()> {
    match outcome {
        ActionOutcome::Allowed(output) => {
            for warning in &output.warnings {
                warn!("{warning}");
            }
            if let Some(code) = output.exit_code.filter(|c| *c != 0) {
                warn!("Command exited with status {code}");
            }
            let sink = CensoredSink::new(StdoutSink, executor, Some(CLI_SESSION));
            sink.send(&output.text).await
        }
        ActionOutcome::Blocked { reason, audit_id } => {
            eprintln!("blocked: {reason} (audit {})", audit_id.as_deref().unwrap_or("-"));
            std::process::exit(2);
        }
        ActionOutcome::Failed { reason, audit_id, .. } => {
            eprintln!("failed: {reason} (audit {})", audit_id.as_deref().unwrap_or("-"));
            std::process::exit(1);
        }
    }
}
