//! `tiergate` command surface.
//!
//! Exit codes: `0` Green, `1` Blocked, `2` Degraded, `3` infrastructure
//! error (discovery failure, Protected mutation, fatal execution error, bad
//! usage or configuration).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tiergate_audit_core::{load_run_audit, AuditStore, RETIRED_CONTENT_HASH};
use tiergate_audit_sqlite::SqliteAuditStore;
use tiergate_domain::{
    ensure_non_empty, format_rfc3339, now_utc, ConfigOverrides, GateState, GovernanceConfig,
    GovernanceError, ProtectedBaseline, RunId, Tier,
};
use tiergate_executor::{CancellationToken, ProcessExecutor};
use tiergate_orchestrator::{Orchestrator, RunOutcome, RunRequest};
use tiergate_registry::{build_catalog, TierRoots};
use tiergate_report::{render_markdown, JsonFileSink, MarkdownFileSink, ReportSink};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const EXIT_GREEN: i32 = 0;
pub const EXIT_BLOCKED: i32 = 1;
pub const EXIT_DEGRADED: i32 = 2;
pub const EXIT_INFRA: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "tiergate", version)]
#[command(about = "Tiered test governance: run suites, detect conflicts, gate changes")]
pub struct Cli {
    /// Audit log database.
    #[arg(long, global = true, default_value = "./tiergate.sqlite3")]
    db: PathBuf,

    /// YAML or JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute the selected tiers and gate the snapshot.
    Run(Box<RunArgs>),
    Baseline {
        #[command(subcommand)]
        command: BaselineCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    snapshot: String,
    #[arg(long)]
    protected_root: PathBuf,
    #[arg(long)]
    candidate_root: Option<PathBuf>,
    #[arg(long)]
    owned_root: Option<PathBuf>,
    /// Optional tiers to run; defaults to every tier whose root is given.
    #[arg(long = "tier", value_enum)]
    tiers: Vec<TierArg>,
    #[arg(long)]
    report_dir: Option<PathBuf>,
    #[arg(long)]
    coverage_floor: Option<f64>,
    #[arg(long)]
    concurrency_limit: Option<usize>,
    #[arg(long)]
    retry_bound: Option<u32>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Cancel the run once this many milliseconds have passed.
    #[arg(long)]
    deadline_ms: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TierArg {
    Candidate,
    Owned,
}

impl From<TierArg> for Tier {
    fn from(value: TierArg) -> Self {
        match value {
            TierArg::Candidate => Tier::Candidate,
            TierArg::Owned => Tier::Owned,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum BaselineCommand {
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Record the current Protected content as last-known-good.
    Accept {
        #[arg(long)]
        protected_root: PathBuf,
        #[arg(long)]
        writer: String,
        #[arg(long)]
        justification: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    Runs {
        #[arg(long)]
        json: bool,
    },
    Show {
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Show {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        markdown: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BaselineAcceptSummary {
    pub accepted: Vec<String>,
    pub retired: Vec<String>,
    pub unchanged: usize,
}

/// Installs the stderr log subscriber. `RUST_LOG` overrides the `info`
/// default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parses the process arguments and runs them, mapping every failure to an
/// exit code.
#[must_use]
pub fn run_main() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_INFRA } else { EXIT_GREEN };
            let _ = err.print();
            return code;
        }
    };

    match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<GovernanceError>() {
                Some(governance) => eprintln!("error[{}]: {err:#}", governance.code()),
                None => eprintln!("error: {err:#}"),
            }
            EXIT_INFRA
        }
    }
}

#[must_use]
pub fn exit_code_for(state: GateState) -> i32 {
    match state {
        GateState::Green => EXIT_GREEN,
        GateState::Blocked => EXIT_BLOCKED,
        GateState::Degraded => EXIT_DEGRADED,
    }
}

/// Executes a parsed command and returns the process exit code.
///
/// # Errors
/// Returns an error for infrastructure failures; callers map it to exit `3`.
pub fn run_cli(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => run_governance(&cli.db, cli.config.as_deref(), &args),
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            let config = effective_config(cli.config.as_deref(), ConfigOverrides::default())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(EXIT_GREEN)
        }
        command => {
            let store = SqliteAuditStore::open(&cli.db)?;
            store.migrate()?;
            run_store_command(command, &store)?;
            Ok(EXIT_GREEN)
        }
    }
}

/// Executes a read or baseline command against an existing store.
///
/// # Errors
/// Returns an error when the store cannot be read or written, or a run or
/// report does not exist.
pub fn run_store_command(command: Command, store: &dyn AuditStore) -> Result<()> {
    match command {
        Command::Baseline {
            command: BaselineCommand::Show { json },
        } => {
            let baselines = store.latest_baselines()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&baselines)?);
            } else {
                for baseline in &baselines {
                    println!(
                        "{}  {}  {} ({})",
                        baseline.content_hash,
                        baseline.source_location,
                        format_rfc3339(baseline.recorded_at)?,
                        baseline.recorded_by
                    );
                }
            }
        }
        Command::Baseline {
            command:
                BaselineCommand::Accept {
                    protected_root,
                    writer,
                    justification,
                },
        } => {
            let summary = accept_baselines(store, &protected_root, &writer, &justification)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Audit {
            command: AuditCommand::Runs { json },
        } => {
            let runs = store.list_runs()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                for run in &runs {
                    let outcome = match (run.gate_state, run.error_code.as_deref()) {
                        (Some(state), _) => state.as_str(),
                        (None, Some(code)) => code,
                        (None, None) => "-",
                    };
                    println!(
                        "{}  {}  {:<8} {:<28} {}",
                        run.run_id,
                        format_rfc3339(run.started_at)?,
                        run.status.as_str(),
                        outcome,
                        run.snapshot
                    );
                }
            }
        }
        Command::Audit {
            command: AuditCommand::Show { run_id },
        } => {
            let run_id = RunId::parse(&run_id)?;
            let audit = load_run_audit(store, run_id)?
                .ok_or_else(|| anyhow!("run {run_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&audit)?);
        }
        Command::Report {
            command: ReportCommand::Show { run_id, markdown },
        } => {
            let run_id = RunId::parse(&run_id)?;
            let report = store
                .get_report(run_id)?
                .ok_or_else(|| anyhow!("no escalation report recorded for run {run_id}"))?;
            if markdown {
                print!("{}", render_markdown(&report));
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Command::Run(_) | Command::Config { .. } => {
            return Err(anyhow!("command does not operate on the audit store"));
        }
    }
    Ok(())
}

fn run_governance(db: &Path, config_file: Option<&Path>, args: &RunArgs) -> Result<i32> {
    let config = effective_config(
        config_file,
        ConfigOverrides {
            coverage_floor: args.coverage_floor,
            concurrency_limit: args.concurrency_limit,
            retry_bound: args.retry_bound,
            timeout_ms: args.timeout_ms,
        },
    )?;

    let roots = TierRoots {
        protected: args.protected_root.clone(),
        candidate: args.candidate_root.clone(),
        owned: args.owned_root.clone(),
    };
    let tiers = selected_tiers(&roots, &args.tiers);

    let cancel = CancellationToken::new();
    if let Some(deadline_ms) = args.deadline_ms {
        cancel
            .cancel_after(Duration::from_millis(deadline_ms))
            .context("failed to start deadline watcher")?;
    }

    let mut request = RunRequest::new(&args.snapshot, roots, tiers);
    request.config = config;
    request.cancel = cancel;

    let store = SqliteAuditStore::open(db)?;
    let executor = ProcessExecutor::default();

    let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
    if let Some(dir) = &args.report_dir {
        sinks.push(Box::new(JsonFileSink::new(dir)));
        sinks.push(Box::new(MarkdownFileSink::new(dir)));
    }
    let sink_refs: Vec<&dyn ReportSink> = sinks.iter().map(|sink| sink.as_ref()).collect();

    let outcome = Orchestrator::new(&store, &executor).run(&request, &sink_refs)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_summary(&outcome);
    }
    Ok(exit_code_for(outcome.state()))
}

fn effective_config(file: Option<&Path>, flags: ConfigOverrides) -> Result<GovernanceConfig> {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    Ok(GovernanceConfig::layered(file, &env, flags)?)
}

fn selected_tiers(roots: &TierRoots, requested: &[TierArg]) -> Vec<Tier> {
    if requested.is_empty() {
        return [Tier::Candidate, Tier::Owned]
            .into_iter()
            .filter(|tier| roots.root_for(*tier).is_some())
            .collect();
    }
    requested.iter().copied().map(Tier::from).collect()
}

fn print_summary(outcome: &RunOutcome) {
    let decision = &outcome.decision;
    println!("run_id={}", outcome.run_id);
    println!("state={}", decision.state);
    match decision.coverage {
        Some(coverage) => println!(
            "owned_coverage={coverage:.4} floor={:.4}",
            decision.coverage_floor
        ),
        None => println!("owned_coverage=unavailable floor={:.4}", decision.coverage_floor),
    }
    println!(
        "verdicts={} hard_conflicts={} soft_conflicts={}",
        outcome.verdicts.len(),
        outcome.conflict_summary.hard,
        outcome.conflict_summary.soft
    );
    for reason in &decision.reasons {
        if let Ok(value) = serde_json::to_string(reason) {
            println!("reason={value}");
        }
    }
    for path in &outcome.report_paths {
        println!("report={}", path.display());
    }
}

/// Records the current Protected content as the new last-known-good
/// baseline. Unchanged locations are skipped; locations that no longer exist
/// are retired.
///
/// # Errors
/// Returns an error when the writer or justification is blank, the Protected
/// root cannot be read, or the store write fails.
pub fn accept_baselines(
    store: &dyn AuditStore,
    protected_root: &Path,
    writer: &str,
    justification: &str,
) -> Result<BaselineAcceptSummary> {
    ensure_non_empty("writer", writer)?;
    ensure_non_empty("justification", justification)?;

    let roots = TierRoots {
        protected: protected_root.to_path_buf(),
        candidate: None,
        owned: None,
    };
    let catalog = build_catalog(&roots, &[Tier::Protected])?;
    let current = catalog.protected_hashes();
    let previous: BTreeMap<String, String> = store
        .latest_baselines()?
        .into_iter()
        .map(|baseline| (baseline.source_location, baseline.content_hash))
        .collect();

    let recorded_at = now_utc();
    let record = |location: &str, hash: &str| {
        store.append_baseline(&ProtectedBaseline {
            source_location: location.to_string(),
            content_hash: hash.to_string(),
            recorded_at,
            recorded_by: writer.to_string(),
            justification: justification.to_string(),
        })
    };

    let mut summary = BaselineAcceptSummary::default();
    for (location, hash) in &current {
        if previous.get(location) == Some(hash) {
            summary.unchanged += 1;
        } else {
            record(location, hash)?;
            summary.accepted.push(location.clone());
        }
    }

    for (location, hash) in &previous {
        if hash != RETIRED_CONTENT_HASH && !current.contains_key(location) {
            record(location, RETIRED_CONTENT_HASH)?;
            summary.retired.push(location.clone());
        }
    }

    info!(
        writer,
        accepted = summary.accepted.len(),
        retired = summary.retired.len(),
        "protected baseline accepted"
    );
    Ok(summary)
}
