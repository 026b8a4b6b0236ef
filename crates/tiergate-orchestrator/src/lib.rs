#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tiergate_analyzer::{analyze, ConflictSummary};
use tiergate_audit_core::{baseline_hashes, AuditStore, RunCommit};
use tiergate_domain::{
    now_utc, ConflictRecord, CoverageFigure, DateTimeUtc, GateDecision, GateState,
    GovernanceConfig, GovernanceError, ProtectedBaseline, RunId, RunRecord, RunStatus,
    TestArtifact, Tier, Verdict,
};
use tiergate_executor::{CancellationToken, ExecutionEngine, ExecutionSettings, SandboxExecutor};
use tiergate_policy::{decide, GateInput};
use tiergate_registry::{
    build_catalog, check_protected_checksums, confirm_catalog_sources, hash_protected_sources,
    verify_protected_sources, Catalog, TierRoots,
};
use tiergate_report::{build_report, EscalationReport, ReportSink};
use tracing::{error, info, warn};

pub const ENGINE_VERSION: &str = concat!("tiergate.", env!("CARGO_PKG_VERSION"));

/// Recorded as the writer of baselines first observed during a run.
pub const RUN_BASELINE_WRITER: &str = "tiergate-run";

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: Option<RunId>,
    pub snapshot: String,
    pub roots: TierRoots,
    /// Optional tiers to run. Protected is always added.
    pub tiers: Vec<Tier>,
    pub config: GovernanceConfig,
    pub engine_version: String,
    pub cancel: CancellationToken,
}

impl RunRequest {
    #[must_use]
    pub fn new(snapshot: &str, roots: TierRoots, tiers: Vec<Tier>) -> Self {
        Self {
            run_id: None,
            snapshot: snapshot.to_string(),
            roots,
            tiers,
            config: GovernanceConfig::default(),
            engine_version: ENGINE_VERSION.to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub decision: GateDecision,
    pub verdicts: Vec<Verdict>,
    pub conflicts: Vec<ConflictRecord>,
    pub conflict_summary: ConflictSummary,
    pub coverage: BTreeMap<Tier, CoverageFigure>,
    pub report: Option<EscalationReport>,
    pub report_paths: Vec<PathBuf>,
    pub new_baselines: Vec<String>,
}

impl RunOutcome {
    #[must_use]
    pub fn state(&self) -> GateState {
        self.decision.state
    }
}

/// Protected first, each tier once, in gate order.
#[must_use]
pub fn normalize_tiers(selected: &[Tier]) -> Vec<Tier> {
    let mut tiers: Vec<Tier> = selected.to_vec();
    tiers.push(Tier::Protected);
    tiers.sort();
    tiers.dedup();
    tiers
}

pub struct Orchestrator<'a> {
    store: &'a dyn AuditStore,
    executor: &'a dyn SandboxExecutor,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(store: &'a dyn AuditStore, executor: &'a dyn SandboxExecutor) -> Self {
        Self { store, executor }
    }

    /// Runs one governance pass: discovery, checksum guard, execution,
    /// conflict analysis, gating, escalation and the audit commit.
    ///
    /// Nothing is committed unless a decision is reached. Fatal errors leave an
    /// `aborted` run row behind; cancellation leaves nothing. Report sinks are
    /// written only after the decision is durably committed.
    ///
    /// # Errors
    /// Returns a [`GovernanceError`] (wrapped in `anyhow`) for run-fatal
    /// conditions, and plain `anyhow` errors when the audit store or a report
    /// sink fails. A sink failure leaves the committed run in place.
    pub fn run(&self, request: &RunRequest, sinks: &[&dyn ReportSink]) -> Result<RunOutcome> {
        request.config.validate()?;
        self.store.migrate()?;

        let run_id = request.run_id.unwrap_or_default();
        let tiers = normalize_tiers(&request.tiers);
        let started_at = now_utc();
        let context = RunContext {
            run_id,
            request,
            tiers: &tiers,
            started_at,
        };

        info!(
            run_id = %run_id,
            snapshot = %request.snapshot,
            tiers = ?tiers,
            "governance run started"
        );

        let mut outcome = match self.run_pipeline(&context) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.abort(&context, err)),
        };
        if let Some(report) = &outcome.report {
            outcome.report_paths = publish_report(report, sinks).map_err(|err| {
                error!(
                    run_id = %run_id,
                    error = %format!("{err:#}"),
                    "report publication failed after commit"
                );
                err.context(format!("run {run_id} is committed but its report was not published"))
            })?;
        }
        Ok(outcome)
    }

    fn run_pipeline(&self, context: &RunContext<'_>) -> Result<RunOutcome> {
        let request = context.request;
        let run_id = context.run_id;

        let baselines = baseline_hashes(&self.store.latest_baselines()?);
        let scanned = hash_protected_sources(&request.roots.protected)?;
        let checksums = check_protected_checksums(&scanned, &baselines)?;
        let catalog = build_catalog(&request.roots, context.tiers)?;
        confirm_catalog_sources(&catalog, &scanned)?;
        if !checksums.new_sources.is_empty() {
            info!(
                run_id = %run_id,
                new_sources = checksums.new_sources.len(),
                "protected sources without a baseline"
            );
        }

        let probe = || verify_protected_sources(&catalog);
        let engine = ExecutionEngine::new(self.executor, ExecutionSettings::from(&request.config))
            .with_cancellation(request.cancel.clone())
            .with_integrity_probe(&probe);
        let artifacts: Vec<&TestArtifact> = catalog.artifacts().iter().collect();
        let executions = engine.execute_tiers(&artifacts, context.tiers, &request.snapshot)?;

        let mut verdicts = Vec::new();
        let mut coverage = BTreeMap::new();
        for execution in executions {
            verdicts.extend(execution.verdicts);
            coverage.insert(execution.tier, execution.coverage);
        }

        let conflicts = analyze_catalog(&catalog, &verdicts);
        let conflict_summary = ConflictSummary::from_records(&conflicts);

        let protected_ids = catalog
            .by_tier(Tier::Protected)
            .map(TestArtifact::id)
            .collect();
        let decision = decide(&GateInput {
            run_id,
            protected_artifact_ids: protected_ids,
            verdicts: &verdicts,
            conflicts: &conflicts,
            owned_coverage: coverage.get(&Tier::Owned),
            coverage_floor: request.config.coverage_floor,
            protected_mutation: verify_protected_sources(&catalog).err(),
        })?;

        if request.cancel.is_cancelled() {
            return Err(GovernanceError::Cancelled("run cancelled before commit".to_string()).into());
        }

        let report = if decision.state == GateState::Green {
            None
        } else {
            Some(build_report(&decision, &conflicts, &verdicts)?)
        };

        let new_baselines = first_observed_baselines(run_id, &checksums.new_sources);
        let run = RunRecord {
            run_id,
            snapshot: request.snapshot.clone(),
            tiers: context.tiers.to_vec(),
            started_at: context.started_at,
            ended_at: now_utc(),
            status: RunStatus::Decided,
            gate_state: Some(decision.state),
            error_code: None,
            error_message: None,
            engine_version: request.engine_version.clone(),
            config_json: serde_json::to_value(&request.config)?,
        };
        self.store.commit_run(&RunCommit {
            run: &run,
            verdicts: &verdicts,
            conflicts: &conflicts,
            decision: &decision,
            report: report.as_ref(),
            new_baselines: &new_baselines,
        })?;

        info!(
            run_id = %run_id,
            state = decision.state.as_str(),
            hard_conflicts = conflict_summary.hard,
            soft_conflicts = conflict_summary.soft,
            "governance run decided"
        );

        Ok(RunOutcome {
            run_id,
            decision,
            verdicts,
            conflicts,
            conflict_summary,
            coverage,
            report,
            report_paths: Vec::new(),
            new_baselines: new_baselines
                .into_iter()
                .map(|baseline| baseline.source_location)
                .collect(),
        })
    }

    /// Records the abort when the error is run-fatal, then hands the error
    /// back unchanged.
    fn abort(&self, context: &RunContext<'_>, err: anyhow::Error) -> anyhow::Error {
        if matches!(
            err.downcast_ref::<GovernanceError>(),
            Some(GovernanceError::Cancelled(_))
        ) {
            warn!(run_id = %context.run_id, error = %err, "run cancelled; nothing recorded");
            return err;
        }

        let (code, message) = match err.downcast_ref::<GovernanceError>() {
            Some(governance) => (governance.code().to_string(), governance.to_string()),
            None => ("infrastructure_error".to_string(), format!("{err:#}")),
        };

        error!(run_id = %context.run_id, error_code = %code, error = %message, "run aborted");

        let run = RunRecord {
            run_id: context.run_id,
            snapshot: context.request.snapshot.clone(),
            tiers: context.tiers.to_vec(),
            started_at: context.started_at,
            ended_at: now_utc(),
            status: RunStatus::Aborted,
            gate_state: None,
            error_code: Some(code),
            error_message: Some(message),
            engine_version: context.request.engine_version.clone(),
            config_json: serde_json::to_value(&context.request.config)
                .unwrap_or(serde_json::Value::Null),
        };
        if let Err(store_err) = self.store.record_aborted_run(&run) {
            warn!(run_id = %context.run_id, error = %store_err, "failed to record aborted run");
        }
        err
    }
}

struct RunContext<'r> {
    run_id: RunId,
    request: &'r RunRequest,
    tiers: &'r [Tier],
    started_at: DateTimeUtc,
}

fn publish_report(report: &EscalationReport, sinks: &[&dyn ReportSink]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let path = sink
            .write_report(report)
            .with_context(|| format!("report sink {} failed", sink.sink_name()))?;
        paths.push(path);
    }
    Ok(paths)
}

fn analyze_catalog(catalog: &Catalog, verdicts: &[Verdict]) -> Vec<ConflictRecord> {
    let protected: Vec<&TestArtifact> = catalog.by_tier(Tier::Protected).collect();
    let candidate: Vec<&TestArtifact> = catalog.by_tier(Tier::Candidate).collect();
    analyze(&protected, &candidate, verdicts)
}

fn first_observed_baselines(run_id: RunId, sources: &[(String, String)]) -> Vec<ProtectedBaseline> {
    let recorded_at = now_utc();
    sources
        .iter()
        .map(|(location, hash)| ProtectedBaseline {
            source_location: location.clone(),
            content_hash: hash.clone(),
            recorded_at,
            recorded_by: RUN_BASELINE_WRITER.to_string(),
            justification: format!("first observed in run {run_id}"),
        })
        .collect()
}
