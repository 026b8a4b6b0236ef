#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use tiergate_domain::{
    ConflictRecord, GateDecision, ProtectedBaseline, RunId, RunRecord, Verdict,
};
use tiergate_report::EscalationReport;

/// Content hash recorded when an operator accepts the removal of a Protected
/// source. A retired location is no longer checked.
pub const RETIRED_CONTENT_HASH: &str = "retired";

/// Everything a decided run persists. Written in one transaction or not at
/// all.
#[derive(Debug, Clone, Copy)]
pub struct RunCommit<'a> {
    pub run: &'a RunRecord,
    pub verdicts: &'a [Verdict],
    pub conflicts: &'a [ConflictRecord],
    pub decision: &'a GateDecision,
    pub report: Option<&'a EscalationReport>,
    pub new_baselines: &'a [ProtectedBaseline],
}

pub trait AuditStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn commit_run(&self, commit: &RunCommit<'_>) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn record_aborted_run(&self, run: &RunRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_baseline(&self, baseline: &ProtectedBaseline) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_baselines(&self) -> Result<Vec<ProtectedBaseline>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_verdicts(&self, run_id: RunId) -> Result<Vec<Verdict>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_conflicts(&self, run_id: RunId) -> Result<Vec<ConflictRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_decision(&self, run_id: RunId) -> Result<Option<GateDecision>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_report(&self, run_id: RunId) -> Result<Option<EscalationReport>>;
}

/// Full audit view of one run, as printed by `audit show`.
#[derive(Debug, Clone, Serialize)]
pub struct RunAudit {
    pub run: RunRecord,
    pub verdicts: Vec<Verdict>,
    pub conflicts: Vec<ConflictRecord>,
    pub decision: Option<GateDecision>,
    pub has_report: bool,
}

/// Loads a run and everything recorded with it.
///
/// # Errors
/// Returns an error when the store cannot be read.
pub fn load_run_audit(store: &dyn AuditStore, run_id: RunId) -> Result<Option<RunAudit>> {
    let Some(run) = store.get_run(run_id)? else {
        return Ok(None);
    };
    Ok(Some(RunAudit {
        run,
        verdicts: store.get_verdicts(run_id)?,
        conflicts: store.get_conflicts(run_id)?,
        decision: store.get_decision(run_id)?,
        has_report: store.get_report(run_id)?.is_some(),
    }))
}

/// Location to hash map of the baselines still in force.
#[must_use]
pub fn baseline_hashes(baselines: &[ProtectedBaseline]) -> BTreeMap<String, String> {
    baselines
        .iter()
        .filter(|baseline| baseline.content_hash != RETIRED_CONTENT_HASH)
        .map(|baseline| {
            (
                baseline.source_location.clone(),
                baseline.content_hash.clone(),
            )
        })
        .collect()
}
