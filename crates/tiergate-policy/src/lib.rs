#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::Serialize;
use tiergate_domain::{
    conflict_set_hash, verdict_set_hash, ArtifactId, ConflictRecord, ConflictSeverity,
    CoverageFigure, GateDecision, GateReason, GateState, GovernanceError, RunId, Tier, Verdict,
    VerdictStatus,
};
use tracing::info;

/// Evidence fed into the gate state machine.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum GateSignal {
    ProtectedFailure {
        artifact_id: ArtifactId,
        status: VerdictStatus,
    },
    HardConflict {
        scenario_key: String,
    },
    OwnedFailure {
        artifact_id: ArtifactId,
        status: VerdictStatus,
    },
    CoverageBelowFloor {
        coverage: f64,
        floor: f64,
    },
    CoverageUnavailable {
        detail: String,
    },
    SoftConflict {
        scenario_key: String,
    },
    CandidateFailure {
        artifact_id: ArtifactId,
        status: VerdictStatus,
    },
}

impl GateSignal {
    /// Lowest state the signal forces the gate into.
    #[must_use]
    pub fn floor_state(&self) -> GateState {
        match self {
            Self::ProtectedFailure { .. } | Self::HardConflict { .. } => GateState::Blocked,
            Self::OwnedFailure { .. }
            | Self::CoverageBelowFloor { .. }
            | Self::CoverageUnavailable { .. } => GateState::Degraded,
            Self::SoftConflict { .. } | Self::CandidateFailure { .. } => GateState::Green,
        }
    }

    #[must_use]
    pub fn into_reason(self) -> GateReason {
        match self {
            Self::ProtectedFailure {
                artifact_id,
                status,
            } => GateReason::ProtectedVerdictFailed {
                artifact_id,
                status,
            },
            Self::HardConflict { scenario_key } => GateReason::HardConflict { scenario_key },
            Self::OwnedFailure {
                artifact_id,
                status,
            } => GateReason::OwnedVerdictFailed {
                artifact_id,
                status,
            },
            Self::CoverageBelowFloor { coverage, floor } => {
                GateReason::CoverageBelowFloor { coverage, floor }
            }
            Self::CoverageUnavailable { detail } => GateReason::CoverageUnavailable { detail },
            Self::SoftConflict { scenario_key } => GateReason::SoftConflict { scenario_key },
            Self::CandidateFailure {
                artifact_id,
                status,
            } => GateReason::CandidateVerdictFailed {
                artifact_id,
                status,
            },
        }
    }
}

/// One step of the gate state machine. States only move toward `Blocked`.
#[must_use]
pub fn transition(state: GateState, signal: &GateSignal) -> GateState {
    state.max(signal.floor_state())
}

/// Everything the gate needs for one run.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub run_id: RunId,
    pub protected_artifact_ids: Vec<&'a ArtifactId>,
    pub verdicts: &'a [Verdict],
    pub conflicts: &'a [ConflictRecord],
    /// `None` when the Owned tier was not part of the run.
    pub owned_coverage: Option<&'a CoverageFigure>,
    pub coverage_floor: f64,
    pub protected_mutation: Option<GovernanceError>,
}

/// Derives the gate signals in reason order: Protected failures, Hard
/// conflicts, Owned failures, coverage, Soft conflicts, Candidate failures.
#[must_use]
pub fn collect_signals(input: &GateInput<'_>) -> Vec<GateSignal> {
    let mut ordered: Vec<&Verdict> = input.verdicts.iter().collect();
    ordered.sort_by(|lhs, rhs| lhs.artifact_id.cmp(&rhs.artifact_id));

    let failed = |tier: Tier| {
        ordered
            .iter()
            .filter(move |verdict| verdict.tier == tier && !verdict.status.is_pass())
            .map(|verdict| (verdict.artifact_id.clone(), verdict.status))
            .collect::<Vec<_>>()
    };
    let conflicts = |severity: ConflictSeverity| {
        let mut keys: Vec<String> = input
            .conflicts
            .iter()
            .filter(|record| record.severity == severity)
            .map(|record| record.scenario_key.clone())
            .collect();
        keys.sort();
        keys
    };

    let mut signals = Vec::new();
    signals.extend(failed(Tier::Protected).into_iter().map(|(artifact_id, status)| {
        GateSignal::ProtectedFailure {
            artifact_id,
            status,
        }
    }));
    signals.extend(
        conflicts(ConflictSeverity::Hard)
            .into_iter()
            .map(|scenario_key| GateSignal::HardConflict { scenario_key }),
    );
    signals.extend(failed(Tier::Owned).into_iter().map(|(artifact_id, status)| {
        GateSignal::OwnedFailure {
            artifact_id,
            status,
        }
    }));
    signals.extend(coverage_signal(input.owned_coverage, input.coverage_floor));
    signals.extend(
        conflicts(ConflictSeverity::Soft)
            .into_iter()
            .map(|scenario_key| GateSignal::SoftConflict { scenario_key }),
    );
    signals.extend(failed(Tier::Candidate).into_iter().map(|(artifact_id, status)| {
        GateSignal::CandidateFailure {
            artifact_id,
            status,
        }
    }));
    signals
}

fn coverage_signal(coverage: Option<&CoverageFigure>, floor: f64) -> Option<GateSignal> {
    match coverage {
        None => Some(GateSignal::CoverageUnavailable {
            detail: "owned tier was not part of the run".to_string(),
        }),
        Some(CoverageFigure::Unavailable { detail }) => Some(GateSignal::CoverageUnavailable {
            detail: detail.clone(),
        }),
        Some(CoverageFigure::Measured { fraction, .. }) if *fraction < floor => {
            Some(GateSignal::CoverageBelowFloor {
                coverage: *fraction,
                floor,
            })
        }
        Some(CoverageFigure::Measured { .. }) => None,
    }
}

/// Every Protected artifact must carry exactly one Protected verdict.
fn ensure_complete_protected_verdicts(input: &GateInput<'_>) -> Result<(), GovernanceError> {
    let mut counts: BTreeMap<&ArtifactId, usize> = input
        .protected_artifact_ids
        .iter()
        .map(|id| (*id, 0))
        .collect();

    for verdict in input.verdicts.iter().filter(|v| v.tier == Tier::Protected) {
        match counts.get_mut(&verdict.artifact_id) {
            Some(count) => *count += 1,
            None => {
                return Err(GovernanceError::Validation(format!(
                    "verdict for unknown protected artifact {}",
                    verdict.artifact_id
                )));
            }
        }
    }

    if let Some((id, count)) = counts.iter().find(|(_, count)| **count != 1) {
        return Err(GovernanceError::Validation(format!(
            "incomplete protected verdict set: {id} has {count} verdicts"
        )));
    }
    Ok(())
}

/// Runs the gate state machine over a run's evidence.
///
/// # Errors
/// Returns [`GovernanceError::ProtectedMutationDetected`] when a mutation was
/// reported, and [`GovernanceError::Validation`] when the Protected verdict
/// set is incomplete or the evidence cannot be hashed. No decision is
/// produced in either case.
pub fn decide(input: &GateInput<'_>) -> Result<GateDecision, GovernanceError> {
    if let Some(mutation) = &input.protected_mutation {
        return Err(mutation.clone());
    }
    ensure_complete_protected_verdicts(input)?;

    let signals = collect_signals(input);
    let state = signals.iter().fold(GateState::Green, transition);

    let verdict_set_hash = verdict_set_hash(input.verdicts).map_err(|err| {
        GovernanceError::Validation(format!("failed to hash verdict set: {err}"))
    })?;
    let conflict_set_hash = conflict_set_hash(input.conflicts).map_err(|err| {
        GovernanceError::Validation(format!("failed to hash conflict set: {err}"))
    })?;

    info!(
        run_id = %input.run_id,
        state = state.as_str(),
        signals = signals.len(),
        "gate decided"
    );

    Ok(GateDecision {
        run_id: input.run_id,
        state,
        reasons: signals.into_iter().map(GateSignal::into_reason).collect(),
        verdict_set_hash,
        conflict_set_hash,
        coverage: input.owned_coverage.and_then(CoverageFigure::fraction),
        coverage_floor: input.coverage_floor,
    })
}
