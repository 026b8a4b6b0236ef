#![forbid(unsafe_code)]

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tiergate_domain::{
    format_rfc3339, now_utc, ArtifactId, ConflictRecord, ConflictSeverity, GateDecision,
    GateReason, GateState, GovernanceError, RunId, Tier, Verdict, VerdictStatus,
};

mod sink;

pub use sink::{JsonFileSink, MarkdownFileSink, ReportSink};

pub const REPORT_CONTRACT_VERSION: &str = "tiergate.escalation_report.v1";

/// The three resolution paths offered for every escalated conflict. None is
/// ever selected by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResolutionOptions {
    pub adjust_candidate: String,
    pub deprecate_protected: String,
    pub promote_protected: String,
}

impl ResolutionOptions {
    #[must_use]
    pub fn for_conflict(conflict: &ConflictRecord) -> Self {
        let key = &conflict.scenario_key;
        let protected = &conflict.protected_expectation.artifact_id;
        let candidate = &conflict.candidate_expectation.artifact_id;
        Self {
            adjust_candidate: format!(
                "Adjust the Candidate expectation for scenario `{key}` in artifact `{candidate}` so it agrees with the Protected expectation."
            ),
            deprecate_protected: format!(
                "Deprecate or remove the Protected expectation for scenario `{key}` in artifact `{protected}` through the Protected suite's own change process."
            ),
            promote_protected: format!(
                "Promote the Protected expectation for scenario `{key}` from artifact `{protected}` into a mutable tier and merge it with the Candidate expectation from artifact `{candidate}`."
            ),
        }
    }

    #[must_use]
    pub fn as_list(&self) -> [&str; 3] {
        [
            self.adjust_candidate.as_str(),
            self.deprecate_protected.as_str(),
            self.promote_protected.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalatedConflict {
    pub conflict: ConflictRecord,
    pub resolution_options: ResolutionOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerdictEscalation {
    pub artifact_id: ArtifactId,
    pub tier: Tier,
    pub status: VerdictStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoverageNotice {
    BelowFloor { coverage: f64, floor: f64 },
    Unavailable { detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationReport {
    pub contract_version: String,
    pub run_id: RunId,
    pub generated_at: String,
    pub decision: GateDecision,
    pub conflicts: Vec<EscalatedConflict>,
    pub protected_failures: Vec<VerdictEscalation>,
    pub owned_failures: Vec<VerdictEscalation>,
    pub coverage_notice: Option<CoverageNotice>,
}

impl EscalationReport {
    #[must_use]
    pub fn hard_conflicts(&self) -> usize {
        self.conflicts
            .iter()
            .filter(|item| item.conflict.severity == ConflictSeverity::Hard)
            .count()
    }
}

/// Builds the escalation report for a non-Green decision.
///
/// Conflicts keep the analyzer's `(scenario_key, severity)` order.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] for a Green decision, which has
/// nothing to escalate.
pub fn build_report(
    decision: &GateDecision,
    conflicts: &[ConflictRecord],
    verdicts: &[Verdict],
) -> Result<EscalationReport, GovernanceError> {
    if decision.state == GateState::Green {
        return Err(GovernanceError::Validation(format!(
            "run {} is green; there is nothing to escalate",
            decision.run_id
        )));
    }

    let mut ordered = conflicts.to_vec();
    ordered.sort_by(|lhs, rhs| {
        (&lhs.scenario_key, lhs.severity).cmp(&(&rhs.scenario_key, rhs.severity))
    });

    let escalations = |tier: Tier| {
        let mut out: Vec<VerdictEscalation> = verdicts
            .iter()
            .filter(|verdict| verdict.tier == tier && !verdict.status.is_pass())
            .map(|verdict| VerdictEscalation {
                artifact_id: verdict.artifact_id.clone(),
                tier: verdict.tier,
                status: verdict.status,
                detail: verdict.detail.clone(),
            })
            .collect();
        out.sort_by(|lhs, rhs| lhs.artifact_id.cmp(&rhs.artifact_id));
        out
    };

    let coverage_notice = decision.reasons.iter().find_map(|reason| match reason {
        GateReason::CoverageBelowFloor { coverage, floor } => Some(CoverageNotice::BelowFloor {
            coverage: *coverage,
            floor: *floor,
        }),
        GateReason::CoverageUnavailable { detail } => Some(CoverageNotice::Unavailable {
            detail: detail.clone(),
        }),
        _ => None,
    });

    Ok(EscalationReport {
        contract_version: REPORT_CONTRACT_VERSION.to_string(),
        run_id: decision.run_id,
        generated_at: format_rfc3339(now_utc())?,
        decision: decision.clone(),
        conflicts: ordered
            .into_iter()
            .map(|conflict| EscalatedConflict {
                resolution_options: ResolutionOptions::for_conflict(&conflict),
                conflict,
            })
            .collect(),
        protected_failures: escalations(Tier::Protected),
        owned_failures: escalations(Tier::Owned),
        coverage_notice,
    })
}

/// Human-readable rendering of a report.
#[must_use]
pub fn render_markdown(report: &EscalationReport) -> String {
    let mut out = String::new();
    let decision = &report.decision;

    let _ = writeln!(out, "# Escalation report for run {}", report.run_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Gate state: **{}**", decision.state);
    let _ = writeln!(out, "- Generated at: {}", report.generated_at);
    let _ = writeln!(out, "- Verdict set hash: `{}`", decision.verdict_set_hash);
    let _ = writeln!(out, "- Conflict set hash: `{}`", decision.conflict_set_hash);
    match decision.coverage {
        Some(coverage) => {
            let _ = writeln!(
                out,
                "- Owned coverage: {:.1}% (floor {:.1}%)",
                coverage * 100.0,
                decision.coverage_floor * 100.0
            );
        }
        None => {
            let _ = writeln!(
                out,
                "- Owned coverage: unavailable (floor {:.1}%)",
                decision.coverage_floor * 100.0
            );
        }
    }

    if !report.protected_failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Protected failures");
        let _ = writeln!(out);
        for failure in &report.protected_failures {
            write_failure(&mut out, failure);
        }
    }

    if !report.conflicts.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Conflicts");
        for item in &report.conflicts {
            let conflict = &item.conflict;
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "### `{}` ({})",
                conflict.scenario_key,
                conflict.severity.as_str()
            );
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "- Protected `{}` expects {} for inputs `{}`",
                conflict.protected_expectation.artifact_id,
                conflict.protected_expectation.assertion.expected_outcome,
                conflict.evidence.protected_inputs
            );
            let _ = writeln!(
                out,
                "- Candidate `{}` expects {} for inputs `{}`",
                conflict.candidate_expectation.artifact_id,
                conflict.candidate_expectation.assertion.expected_outcome,
                conflict.evidence.candidate_inputs
            );
            let _ = writeln!(out, "- Rule: `{}`", conflict.evidence.rule);
            let _ = writeln!(out);
            let _ = writeln!(out, "Resolution options (none selected):");
            let _ = writeln!(out);
            for (index, option) in item.resolution_options.as_list().iter().enumerate() {
                let _ = writeln!(out, "{}. {option}", index + 1);
            }
        }
    }

    if let Some(notice) = &report.coverage_notice {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Coverage");
        let _ = writeln!(out);
        match notice {
            CoverageNotice::BelowFloor { coverage, floor } => {
                let _ = writeln!(
                    out,
                    "Owned coverage {:.1}% is below the {:.1}% floor.",
                    coverage * 100.0,
                    floor * 100.0
                );
            }
            CoverageNotice::Unavailable { detail } => {
                let _ = writeln!(out, "Owned coverage could not be computed: {detail}");
            }
        }
    }

    if !report.owned_failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Owned failures");
        let _ = writeln!(out);
        for failure in &report.owned_failures {
            write_failure(&mut out, failure);
        }
    }

    out
}

fn write_failure(out: &mut String, failure: &VerdictEscalation) {
    let _ = match &failure.detail {
        Some(detail) => writeln!(
            out,
            "- `{}`: {} ({detail})",
            failure.artifact_id,
            failure.status.as_str()
        ),
        None => writeln!(out, "- `{}`: {}", failure.artifact_id, failure.status.as_str()),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiergate_domain::{
        ConflictEvidence, ExpectedOutcome, OutcomeType, ScenarioAssertion, TierExpectation,
    };

    fn id(raw: &str) -> ArtifactId {
        ArtifactId::new(raw).unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn fixture_conflict(key: &str, severity: ConflictSeverity) -> ConflictRecord {
        let inputs = json!({"user": "a", "password": "bad"});
        ConflictRecord {
            scenario_key: key.to_string(),
            protected_expectation: TierExpectation {
                artifact_id: id("p-login"),
                assertion: ScenarioAssertion {
                    scenario_key: key.to_string(),
                    inputs: inputs.clone(),
                    expected_outcome: ExpectedOutcome::Fail,
                },
            },
            candidate_expectation: TierExpectation {
                artifact_id: id("c-login"),
                assertion: ScenarioAssertion {
                    scenario_key: key.to_string(),
                    inputs,
                    expected_outcome: ExpectedOutcome::Pass,
                },
            },
            evidence: ConflictEvidence {
                rule: "identical_inputs_divergent_outcome".to_string(),
                protected_inputs: r#"{"password":"bad","user":"a"}"#.to_string(),
                candidate_inputs: r#"{"password":"bad","user":"a"}"#.to_string(),
                protected_outcome_type: OutcomeType::Fail,
                candidate_outcome_type: OutcomeType::Pass,
                protected_verdict: Some(VerdictStatus::Pass),
                candidate_verdict: Some(VerdictStatus::Fail),
            },
            severity,
        }
    }

    pub(crate) fn fixture_decision(state: GateState, reasons: Vec<GateReason>) -> GateDecision {
        GateDecision {
            run_id: RunId::new(),
            state,
            reasons,
            verdict_set_hash: "v".repeat(64),
            conflict_set_hash: "c".repeat(64),
            coverage: Some(0.75),
            coverage_floor: 0.8,
        }
    }

    #[test]
    fn green_decisions_are_not_escalated() {
        let decision = fixture_decision(GateState::Green, Vec::new());
        assert!(matches!(
            build_report(&decision, &[], &[]),
            Err(GovernanceError::Validation(_))
        ));
    }

    #[test]
    fn every_conflict_carries_three_unselected_options() {
        let conflicts = [
            fixture_conflict("z_soft", ConflictSeverity::Soft),
            fixture_conflict("login_rejects_bad_password", ConflictSeverity::Hard),
        ];
        let decision = fixture_decision(
            GateState::Blocked,
            vec![GateReason::HardConflict {
                scenario_key: "login_rejects_bad_password".to_string(),
            }],
        );

        let report = build_report(&decision, &conflicts, &[]);
        assert!(report.is_ok());
        let report = report.unwrap_or_else(|_| unreachable!());

        assert_eq!(report.conflicts.len(), 2);
        assert_eq!(
            report.conflicts[0].conflict.scenario_key,
            "login_rejects_bad_password"
        );
        assert_eq!(report.hard_conflicts(), 1);
        for item in &report.conflicts {
            let options = item.resolution_options.as_list();
            assert_eq!(options.len(), 3);
            assert!(options.iter().all(|option| option.contains(&item.conflict.scenario_key)));
        }

        let value = serde_json::to_value(&report).unwrap_or_else(|_| unreachable!());
        let options = &value["conflicts"][0]["resolution_options"];
        assert_eq!(options.as_object().map(serde_json::Map::len), Some(3));
    }

    #[test]
    fn coverage_shortfall_and_failures_are_listed() {
        let decision = fixture_decision(
            GateState::Degraded,
            vec![GateReason::CoverageBelowFloor {
                coverage: 0.75,
                floor: 0.8,
            }],
        );
        let verdicts = [Verdict {
            artifact_id: id("o-signup"),
            tier: Tier::Owned,
            status: VerdictStatus::Fail,
            coverage_delta: 0.0,
            attempts: 1,
            detail: Some("expected 201".to_string()),
        }];

        let report = build_report(&decision, &[], &verdicts);
        assert!(report.is_ok());
        let report = report.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            report.coverage_notice,
            Some(CoverageNotice::BelowFloor {
                coverage: 0.75,
                floor: 0.8
            })
        );
        assert_eq!(report.owned_failures.len(), 1);
        assert!(report.protected_failures.is_empty());

        let markdown = render_markdown(&report);
        assert!(markdown.contains("Owned coverage 75.0% is below the 80.0% floor."));
        assert!(markdown.contains("`o-signup`: fail (expected 201)"));
    }

    #[test]
    fn markdown_spells_out_all_resolution_paths() {
        let conflicts = [fixture_conflict("login_rejects_bad_password", ConflictSeverity::Hard)];
        let decision = fixture_decision(GateState::Blocked, Vec::new());
        let report = build_report(&decision, &conflicts, &[]).unwrap_or_else(|_| unreachable!());

        let markdown = render_markdown(&report);
        assert!(markdown.contains("Resolution options (none selected):"));
        assert!(markdown.contains("1. Adjust the Candidate expectation"));
        assert!(markdown.contains("2. Deprecate or remove the Protected expectation"));
        assert!(markdown.contains("3. Promote the Protected expectation"));
    }
}
