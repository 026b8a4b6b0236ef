#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::Serialize;
use tiergate_domain::{
    ArtifactId, ConflictEvidence, ConflictRecord, ConflictSeverity, ScenarioAssertion,
    TestArtifact, Tier, TierExpectation, Verdict, VerdictStatus,
};
use tracing::debug;

pub const RULE_IDENTICAL_INPUTS: &str = "identical_inputs_divergent_outcome";
pub const RULE_OUTCOME_TYPE_MISMATCH: &str = "divergent_inputs_outcome_type_mismatch";

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ConflictSummary {
    pub hard: usize,
    pub soft: usize,
}

impl ConflictSummary {
    #[must_use]
    pub fn from_records(records: &[ConflictRecord]) -> Self {
        records
            .iter()
            .fold(Self::default(), |mut summary, record| {
                match record.severity {
                    ConflictSeverity::Hard => summary.hard += 1,
                    ConflictSeverity::Soft => summary.soft += 1,
                }
                summary
            })
    }

    #[must_use]
    pub fn has_hard(&self) -> bool {
        self.hard > 0
    }
}

/// Cross-references Protected and Candidate expectations by scenario key.
///
/// Identical canonical inputs with different expected outcomes is a Hard
/// conflict. Different inputs with a different outcome type is Soft. The
/// result is sorted by `(scenario_key, severity)` and depends only on the
/// arguments, not on their order.
#[must_use]
pub fn analyze(
    protected: &[&TestArtifact],
    candidate: &[&TestArtifact],
    verdicts: &[Verdict],
) -> Vec<ConflictRecord> {
    let protected_by_key = index_by_key(protected, Tier::Protected);
    let candidate_by_key = index_by_key(candidate, Tier::Candidate);
    let verdict_status: BTreeMap<&ArtifactId, VerdictStatus> = verdicts
        .iter()
        .map(|verdict| (&verdict.artifact_id, verdict.status))
        .collect();

    let mut records = Vec::new();
    for (key, (protected_id, protected_assertion)) in protected_by_key {
        let Some(&(candidate_id, candidate_assertion)) = candidate_by_key.get(key) else {
            continue;
        };

        let protected_inputs = protected_assertion.canonical_inputs();
        let candidate_inputs = candidate_assertion.canonical_inputs();

        let (severity, rule) = if protected_inputs == candidate_inputs {
            if protected_assertion
                .expected_outcome
                .canonical_eq(&candidate_assertion.expected_outcome)
            {
                continue;
            }
            (ConflictSeverity::Hard, RULE_IDENTICAL_INPUTS)
        } else if protected_assertion.expected_outcome.outcome_type()
            != candidate_assertion.expected_outcome.outcome_type()
        {
            (ConflictSeverity::Soft, RULE_OUTCOME_TYPE_MISMATCH)
        } else {
            continue;
        };

        debug!(scenario_key = %key, severity = severity.as_str(), "conflict detected");

        records.push(ConflictRecord {
            scenario_key: key.to_string(),
            protected_expectation: TierExpectation {
                artifact_id: protected_id.clone(),
                assertion: protected_assertion.clone(),
            },
            candidate_expectation: TierExpectation {
                artifact_id: candidate_id.clone(),
                assertion: candidate_assertion.clone(),
            },
            evidence: ConflictEvidence {
                rule: rule.to_string(),
                protected_inputs,
                candidate_inputs,
                protected_outcome_type: protected_assertion.expected_outcome.outcome_type(),
                candidate_outcome_type: candidate_assertion.expected_outcome.outcome_type(),
                protected_verdict: verdict_status.get(protected_id).copied(),
                candidate_verdict: verdict_status.get(candidate_id).copied(),
            },
            severity,
        });
    }

    records.sort_by(|lhs, rhs| {
        (&lhs.scenario_key, lhs.severity).cmp(&(&rhs.scenario_key, rhs.severity))
    });
    records
}

/// Catalog validation keeps keys unique per tier. On a duplicate the lowest
/// artifact id wins.
fn index_by_key<'a>(
    artifacts: &[&'a TestArtifact],
    tier: Tier,
) -> BTreeMap<&'a str, (&'a ArtifactId, &'a ScenarioAssertion)> {
    let mut sorted: Vec<&'a TestArtifact> = artifacts
        .iter()
        .copied()
        .filter(|artifact| artifact.tier() == tier)
        .collect();
    sorted.sort_by(|lhs, rhs| lhs.id().cmp(rhs.id()));

    let mut out = BTreeMap::new();
    for artifact in sorted {
        for assertion in artifact.assertions() {
            out.entry(assertion.scenario_key.as_str())
                .or_insert((artifact.id(), assertion));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use tiergate_domain::ExpectedOutcome;

    fn artifact(id: &str, tier: Tier, assertions: Vec<(&str, Value, ExpectedOutcome)>) -> TestArtifact {
        let assertions = assertions
            .into_iter()
            .map(|(key, inputs, expected_outcome)| ScenarioAssertion {
                scenario_key: key.to_string(),
                inputs,
                expected_outcome,
            })
            .collect();
        let id = match ArtifactId::new(id) {
            Ok(id) => id,
            Err(err) => panic!("{err}"),
        };
        match TestArtifact::new(
            id.clone(),
            tier,
            PathBuf::from(format!("{id}.json")),
            "hash".to_string(),
            None,
            assertions,
        ) {
            Ok(artifact) => artifact,
            Err(err) => panic!("{err}"),
        }
    }

    #[test]
    fn identical_inputs_with_different_outcomes_is_hard() {
        let protected = artifact(
            "p-login",
            Tier::Protected,
            vec![(
                "login_rejects_bad_password",
                json!({"user": "a", "password": "bad"}),
                ExpectedOutcome::Fail,
            )],
        );
        let candidate = artifact(
            "c-login",
            Tier::Candidate,
            vec![(
                "login_rejects_bad_password",
                json!({"password": "bad", "user": "a"}),
                ExpectedOutcome::Pass,
            )],
        );
        let verdicts = vec![Verdict {
            artifact_id: protected.id().clone(),
            tier: Tier::Protected,
            status: VerdictStatus::Pass,
            coverage_delta: 0.0,
            attempts: 1,
            detail: None,
        }];

        let records = analyze(&[&protected], &[&candidate], &verdicts);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, ConflictSeverity::Hard);
        assert_eq!(records[0].evidence.rule, RULE_IDENTICAL_INPUTS);
        assert_eq!(records[0].evidence.protected_verdict, Some(VerdictStatus::Pass));
        assert_eq!(records[0].evidence.candidate_verdict, None);
        assert!(ConflictSummary::from_records(&records).has_hard());
    }

    #[test]
    fn different_inputs_with_outcome_type_mismatch_is_soft() {
        let protected = artifact(
            "p1",
            Tier::Protected,
            vec![("parse", json!({"raw": "1"}), ExpectedOutcome::Returns(json!(1)))],
        );
        let candidate = artifact(
            "c1",
            Tier::Candidate,
            vec![(
                "parse",
                json!({"raw": "x"}),
                ExpectedOutcome::Raises("ParseError".to_string()),
            )],
        );

        let records = analyze(&[&protected], &[&candidate], &[]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, ConflictSeverity::Soft);
        assert_eq!(
            ConflictSummary::from_records(&records),
            ConflictSummary { hard: 0, soft: 1 }
        );
    }

    #[test]
    fn reconcilable_and_unshared_keys_produce_nothing() {
        let protected = artifact(
            "p1",
            Tier::Protected,
            vec![
                ("parse", json!({"raw": "1"}), ExpectedOutcome::Returns(json!(1))),
                ("same", json!({}), ExpectedOutcome::Pass),
                ("only_protected", json!({}), ExpectedOutcome::Pass),
            ],
        );
        let candidate = artifact(
            "c1",
            Tier::Candidate,
            vec![
                ("parse", json!({"raw": "2"}), ExpectedOutcome::Returns(json!(2))),
                ("same", json!({}), ExpectedOutcome::Pass),
                ("only_candidate", json!({}), ExpectedOutcome::Fail),
            ],
        );

        assert!(analyze(&[&protected], &[&candidate], &[]).is_empty());
    }

    #[test]
    fn owned_artifacts_are_ignored() {
        let protected = artifact("p1", Tier::Protected, vec![("k", json!({}), ExpectedOutcome::Pass)]);
        let owned = artifact("o1", Tier::Owned, vec![("k", json!({}), ExpectedOutcome::Fail)]);
        assert!(analyze(&[&protected], &[&owned], &[]).is_empty());
    }

    fn outcome_from_code(code: u8) -> ExpectedOutcome {
        match code % 4 {
            0 => ExpectedOutcome::Pass,
            1 => ExpectedOutcome::Fail,
            2 => ExpectedOutcome::Raises("E".to_string()),
            _ => ExpectedOutcome::Returns(json!(code)),
        }
    }

    fn fixture_tiers(specs: &[(u8, u8, u8, u8)]) -> (Vec<TestArtifact>, Vec<TestArtifact>) {
        let mut protected = Vec::new();
        let mut candidate = Vec::new();
        for (index, (p_input, p_outcome, c_input, c_outcome)) in specs.iter().copied().enumerate() {
            let key = format!("k{index}");
            protected.push(artifact(
                &format!("p{index}"),
                Tier::Protected,
                vec![(key.as_str(), json!({"v": p_input % 3}), outcome_from_code(p_outcome))],
            ));
            candidate.push(artifact(
                &format!("c{index}"),
                Tier::Candidate,
                vec![(key.as_str(), json!({"v": c_input % 3}), outcome_from_code(c_outcome))],
            ));
        }
        (protected, candidate)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_analysis_is_idempotent_and_order_independent(
            specs in prop::collection::vec((0u8..6, 0u8..8, 0u8..6, 0u8..8), 0..24)
        ) {
            let (protected, candidate) = fixture_tiers(&specs);
            let protected_refs: Vec<&TestArtifact> = protected.iter().collect();
            let candidate_refs: Vec<&TestArtifact> = candidate.iter().collect();

            let first = analyze(&protected_refs, &candidate_refs, &[]);
            let second = analyze(&protected_refs, &candidate_refs, &[]);
            prop_assert_eq!(&first, &second);

            let reversed_protected: Vec<&TestArtifact> = protected.iter().rev().collect();
            let reversed_candidate: Vec<&TestArtifact> = candidate.iter().rev().collect();
            let reversed = analyze(&reversed_protected, &reversed_candidate, &[]);
            prop_assert_eq!(&first, &reversed);

            for record in &first {
                let identical = record.evidence.protected_inputs == record.evidence.candidate_inputs;
                prop_assert_eq!(identical, record.severity == ConflictSeverity::Hard);
            }
        }
    }
}
