use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tiergate_domain::{ArtifactId, CoverageFigure, GovernanceError, Tier, Verdict};

/// Collects per-artifact coverage for one tier while workers run, then merges
/// in artifact-id order so deltas do not depend on scheduling.
#[derive(Debug)]
pub struct CoverageAggregator {
    tier: Tier,
    samples: Mutex<BTreeMap<ArtifactId, crate::CoverageSample>>,
    poisoned: Mutex<Option<String>>,
}

impl CoverageAggregator {
    #[must_use]
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            samples: Mutex::new(BTreeMap::new()),
            poisoned: Mutex::new(None),
        }
    }

    pub fn record(&self, artifact_id: ArtifactId, sample: crate::CoverageSample) {
        self.samples.lock().insert(artifact_id, sample);
    }

    /// Marks the tier's coverage as unusable. The first reason wins.
    pub fn poison(&self, detail: String) {
        let mut poisoned = self.poisoned.lock();
        if poisoned.is_none() {
            *poisoned = Some(detail);
        }
    }

    /// Merges the recorded samples and fills each verdict's `coverage_delta`.
    ///
    /// # Errors
    /// Returns [`GovernanceError::CoverageComputation`] when no sample was
    /// recorded, totals disagree, or a sample covers more than its total.
    #[allow(clippy::cast_precision_loss)]
    pub fn finish(self, verdicts: &mut [Verdict]) -> Result<CoverageFigure, GovernanceError> {
        let tier = self.tier;
        if let Some(detail) = self.poisoned.into_inner() {
            return Err(GovernanceError::CoverageComputation(detail));
        }
        let samples = self.samples.into_inner();

        let mut total_units: Option<u64> = None;
        let mut covered: BTreeSet<String> = BTreeSet::new();
        let mut new_units_by_artifact: BTreeMap<ArtifactId, usize> = BTreeMap::new();

        for (artifact_id, sample) in samples {
            if sample.total_units == 0 {
                return Err(GovernanceError::CoverageComputation(format!(
                    "{artifact_id} reported zero total units for the {tier} tier"
                )));
            }
            match total_units {
                Some(total) if total != sample.total_units => {
                    return Err(GovernanceError::CoverageComputation(format!(
                        "{artifact_id} reported {} total units, expected {total} for the {tier} tier",
                        sample.total_units
                    )));
                }
                _ => total_units = Some(sample.total_units),
            }
            if sample.covered_units.len() as u64 > sample.total_units {
                return Err(GovernanceError::CoverageComputation(format!(
                    "{artifact_id} covers more units than the reported total"
                )));
            }

            let before = covered.len();
            covered.extend(sample.covered_units);
            new_units_by_artifact.insert(artifact_id, covered.len() - before);
        }

        let Some(total) = total_units else {
            return Err(GovernanceError::CoverageComputation(format!(
                "no artifact in the {tier} tier reported coverage"
            )));
        };

        let covered_units = covered.len() as u64;
        if covered_units > total {
            return Err(GovernanceError::CoverageComputation(format!(
                "{tier} tier covers {covered_units} distinct units but reports only {total}"
            )));
        }

        for verdict in verdicts.iter_mut() {
            let added = new_units_by_artifact
                .get(&verdict.artifact_id)
                .copied()
                .unwrap_or(0);
            verdict.coverage_delta = added as f64 / total as f64;
        }

        Ok(CoverageFigure::Measured {
            covered_units,
            total_units: total,
            fraction: covered_units as f64 / total as f64,
        })
    }
}
