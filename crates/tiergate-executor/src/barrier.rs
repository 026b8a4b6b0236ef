use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, MutexGuard};
use tiergate_domain::{TestArtifact, Tier};

/// One lock per scenario key that appears in more than one tier.
///
/// Locks are always taken in key order so two artifacts sharing several keys
/// cannot deadlock.
#[derive(Debug, Default)]
pub struct ScenarioBarrier {
    locks: BTreeMap<String, Mutex<()>>,
}

impl ScenarioBarrier {
    #[must_use]
    pub fn for_artifacts<'a, I>(artifacts: I) -> Self
    where
        I: IntoIterator<Item = &'a TestArtifact>,
    {
        let mut tiers_by_key: BTreeMap<&str, BTreeSet<Tier>> = BTreeMap::new();
        for artifact in artifacts {
            for key in artifact.scenario_keys() {
                tiers_by_key.entry(key).or_default().insert(artifact.tier());
            }
        }

        let locks = tiers_by_key
            .into_iter()
            .filter(|(_, tiers)| tiers.len() > 1)
            .map(|(key, _)| (key.to_string(), Mutex::new(())))
            .collect();

        Self { locks }
    }

    #[must_use]
    pub fn shared_keys(&self) -> Vec<&str> {
        self.locks.keys().map(String::as_str).collect()
    }

    /// Blocks until every shared-key lock the artifact needs is held.
    #[must_use]
    pub fn acquire(&self, artifact: &TestArtifact) -> Vec<MutexGuard<'_, ()>> {
        let keys: BTreeSet<&str> = artifact.scenario_keys().collect();
        keys.into_iter()
            .filter_map(|key| self.locks.get(key))
            .map(|lock| lock.lock())
            .collect()
    }
}
