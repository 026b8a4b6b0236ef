#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tiergate_domain::{
    CoverageFigure, GovernanceConfig, GovernanceError, TestArtifact, Tier, Verdict, VerdictStatus,
};
use tracing::{debug, info, warn};

mod barrier;
mod cancel;
mod coverage;
mod process;
mod sandbox;
mod scripted;

pub use barrier::ScenarioBarrier;
pub use cancel::CancellationToken;
pub use coverage::CoverageAggregator;
pub use process::ProcessExecutor;
pub use sandbox::{CoverageSample, ExecutionRequest, PassedAttempt, SandboxExecutor};
pub use scripted::{ScriptedAttempt, ScriptedExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSettings {
    pub concurrency_limit: usize,
    pub retry_bound: u32,
    pub timeout: Duration,
}

impl From<&GovernanceConfig> for ExecutionSettings {
    fn from(config: &GovernanceConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit.max(1),
            retry_bound: config.retry_bound,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// Verdicts and aggregate coverage for one tier of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TierExecution {
    pub tier: Tier,
    pub verdicts: Vec<Verdict>,
    pub coverage: CoverageFigure,
}

pub type IntegrityProbe<'a> = &'a (dyn Fn() -> Result<(), GovernanceError> + Sync);

/// Runs artifacts through a [`SandboxExecutor`] on a bounded worker pool.
pub struct ExecutionEngine<'a> {
    executor: &'a dyn SandboxExecutor,
    settings: ExecutionSettings,
    cancel: CancellationToken,
    integrity_probe: Option<IntegrityProbe<'a>>,
}

impl<'a> ExecutionEngine<'a> {
    #[must_use]
    pub fn new(executor: &'a dyn SandboxExecutor, settings: ExecutionSettings) -> Self {
        Self {
            executor,
            settings,
            cancel: CancellationToken::new(),
            integrity_probe: None,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Installs a check run after every artifact completes. A failure aborts
    /// the run.
    #[must_use]
    pub fn with_integrity_probe(mut self, probe: IntegrityProbe<'a>) -> Self {
        self.integrity_probe = Some(probe);
        self
    }

    /// Executes one tier's artifacts against `snapshot`.
    ///
    /// # Errors
    /// Returns a run-fatal [`GovernanceError`] (execution failure, cancellation
    /// or a detected Protected mutation). Verdict failures are not errors.
    pub fn execute(
        &self,
        tier: Tier,
        artifacts: &[&TestArtifact],
        snapshot: &str,
    ) -> Result<TierExecution, GovernanceError> {
        let mut results = self.execute_tiers(artifacts, &[tier], snapshot)?;
        results.pop().ok_or_else(|| {
            GovernanceError::Execution(format!("no result produced for the {tier} tier"))
        })
    }

    /// Executes several tiers on one pool. Artifacts sharing a scenario key
    /// across tiers are serialized; Protected artifacts are queued first.
    ///
    /// Results come back in `tiers` order with verdicts sorted by artifact id.
    ///
    /// # Errors
    /// Returns a run-fatal [`GovernanceError`]; partial verdicts are dropped.
    pub fn execute_tiers(
        &self,
        artifacts: &[&TestArtifact],
        tiers: &[Tier],
        snapshot: &str,
    ) -> Result<Vec<TierExecution>, GovernanceError> {
        let mut queued: Vec<&TestArtifact> = artifacts
            .iter()
            .copied()
            .filter(|artifact| tiers.contains(&artifact.tier()))
            .collect();
        queued.sort_by(|lhs, rhs| (lhs.tier(), lhs.id()).cmp(&(rhs.tier(), rhs.id())));

        let barrier = ScenarioBarrier::for_artifacts(queued.iter().copied());
        let mut aggregators: BTreeMap<Tier, CoverageAggregator> = tiers
            .iter()
            .map(|tier| (*tier, CoverageAggregator::new(*tier)))
            .collect();

        info!(
            snapshot,
            artifacts = queued.len(),
            workers = self.settings.concurrency_limit,
            shared_keys = barrier.shared_keys().len(),
            executor = self.executor.executor_name(),
            "execution started"
        );

        let completed = self.run_pool(queued, snapshot, &barrier, &aggregators)?;

        let mut by_tier: BTreeMap<Tier, Vec<Verdict>> = BTreeMap::new();
        for verdict in completed {
            by_tier.entry(verdict.tier).or_default().push(verdict);
        }

        let mut out = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let mut verdicts = by_tier.remove(tier).unwrap_or_default();
            verdicts.sort_by(|lhs, rhs| lhs.artifact_id.cmp(&rhs.artifact_id));

            let coverage = match aggregators.remove(tier) {
                Some(aggregator) => match aggregator.finish(&mut verdicts) {
                    Ok(figure) => figure,
                    Err(err) => {
                        debug!(tier = tier.as_str(), error = %err, "coverage unavailable");
                        CoverageFigure::Unavailable {
                            detail: err.to_string(),
                        }
                    }
                },
                None => CoverageFigure::Unavailable {
                    detail: format!("{tier} tier listed more than once"),
                },
            };

            out.push(TierExecution {
                tier: *tier,
                verdicts,
                coverage,
            });
        }

        Ok(out)
    }

    fn run_pool(
        &self,
        queued: Vec<&TestArtifact>,
        snapshot: &str,
        barrier: &ScenarioBarrier,
        aggregators: &BTreeMap<Tier, CoverageAggregator>,
    ) -> Result<Vec<Verdict>, GovernanceError> {
        let workers = self.settings.concurrency_limit.max(1).min(queued.len().max(1));
        let queue = Mutex::new(queued.into_iter().collect::<VecDeque<_>>());
        let completed = Mutex::new(Vec::new());
        let fatal: Mutex<Option<GovernanceError>> = Mutex::new(None);
        let abort = AtomicBool::new(false);

        let spawn_result = std::thread::scope(|scope| {
            for index in 0..workers {
                let spawned = std::thread::Builder::new()
                    .name(format!("tiergate-worker-{index}"))
                    .spawn_scoped(scope, || {
                        self.worker_loop(
                            snapshot, barrier, aggregators, &queue, &completed, &fatal, &abort,
                        );
                    });
                if let Err(err) = spawned {
                    abort.store(true, Ordering::SeqCst);
                    return Err(GovernanceError::Execution(format!(
                        "failed to spawn worker thread: {err}"
                    )));
                }
            }
            Ok(())
        });
        spawn_result?;

        if let Some(err) = fatal.into_inner() {
            warn!(code = err.code(), error = %err, "execution aborted");
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(GovernanceError::Cancelled(
                "run cancelled before all artifacts completed".to_string(),
            ));
        }

        Ok(completed.into_inner())
    }

    #[allow(clippy::too_many_arguments)]
    fn worker_loop(
        &self,
        snapshot: &str,
        barrier: &ScenarioBarrier,
        aggregators: &BTreeMap<Tier, CoverageAggregator>,
        queue: &Mutex<VecDeque<&TestArtifact>>,
        completed: &Mutex<Vec<Verdict>>,
        fatal: &Mutex<Option<GovernanceError>>,
        abort: &AtomicBool,
    ) {
        loop {
            if abort.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                return;
            }
            let Some(artifact) = queue.lock().pop_front() else {
                return;
            };

            let result = {
                let _guards = barrier.acquire(artifact);
                self.run_artifact(artifact, snapshot, aggregators.get(&artifact.tier()))
            };

            let result = result.and_then(|verdict| {
                if let Some(probe) = self.integrity_probe {
                    probe()?;
                }
                Ok(verdict)
            });

            match result {
                Ok(verdict) => completed.lock().push(verdict),
                Err(err) => {
                    abort.store(true, Ordering::SeqCst);
                    let mut slot = fatal.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    return;
                }
            }
        }
    }

    fn run_artifact(
        &self,
        artifact: &TestArtifact,
        snapshot: &str,
        aggregator: Option<&CoverageAggregator>,
    ) -> Result<Verdict, GovernanceError> {
        let max_attempts = self.settings.retry_bound.saturating_add(1);
        let mut last_infra: Option<GovernanceError> = None;

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(GovernanceError::Cancelled(format!(
                    "cancelled before {} attempt {attempt}",
                    artifact.id()
                )));
            }

            let request = ExecutionRequest {
                snapshot,
                artifact,
                attempt,
                timeout: self.settings.timeout,
                cancel: &self.cancel,
            };

            match self.executor.execute(&request) {
                Ok(passed) => {
                    if let (Some(sample), Some(aggregator)) = (passed.coverage, aggregator) {
                        aggregator.record(artifact.id().clone(), sample);
                    }
                    debug!(artifact_id = %artifact.id(), tier = artifact.tier().as_str(), attempt, "artifact passed");
                    return Ok(verdict(artifact, VerdictStatus::Pass, attempt, None));
                }
                Err(err @ GovernanceError::AssertionFailure { .. }) => {
                    info!(artifact_id = %artifact.id(), tier = artifact.tier().as_str(), attempt, "artifact failed");
                    return Ok(verdict(
                        artifact,
                        VerdictStatus::Fail,
                        attempt,
                        Some(err.to_string()),
                    ));
                }
                Err(GovernanceError::CoverageComputation(detail)) => {
                    if let Some(aggregator) = aggregator {
                        aggregator.poison(format!("{}: {detail}", artifact.id()));
                    }
                    return Ok(verdict(artifact, VerdictStatus::Pass, attempt, Some(detail)));
                }
                Err(err) if err.is_retriable() => {
                    warn!(
                        artifact_id = %artifact.id(),
                        tier = artifact.tier().as_str(),
                        attempt,
                        error = %err,
                        "transient infrastructure failure"
                    );
                    last_infra = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let detail = last_infra.map(|err| err.to_string());
        warn!(artifact_id = %artifact.id(), attempts = max_attempts, "retries exhausted");
        Ok(verdict(artifact, VerdictStatus::Error, max_attempts, detail))
    }
}

fn verdict(
    artifact: &TestArtifact,
    status: VerdictStatus,
    attempts: u32,
    detail: Option<String>,
) -> Verdict {
    Verdict {
        artifact_id: artifact.id().clone(),
        tier: artifact.tier(),
        status,
        coverage_delta: 0.0,
        attempts,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tiergate_domain::{ArtifactId, ExpectedOutcome, InfraErrorKind, ScenarioAssertion};

    fn id(raw: &str) -> ArtifactId {
        ArtifactId::new(raw).unwrap_or_else(|_| unreachable!())
    }

    fn artifact(raw: &str, tier: Tier, keys: &[&str]) -> TestArtifact {
        let assertions = keys
            .iter()
            .map(|key| ScenarioAssertion {
                scenario_key: (*key).to_string(),
                inputs: json!({"k": key}),
                expected_outcome: ExpectedOutcome::Pass,
            })
            .collect();
        match TestArtifact::new(
            id(raw),
            tier,
            PathBuf::from(format!("{raw}.json")),
            "hash".to_string(),
            None,
            assertions,
        ) {
            Ok(artifact) => artifact,
            Err(err) => panic!("{err}"),
        }
    }

    fn settings(retry_bound: u32) -> ExecutionSettings {
        ExecutionSettings {
            concurrency_limit: 4,
            retry_bound,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn transient_failures_are_retried_then_classified_as_error() {
        let artifacts = [
            artifact("p-flaky", Tier::Protected, &["a"]),
            artifact("p-broken", Tier::Protected, &["b"]),
        ];
        let executor = ScriptedExecutor::new()
            .script(
                id("p-flaky"),
                vec![
                    ScriptedAttempt::Infra(InfraErrorKind::Timeout),
                    ScriptedAttempt::Pass(None),
                ],
            )
            .script(
                id("p-broken"),
                vec![ScriptedAttempt::Infra(InfraErrorKind::EnvironmentSetup)],
            );
        let engine = ExecutionEngine::new(&executor, settings(2));
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let result = engine.execute(Tier::Protected, &refs, "snap");
        assert!(result.is_ok());
        let result = result.unwrap_or_else(|_| unreachable!());

        assert_eq!(result.verdicts[0].artifact_id, id("p-broken"));
        assert_eq!(result.verdicts[0].status, VerdictStatus::Error);
        assert_eq!(result.verdicts[0].attempts, 3);
        assert!(result.verdicts[0]
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("environment_setup")));

        assert_eq!(result.verdicts[1].status, VerdictStatus::Pass);
        assert_eq!(result.verdicts[1].attempts, 2);
    }

    /// Counts how many attempts are executing at the same moment.
    #[derive(Default)]
    struct InFlightExecutor {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl SandboxExecutor for InFlightExecutor {
        fn executor_name(&self) -> &'static str {
            "in_flight"
        }

        fn execute(&self, _request: &ExecutionRequest<'_>) -> Result<PassedAttempt, GovernanceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(25));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(PassedAttempt::default())
        }
    }

    #[test]
    fn worker_pool_never_exceeds_the_concurrency_limit() {
        let artifacts: Vec<TestArtifact> = (0..8)
            .map(|n| artifact(&format!("o{n}"), Tier::Owned, &[format!("k{n}").as_str()]))
            .collect();
        let executor = InFlightExecutor::default();
        let engine = ExecutionEngine::new(
            &executor,
            ExecutionSettings {
                concurrency_limit: 2,
                ..settings(0)
            },
        );
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let result = engine.execute(Tier::Owned, &refs, "snap");
        assert!(result.is_ok());
        assert_eq!(result.unwrap_or_else(|_| unreachable!()).verdicts.len(), 8);

        let max_seen = executor.max_seen.load(Ordering::SeqCst);
        assert!(max_seen <= 2, "saw {max_seen} artifacts in flight");
        assert!(max_seen > 1, "pool never ran artifacts in parallel");
    }

    #[test]
    fn failures_are_never_retried() {
        let artifacts = [artifact("o-fail", Tier::Owned, &["a"])];
        let executor = ScriptedExecutor::new().script(
            id("o-fail"),
            vec![ScriptedAttempt::Fail("expected 401".to_string())],
        );
        let engine = ExecutionEngine::new(&executor, settings(5));
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let result = engine.execute(Tier::Owned, &refs, "snap");
        assert!(result.is_ok());
        let result = result.unwrap_or_else(|_| unreachable!());
        assert_eq!(result.verdicts[0].status, VerdictStatus::Fail);
        assert_eq!(executor.calls().len(), 1);
    }

    #[test]
    fn owned_coverage_is_aggregated_per_tier() {
        let artifacts = [
            artifact("o1", Tier::Owned, &["a"]),
            artifact("o2", Tier::Owned, &["b"]),
            artifact("p1", Tier::Protected, &["c"]),
        ];
        let executor = ScriptedExecutor::new()
            .script(
                id("o1"),
                vec![ScriptedAttempt::Pass(Some(CoverageSample::new(["u1", "u2"], 8)))],
            )
            .script(
                id("o2"),
                vec![ScriptedAttempt::Pass(Some(CoverageSample::new(["u2", "u3", "u4"], 8)))],
            );
        let engine = ExecutionEngine::new(&executor, settings(0));
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let result = engine.execute_tiers(&refs, &[Tier::Protected, Tier::Owned], "snap");
        assert!(result.is_ok());
        let result = result.unwrap_or_else(|_| unreachable!());

        assert_eq!(result[0].tier, Tier::Protected);
        assert!(matches!(result[0].coverage, CoverageFigure::Unavailable { .. }));
        assert_eq!(result[1].coverage.fraction(), Some(0.5));
        assert!((result[1].verdicts[0].coverage_delta - 0.25).abs() < f64::EPSILON);
        assert!((result[1].verdicts[1].coverage_delta - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn repeated_runs_produce_identical_verdicts() {
        let artifacts: Vec<TestArtifact> = (0..12)
            .map(|n| artifact(&format!("p{n:02}"), Tier::Protected, &[format!("k{n}").as_str()]))
            .collect();
        let executor = ScriptedExecutor::new()
            .script(id("p03"), vec![ScriptedAttempt::Fail("no".to_string())])
            .with_delay(Duration::from_millis(1));
        let engine = ExecutionEngine::new(&executor, settings(1));
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let first = engine.execute(Tier::Protected, &refs, "snap");
        let second = engine.execute(Tier::Protected, &refs, "snap");
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(
            first.unwrap_or_else(|_| unreachable!()).verdicts,
            second.unwrap_or_else(|_| unreachable!()).verdicts
        );
    }

    #[test]
    fn fatal_executor_error_aborts_the_run() {
        let artifacts = [
            artifact("p1", Tier::Protected, &["a"]),
            artifact("p2", Tier::Protected, &["b"]),
        ];
        let executor = ScriptedExecutor::new()
            .script(id("p1"), vec![ScriptedAttempt::Fatal("sandbox gone".to_string())]);
        let engine = ExecutionEngine::new(&executor, settings(0));
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let result = engine.execute(Tier::Protected, &refs, "snap");
        assert!(matches!(result, Err(GovernanceError::Execution(_))));
    }

    #[test]
    fn cancelled_run_returns_no_verdicts() {
        let artifacts = [artifact("p1", Tier::Protected, &["a"])];
        let executor = ScriptedExecutor::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = ExecutionEngine::new(&executor, settings(0)).with_cancellation(cancel);
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let result = engine.execute(Tier::Protected, &refs, "snap");
        assert!(matches!(result, Err(GovernanceError::Cancelled(_))));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn integrity_probe_failure_aborts_with_mutation() {
        let artifacts = [
            artifact("p1", Tier::Protected, &["a"]),
            artifact("p2", Tier::Protected, &["b"]),
        ];
        let executor = ScriptedExecutor::new();
        let probes = AtomicUsize::new(0);
        let probe = || {
            if probes.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                Err(GovernanceError::ProtectedMutationDetected {
                    location: "p1.json".to_string(),
                    expected: "aa".to_string(),
                    actual: "bb".to_string(),
                })
            }
        };
        let engine = ExecutionEngine::new(
            &executor,
            ExecutionSettings {
                concurrency_limit: 1,
                ..settings(0)
            },
        )
        .with_integrity_probe(&probe);
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let result = engine.execute(Tier::Protected, &refs, "snap");
        assert!(matches!(
            result,
            Err(GovernanceError::ProtectedMutationDetected { .. })
        ));
    }

    #[test]
    fn protected_artifacts_are_dispatched_first() {
        let artifacts = [
            artifact("a-owned", Tier::Owned, &["x"]),
            artifact("z-protected", Tier::Protected, &["y"]),
        ];
        let executor = ScriptedExecutor::new();
        let engine = ExecutionEngine::new(
            &executor,
            ExecutionSettings {
                concurrency_limit: 1,
                ..settings(0)
            },
        );
        let refs: Vec<&TestArtifact> = artifacts.iter().collect();

        let result = engine.execute_tiers(&refs, &[Tier::Protected, Tier::Owned], "snap");
        assert!(result.is_ok());
        let calls = executor.calls();
        assert_eq!(calls[0].0, id("z-protected"));
    }
}
