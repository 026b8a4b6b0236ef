use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use tiergate_domain::{ArtifactId, GovernanceError, InfraErrorKind};

use crate::{CoverageSample, ExecutionRequest, PassedAttempt, SandboxExecutor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedAttempt {
    Pass(Option<CoverageSample>),
    Fail(String),
    Infra(InfraErrorKind),
    Fatal(String),
}

/// Deterministic in-memory outcomes keyed by artifact id.
///
/// Each artifact has a sequence of attempt outcomes; attempts past the end of
/// the sequence repeat its last entry. Unscripted artifacts use the default.
#[derive(Debug)]
pub struct ScriptedExecutor {
    scripts: BTreeMap<ArtifactId, Vec<ScriptedAttempt>>,
    default_attempt: ScriptedAttempt,
    delay: Option<Duration>,
    calls: Mutex<Vec<(ArtifactId, u32)>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self {
            scripts: BTreeMap::new(),
            default_attempt: ScriptedAttempt::Pass(None),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default(mut self, attempt: ScriptedAttempt) -> Self {
        self.default_attempt = attempt;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn script(mut self, artifact_id: ArtifactId, attempts: Vec<ScriptedAttempt>) -> Self {
        self.scripts.insert(artifact_id, attempts);
        self
    }

    /// Every `(artifact, attempt)` pair executed so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<(ArtifactId, u32)> {
        self.calls.lock().clone()
    }

    fn attempt_for(&self, artifact_id: &ArtifactId, attempt: u32) -> &ScriptedAttempt {
        let Some(sequence) = self.scripts.get(artifact_id) else {
            return &self.default_attempt;
        };
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        sequence
            .get(index)
            .or_else(|| sequence.last())
            .unwrap_or(&self.default_attempt)
    }
}

impl SandboxExecutor for ScriptedExecutor {
    fn executor_name(&self) -> &'static str {
        "scripted"
    }

    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<PassedAttempt, GovernanceError> {
        let artifact_id = request.artifact.id();
        self.calls.lock().push((artifact_id.clone(), request.attempt));

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        match self.attempt_for(artifact_id, request.attempt) {
            ScriptedAttempt::Pass(coverage) => Ok(PassedAttempt {
                coverage: coverage.clone(),
            }),
            ScriptedAttempt::Fail(message) => Err(GovernanceError::AssertionFailure {
                artifact_id: artifact_id.to_string(),
                message: message.clone(),
            }),
            ScriptedAttempt::Infra(kind) => Err(GovernanceError::TestInfra {
                kind: *kind,
                message: format!("scripted {kind} on attempt {}", request.attempt),
            }),
            ScriptedAttempt::Fatal(message) => Err(GovernanceError::Execution(message.clone())),
        }
    }
}
