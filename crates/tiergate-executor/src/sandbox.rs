use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiergate_domain::{GovernanceError, TestArtifact};

use crate::CancellationToken;

/// Units of implementation code exercised by one artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CoverageSample {
    pub covered_units: BTreeSet<String>,
    pub total_units: u64,
}

impl CoverageSample {
    #[must_use]
    pub fn new<I, S>(covered: I, total_units: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            covered_units: covered.into_iter().map(Into::into).collect(),
            total_units,
        }
    }
}

/// One attempt at running one artifact in isolation.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub snapshot: &'a str,
    pub artifact: &'a TestArtifact,
    pub attempt: u32,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassedAttempt {
    pub coverage: Option<CoverageSample>,
}

/// Seam to the sandboxed execution collaborator.
///
/// `Ok` means every assertion held. A genuine failure is
/// [`GovernanceError::AssertionFailure`] and transient problems are
/// [`GovernanceError::TestInfra`]; any other error aborts the run.
pub trait SandboxExecutor: Send + Sync {
    fn executor_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<PassedAttempt, GovernanceError>;
}
