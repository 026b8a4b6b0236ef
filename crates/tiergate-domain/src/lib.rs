#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod config;

pub use config::{ConfigOverrides, GovernanceConfig, ENV_PREFIX};

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GovernanceError {
    #[error("discovery error: {0}")]
    Discovery(String),
    #[error("protected mutation detected at {location}: expected {expected}, found {actual}")]
    ProtectedMutationDetected {
        location: String,
        expected: String,
        actual: String,
    },
    #[error("test infrastructure error ({kind}): {message}")]
    TestInfra {
        kind: InfraErrorKind,
        message: String,
    },
    #[error("assertion failure in {artifact_id}: {message}")]
    AssertionFailure {
        artifact_id: String,
        message: String,
    },
    #[error("coverage computation error: {0}")]
    CoverageComputation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("run cancelled: {0}")]
    Cancelled(String),
}

impl GovernanceError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Discovery(_) => "discovery_error",
            Self::ProtectedMutationDetected { .. } => "protected_mutation_detected",
            Self::TestInfra { .. } => "test_infra_error",
            Self::AssertionFailure { .. } => "assertion_failure",
            Self::CoverageComputation(_) => "coverage_computation_error",
            Self::Configuration(_) => "configuration_error",
            Self::Validation(_) => "validation_error",
            Self::Execution(_) => "execution_error",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// Transient infrastructure errors are the only retriable class.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TestInfra { .. })
    }

    /// Errors that abort a run before a gate decision can be produced.
    #[must_use]
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Discovery(_)
                | Self::ProtectedMutationDetected { .. }
                | Self::Execution(_)
                | Self::Cancelled(_)
                | Self::Configuration(_)
                | Self::Validation(_)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InfraErrorKind {
    Timeout,
    EnvironmentSetup,
    Crashed,
}

impl InfraErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::EnvironmentSetup => "environment_setup",
            Self::Crashed => "crashed",
        }
    }
}

impl Display for InfraErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a run id from its ULID string form.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when the value is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, GovernanceError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| GovernanceError::Validation(format!("invalid run id {raw}: {err}")))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Builds an artifact id from a non-empty, trimmed string.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] for empty ids.
    pub fn new(raw: &str) -> Result<Self, GovernanceError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GovernanceError::Validation(
                "artifact id MUST be non-empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Protected,
    Candidate,
    Owned,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Protected, Tier::Candidate, Tier::Owned];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protected => "protected",
            Self::Candidate => "candidate",
            Self::Owned => "owned",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "protected" => Some(Self::Protected),
            "candidate" => Some(Self::Candidate),
            "owned" => Some(Self::Owned),
            _ => None,
        }
    }

    /// Protected sources are checksum-guarded and never written.
    #[must_use]
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Protected)
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Pass,
    Fail,
    Raises,
    Returns,
}

impl OutcomeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Raises => "raises",
            Self::Returns => "returns",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutcome {
    Pass,
    Fail,
    Raises(String),
    Returns(Value),
}

impl ExpectedOutcome {
    #[must_use]
    pub fn outcome_type(&self) -> OutcomeType {
        match self {
            Self::Pass => OutcomeType::Pass,
            Self::Fail => OutcomeType::Fail,
            Self::Raises(_) => OutcomeType::Raises,
            Self::Returns(_) => OutcomeType::Returns,
        }
    }

    /// Compares outcomes with returned values in canonical form.
    #[must_use]
    pub fn canonical_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Returns(lhs), Self::Returns(rhs)) => {
                canonical_string(lhs) == canonical_string(rhs)
            }
            (lhs, rhs) => lhs == rhs,
        }
    }
}

impl Display for ExpectedOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Fail => f.write_str("fail"),
            Self::Raises(name) => write!(f, "raises({name})"),
            Self::Returns(value) => write!(f, "returns({})", canonical_string(value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScenarioAssertion {
    pub scenario_key: String,
    #[serde(default)]
    pub inputs: Value,
    pub expected_outcome: ExpectedOutcome,
}

impl ScenarioAssertion {
    /// Ensures the scenario key is present.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] for a blank scenario key.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.scenario_key.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "scenario_key MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn canonical_inputs(&self) -> String {
        canonical_string(&self.inputs)
    }
}

/// A discovered test artifact. The tier is fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestArtifact {
    id: ArtifactId,
    tier: Tier,
    source_location: PathBuf,
    content_hash: String,
    command: Option<Vec<String>>,
    assertions: Vec<ScenarioAssertion>,
}

impl TestArtifact {
    /// Builds an artifact after validating its assertions.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when an assertion is invalid,
    /// a scenario key repeats inside the artifact, or the command is empty.
    pub fn new(
        id: ArtifactId,
        tier: Tier,
        source_location: PathBuf,
        content_hash: String,
        command: Option<Vec<String>>,
        assertions: Vec<ScenarioAssertion>,
    ) -> Result<Self, GovernanceError> {
        let mut seen = std::collections::BTreeSet::new();
        for assertion in &assertions {
            assertion.validate()?;
            if !seen.insert(assertion.scenario_key.as_str()) {
                return Err(GovernanceError::Validation(format!(
                    "artifact {id} repeats scenario_key {}",
                    assertion.scenario_key
                )));
            }
        }

        if let Some(argv) = &command {
            if argv.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(GovernanceError::Validation(format!(
                    "artifact {id} declares an empty command"
                )));
            }
        }

        Ok(Self {
            id,
            tier,
            source_location,
            content_hash,
            command,
            assertions,
        })
    }

    #[must_use]
    pub fn id(&self) -> &ArtifactId {
        &self.id
    }

    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[must_use]
    pub fn source_location(&self) -> &Path {
        &self.source_location
    }

    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    #[must_use]
    pub fn command(&self) -> Option<&[String]> {
        self.command.as_deref()
    }

    #[must_use]
    pub fn assertions(&self) -> &[ScenarioAssertion] {
        &self.assertions
    }

    pub fn scenario_keys(&self) -> impl Iterator<Item = &str> {
        self.assertions
            .iter()
            .map(|assertion| assertion.scenario_key.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Error,
}

impl VerdictStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub artifact_id: ArtifactId,
    pub tier: Tier,
    pub status: VerdictStatus,
    pub coverage_delta: f64,
    pub attempts: u32,
    pub detail: Option<String>,
}

/// Coverage result for one tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoverageFigure {
    Measured {
        covered_units: u64,
        total_units: u64,
        fraction: f64,
    },
    Unavailable {
        detail: String,
    },
}

impl CoverageFigure {
    #[must_use]
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Self::Measured { fraction, .. } => Some(*fraction),
            Self::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Hard,
    Soft,
}

impl ConflictSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hard" => Some(Self::Hard),
            "soft" => Some(Self::Soft),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TierExpectation {
    pub artifact_id: ArtifactId,
    pub assertion: ScenarioAssertion,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictEvidence {
    pub rule: String,
    pub protected_inputs: String,
    pub candidate_inputs: String,
    pub protected_outcome_type: OutcomeType,
    pub candidate_outcome_type: OutcomeType,
    pub protected_verdict: Option<VerdictStatus>,
    pub candidate_verdict: Option<VerdictStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictRecord {
    pub scenario_key: String,
    pub protected_expectation: TierExpectation,
    pub candidate_expectation: TierExpectation,
    pub evidence: ConflictEvidence,
    pub severity: ConflictSeverity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Green,
    Degraded,
    Blocked,
}

impl GateState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Degraded => "degraded",
            Self::Blocked => "blocked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "green" => Some(Self::Green),
            "degraded" => Some(Self::Degraded),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

impl Display for GateState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum GateReason {
    ProtectedVerdictFailed {
        artifact_id: ArtifactId,
        status: VerdictStatus,
    },
    HardConflict {
        scenario_key: String,
    },
    OwnedVerdictFailed {
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
    CandidateVerdictFailed {
        artifact_id: ArtifactId,
        status: VerdictStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateDecision {
    pub run_id: RunId,
    pub state: GateState,
    pub reasons: Vec<GateReason>,
    pub verdict_set_hash: String,
    pub conflict_set_hash: String,
    pub coverage: Option<f64>,
    pub coverage_floor: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Decided,
    Aborted,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decided => "decided",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "decided" => Some(Self::Decided),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub snapshot: String,
    pub tiers: Vec<Tier>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: DateTimeUtc,
    pub status: RunStatus,
    pub gate_state: Option<GateState>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub engine_version: String,
    pub config_json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProtectedBaseline {
    pub source_location: String,
    pub content_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
    pub recorded_by: String,
    pub justification: String,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] when formatting fails.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, GovernanceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            GovernanceError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<DateTimeUtc, GovernanceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| GovernanceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(GovernanceError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rebuilds a JSON value with object keys sorted at every depth.
#[must_use]
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonical_json(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

#[must_use]
pub fn canonical_string(value: &Value) -> String {
    canonical_json(value).to_string()
}

/// Hash a JSON value in canonical key order with SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(&canonical_json(value))?;
    Ok(hash_bytes(&bytes))
}

/// Hash of a verdict set, independent of the order verdicts completed in.
///
/// # Errors
/// Returns an error if the verdicts cannot be serialized.
pub fn verdict_set_hash(verdicts: &[Verdict]) -> Result<String> {
    let mut ordered: Vec<&Verdict> = verdicts.iter().collect();
    ordered.sort_by(|lhs, rhs| {
        (lhs.tier, &lhs.artifact_id).cmp(&(rhs.tier, &rhs.artifact_id))
    });
    hash_json(&serde_json::to_value(ordered)?)
}

/// Hash of a conflict set in `(scenario_key, severity)` order.
///
/// # Errors
/// Returns an error if the conflicts cannot be serialized.
pub fn conflict_set_hash(conflicts: &[ConflictRecord]) -> Result<String> {
    let mut ordered: Vec<&ConflictRecord> = conflicts.iter().collect();
    ordered.sort_by(|lhs, rhs| {
        (&lhs.scenario_key, lhs.severity).cmp(&(&rhs.scenario_key, rhs.severity))
    });
    hash_json(&serde_json::to_value(ordered)?)
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}
