use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tiergate_domain::{GovernanceError, InfraErrorKind};
use tracing::debug;
use ulid::Ulid;

use crate::{CoverageSample, ExecutionRequest, PassedAttempt, SandboxExecutor};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_TAIL_BYTES: u64 = 512;

#[derive(Debug, Deserialize)]
struct CoverageFile {
    covered_units: Vec<String>,
    total_units: u64,
}

/// Runs each artifact's `command` as a child process in a fresh scratch
/// directory per attempt.
///
/// Exit `0` passes and exit `1` fails. A timeout, a spawn or scratch setup
/// failure, or any other exit status is a transient infrastructure error.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    scratch_root: PathBuf,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
        }
    }
}

impl ProcessExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_scratch_root(scratch_root: PathBuf) -> Self {
        Self { scratch_root }
    }

    fn run_in(
        &self,
        scratch: &Path,
        request: &ExecutionRequest<'_>,
    ) -> Result<PassedAttempt, GovernanceError> {
        let artifact = request.artifact;
        let Some((program, args)) = artifact.command().and_then(<[String]>::split_first) else {
            return Err(infra(
                InfraErrorKind::EnvironmentSetup,
                format!("artifact {} declares no command", artifact.id()),
            ));
        };

        let coverage_path = scratch.join("coverage.json");
        let stderr_path = scratch.join("stderr.log");
        let stderr_file = File::create(&stderr_path).map_err(|err| {
            infra(
                InfraErrorKind::EnvironmentSetup,
                format!("failed to create stderr capture: {err}"),
            )
        })?;
        let assertions = serde_json::to_string(artifact.assertions()).map_err(|err| {
            GovernanceError::Execution(format!("failed to encode assertions: {err}"))
        })?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(scratch)
            .env("TIERGATE_SNAPSHOT", request.snapshot)
            .env("TIERGATE_ARTIFACT_ID", artifact.id().as_str())
            .env("TIERGATE_TIER", artifact.tier().as_str())
            .env("TIERGATE_COVERAGE_OUT", &coverage_path)
            .env("TIERGATE_ASSERTIONS", assertions)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|err| {
                infra(
                    InfraErrorKind::EnvironmentSetup,
                    format!("failed to spawn {program}: {err}"),
                )
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    reap(&mut child);
                    return Err(infra(
                        InfraErrorKind::Crashed,
                        format!("failed to poll child: {err}"),
                    ));
                }
            }
            if request.cancel.is_cancelled() {
                reap(&mut child);
                return Err(GovernanceError::Cancelled(format!(
                    "cancelled while running {}",
                    artifact.id()
                )));
            }
            if started.elapsed() >= request.timeout {
                reap(&mut child);
                return Err(infra(
                    InfraErrorKind::Timeout,
                    format!(
                        "{} exceeded {}ms",
                        artifact.id(),
                        request.timeout.as_millis()
                    ),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        debug!(artifact_id = %artifact.id(), code = ?status.code(), "child exited");
        classify_exit(status, &stderr_path, &coverage_path, request)
    }
}

impl SandboxExecutor for ProcessExecutor {
    fn executor_name(&self) -> &'static str {
        "process"
    }

    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<PassedAttempt, GovernanceError> {
        let scratch = self
            .scratch_root
            .join(format!("tiergate-scratch-{}", Ulid::new()));
        fs::create_dir_all(&scratch).map_err(|err| {
            infra(
                InfraErrorKind::EnvironmentSetup,
                format!("failed to create scratch dir {}: {err}", scratch.display()),
            )
        })?;

        let result = self.run_in(&scratch, request);
        let _ = fs::remove_dir_all(&scratch);
        result
    }
}

fn classify_exit(
    status: ExitStatus,
    stderr_path: &Path,
    coverage_path: &Path,
    request: &ExecutionRequest<'_>,
) -> Result<PassedAttempt, GovernanceError> {
    match status.code() {
        Some(0) => Ok(PassedAttempt {
            coverage: read_coverage(coverage_path)?,
        }),
        Some(1) => Err(GovernanceError::AssertionFailure {
            artifact_id: request.artifact.id().to_string(),
            message: stderr_tail(stderr_path).unwrap_or_else(|| "exit status 1".to_string()),
        }),
        Some(code) => Err(infra(
            InfraErrorKind::Crashed,
            format!("{} exited with status {code}", request.artifact.id()),
        )),
        None => Err(infra(
            InfraErrorKind::Crashed,
            format!("{} terminated by signal", request.artifact.id()),
        )),
    }
}

fn read_coverage(path: &Path) -> Result<Option<CoverageSample>, GovernanceError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(path).map_err(|err| {
        GovernanceError::CoverageComputation(format!("failed to read coverage output: {err}"))
    })?;
    let parsed: CoverageFile = serde_json::from_slice(&raw).map_err(|err| {
        GovernanceError::CoverageComputation(format!("malformed coverage output: {err}"))
    })?;
    Ok(Some(CoverageSample::new(
        parsed.covered_units,
        parsed.total_units,
    )))
}

fn stderr_tail(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(STDERR_TAIL_BYTES)))
        .ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    let text = String::from_utf8_lossy(&buf).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn infra(kind: InfraErrorKind, message: String) -> GovernanceError {
    GovernanceError::TestInfra { kind, message }
}

/// Kills the child and waits for it so no zombie outlives the attempt.
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
