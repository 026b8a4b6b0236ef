#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tiergate_audit_core::{AuditStore, RunCommit};
use tiergate_domain::{
    format_rfc3339, hash_json, now_utc, parse_rfc3339_utc, ArtifactId, ConflictRecord,
    DateTimeUtc, GateDecision, GateState, ProtectedBaseline, RunId, RunRecord, RunStatus, Tier,
    Verdict, VerdictStatus,
};
use tiergate_report::EscalationReport;
use tracing::{debug, info};

const AUDIT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  snapshot TEXT NOT NULL,
  tiers_json TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('decided','aborted')),
  gate_state TEXT CHECK (gate_state IS NULL OR gate_state IN ('green','degraded','blocked')),
  error_code TEXT,
  error_message TEXT,
  engine_version TEXT NOT NULL,
  config_json TEXT NOT NULL,
  CHECK (status <> 'decided' OR gate_state IS NOT NULL),
  CHECK (status <> 'aborted' OR (gate_state IS NULL AND error_code IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS run_verdicts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  artifact_id TEXT NOT NULL,
  tier TEXT NOT NULL CHECK (tier IN ('protected','candidate','owned')),
  status TEXT NOT NULL CHECK (status IN ('pass','fail','error')),
  coverage_delta REAL NOT NULL,
  attempts INTEGER NOT NULL,
  detail TEXT,
  UNIQUE(run_id, artifact_id),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS run_conflicts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  scenario_key TEXT NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('hard','soft')),
  protected_artifact_id TEXT NOT NULL,
  candidate_artifact_id TEXT NOT NULL,
  record_json TEXT NOT NULL,
  UNIQUE(run_id, ordinal),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS gate_decisions (
  run_id TEXT PRIMARY KEY,
  state TEXT NOT NULL CHECK (state IN ('green','degraded','blocked')),
  reasons_json TEXT NOT NULL,
  verdict_set_hash TEXT NOT NULL,
  conflict_set_hash TEXT NOT NULL,
  coverage REAL,
  coverage_floor REAL NOT NULL,
  decided_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS escalation_reports (
  run_id TEXT PRIMARY KEY,
  contract_version TEXT NOT NULL,
  report_json TEXT NOT NULL,
  report_hash TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS protected_baselines (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_location TEXT NOT NULL,
  content_hash TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  recorded_by TEXT NOT NULL,
  justification TEXT NOT NULL,
  run_id TEXT,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
CREATE INDEX IF NOT EXISTS idx_verdicts_run ON run_verdicts(run_id);
CREATE INDEX IF NOT EXISTS idx_conflicts_run_ordinal ON run_conflicts(run_id, ordinal);
CREATE INDEX IF NOT EXISTS idx_baselines_location ON protected_baselines(source_location, id);

CREATE TRIGGER IF NOT EXISTS trg_runs_no_update
BEFORE UPDATE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_run_verdicts_no_update
BEFORE UPDATE ON run_verdicts
BEGIN
  SELECT RAISE(FAIL, 'run_verdicts is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_run_verdicts_no_delete
BEFORE DELETE ON run_verdicts
BEGIN
  SELECT RAISE(FAIL, 'run_verdicts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_run_conflicts_no_update
BEFORE UPDATE ON run_conflicts
BEGIN
  SELECT RAISE(FAIL, 'run_conflicts is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_run_conflicts_no_delete
BEFORE DELETE ON run_conflicts
BEGIN
  SELECT RAISE(FAIL, 'run_conflicts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_gate_decisions_no_update
BEFORE UPDATE ON gate_decisions
BEGIN
  SELECT RAISE(FAIL, 'gate_decisions is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_gate_decisions_no_delete
BEFORE DELETE ON gate_decisions
BEGIN
  SELECT RAISE(FAIL, 'gate_decisions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_escalation_reports_no_update
BEFORE UPDATE ON escalation_reports
BEGIN
  SELECT RAISE(FAIL, 'escalation_reports is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_escalation_reports_no_delete
BEFORE DELETE ON escalation_reports
BEGIN
  SELECT RAISE(FAIL, 'escalation_reports is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_protected_baselines_no_update
BEFORE UPDATE ON protected_baselines
BEGIN
  SELECT RAISE(FAIL, 'protected_baselines is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_protected_baselines_no_delete
BEFORE DELETE ON protected_baselines
BEGIN
  SELECT RAISE(FAIL, 'protected_baselines is append-only');
END;
";

const RUN_COLUMNS: &str = "run_id, snapshot, tiers_json, started_at, ended_at, status,
    gate_state, error_code, error_message, engine_version, config_json";

pub struct SqliteAuditStore {
    conn: Connection,
}

impl SqliteAuditStore {
    /// Open or create a `SQLite` audit database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// In-memory store, used by tests and dry runs.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }
}

impl AuditStore for SqliteAuditStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply audit schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![AUDIT_SCHEMA_VERSION, rfc3339(now_utc())?],
            )
            .context("failed to record audit migration")?;

        Ok(())
    }

    fn commit_run(&self, commit: &RunCommit<'_>) -> Result<()> {
        let run_id = commit.run.run_id;
        if commit.run.status != RunStatus::Decided {
            return Err(anyhow!("run {run_id} is not decided; use record_aborted_run"));
        }
        if commit.decision.run_id != run_id {
            return Err(anyhow!(
                "decision belongs to run {}, not {run_id}",
                commit.decision.run_id
            ));
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin audit transaction")?;

        insert_run(&tx, commit.run)?;

        for verdict in commit.verdicts {
            tx.execute(
                "INSERT INTO run_verdicts(
                    run_id, artifact_id, tier, status, coverage_delta, attempts, detail
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id.to_string(),
                    verdict.artifact_id.as_str(),
                    verdict.tier.as_str(),
                    verdict.status.as_str(),
                    verdict.coverage_delta,
                    i64::from(verdict.attempts),
                    verdict.detail,
                ],
            )
            .with_context(|| format!("failed to insert verdict {}", verdict.artifact_id))?;
        }

        for (ordinal, conflict) in commit.conflicts.iter().enumerate() {
            tx.execute(
                "INSERT INTO run_conflicts(
                    run_id, ordinal, scenario_key, severity,
                    protected_artifact_id, candidate_artifact_id, record_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id.to_string(),
                    i64::try_from(ordinal).map_err(|_| anyhow!("conflict ordinal too large"))?,
                    conflict.scenario_key,
                    conflict.severity.as_str(),
                    conflict.protected_expectation.artifact_id.as_str(),
                    conflict.candidate_expectation.artifact_id.as_str(),
                    serde_json::to_string(conflict)?,
                ],
            )
            .with_context(|| format!("failed to insert conflict {}", conflict.scenario_key))?;
        }

        let decision = commit.decision;
        tx.execute(
            "INSERT INTO gate_decisions(
                run_id, state, reasons_json, verdict_set_hash, conflict_set_hash,
                coverage, coverage_floor, decided_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id.to_string(),
                decision.state.as_str(),
                serde_json::to_string(&decision.reasons)?,
                decision.verdict_set_hash,
                decision.conflict_set_hash,
                decision.coverage,
                decision.coverage_floor,
                rfc3339(commit.run.ended_at)?,
            ],
        )
        .context("failed to insert gate decision")?;

        if let Some(report) = commit.report {
            let value = serde_json::to_value(report).context("failed to encode report")?;
            tx.execute(
                "INSERT INTO escalation_reports(
                    run_id, contract_version, report_json, report_hash, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    report.contract_version,
                    serde_json::to_string(&value)?,
                    hash_json(&value)?,
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert escalation report")?;
        }

        for baseline in commit.new_baselines {
            insert_baseline(&tx, baseline, Some(run_id))?;
        }

        tx.commit().context("failed to commit audit transaction")?;
        info!(
            run_id = %run_id,
            verdicts = commit.verdicts.len(),
            conflicts = commit.conflicts.len(),
            baselines = commit.new_baselines.len(),
            "run committed to audit log"
        );
        Ok(())
    }

    fn record_aborted_run(&self, run: &RunRecord) -> Result<()> {
        if run.status != RunStatus::Aborted {
            return Err(anyhow!("run {} is not aborted", run.run_id));
        }
        insert_run(&self.conn, run)?;
        debug!(run_id = %run.run_id, error_code = ?run.error_code, "aborted run recorded");
        Ok(())
    }

    fn append_baseline(&self, baseline: &ProtectedBaseline) -> Result<()> {
        insert_baseline(&self.conn, baseline, None)
    }

    fn latest_baselines(&self) -> Result<Vec<ProtectedBaseline>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.source_location, b.content_hash, b.recorded_at, b.recorded_by, b.justification
             FROM protected_baselines b
             WHERE b.id = (
               SELECT MAX(latest.id) FROM protected_baselines latest
               WHERE latest.source_location = b.source_location
             )
             ORDER BY b.source_location ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ProtectedBaseline {
                source_location: row.get(0)?,
                content_hash: row.get(1)?,
                recorded_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
                recorded_by: row.get(3)?,
                justification: row.get(4)?,
            });
        }
        Ok(out)
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, run_id ASC"
        ))?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"))?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let run = match rows.next()? {
            Some(row) => Some(run_from_row(row)?),
            None => None,
        };
        Ok(run)
    }

    fn get_verdicts(&self, run_id: RunId) -> Result<Vec<Verdict>> {
        let mut stmt = self.conn.prepare(
            "SELECT artifact_id, tier, status, coverage_delta, attempts, detail
             FROM run_verdicts
             WHERE run_id = ?1
             ORDER BY id ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Verdict {
                artifact_id: ArtifactId::new(&row.get::<_, String>(0)?)?,
                tier: parse_tier(&row.get::<_, String>(1)?)?,
                status: parse_verdict_status(&row.get::<_, String>(2)?)?,
                coverage_delta: row.get(3)?,
                attempts: u32::try_from(row.get::<_, i64>(4)?)
                    .map_err(|_| anyhow!("attempt count out of range"))?,
                detail: row.get(5)?,
            });
        }
        out.sort_by(|lhs, rhs| (lhs.tier, &lhs.artifact_id).cmp(&(rhs.tier, &rhs.artifact_id)));
        Ok(out)
    }

    fn get_conflicts(&self, run_id: RunId) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json FROM run_conflicts WHERE run_id = ?1 ORDER BY ordinal ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            out.push(serde_json::from_str(&raw).context("invalid record_json")?);
        }
        Ok(out)
    }

    fn get_decision(&self, run_id: RunId) -> Result<Option<GateDecision>> {
        self.conn
            .query_row(
                "SELECT state, reasons_json, verdict_set_hash, conflict_set_hash,
                        coverage, coverage_floor
                 FROM gate_decisions WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, f64>(5)?,
                    ))
                },
            )
            .optional()?
            .map(
                |(state, reasons_json, verdict_set_hash, conflict_set_hash, coverage, floor)| -> Result<GateDecision> {
                    Ok(GateDecision {
                        run_id,
                        state: parse_gate_state(&state)?,
                        reasons: serde_json::from_str(&reasons_json)
                            .context("invalid reasons_json")?,
                        verdict_set_hash,
                        conflict_set_hash,
                        coverage,
                        coverage_floor: floor,
                    })
                },
            )
            .transpose()
    }

    fn get_report(&self, run_id: RunId) -> Result<Option<EscalationReport>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT report_json FROM escalation_reports WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|value| serde_json::from_str(&value).context("invalid report_json"))
            .transpose()
    }
}

fn insert_run(conn: &Connection, run: &RunRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO runs(
            run_id, snapshot, tiers_json, started_at, ended_at, status,
            gate_state, error_code, error_message, engine_version, config_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            run.run_id.to_string(),
            run.snapshot,
            serde_json::to_string(&run.tiers)?,
            rfc3339(run.started_at)?,
            rfc3339(run.ended_at)?,
            run.status.as_str(),
            run.gate_state.map(GateState::as_str),
            run.error_code,
            run.error_message,
            run.engine_version,
            serde_json::to_string(&run.config_json)?,
        ],
    )
    .with_context(|| format!("failed to insert run {}", run.run_id))?;
    Ok(())
}

fn insert_baseline(
    conn: &Connection,
    baseline: &ProtectedBaseline,
    run_id: Option<RunId>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO protected_baselines(
            source_location, content_hash, recorded_at, recorded_by, justification, run_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            baseline.source_location,
            baseline.content_hash,
            rfc3339(baseline.recorded_at)?,
            baseline.recorded_by,
            baseline.justification,
            run_id.map(|id| id.to_string()),
        ],
    )
    .with_context(|| format!("failed to record baseline for {}", baseline.source_location))?;
    Ok(())
}

fn run_from_row(row: &Row<'_>) -> Result<RunRecord> {
    let run_id_raw: String = row.get(0)?;
    let tiers_json: String = row.get(2)?;
    let config_json: String = row.get(10)?;
    Ok(RunRecord {
        run_id: RunId::parse(&run_id_raw)?,
        snapshot: row.get(1)?,
        tiers: serde_json::from_str(&tiers_json).context("invalid tiers_json")?,
        started_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
        ended_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        status: parse_run_status(&row.get::<_, String>(5)?)?,
        gate_state: row
            .get::<_, Option<String>>(6)?
            .map(|value| parse_gate_state(&value))
            .transpose()?,
        error_code: row.get(7)?,
        error_message: row.get(8)?,
        engine_version: row.get(9)?,
        config_json: serde_json::from_str(&config_json).context("invalid config_json")?,
    })
}

fn parse_run_status(value: &str) -> Result<RunStatus> {
    RunStatus::parse(value).ok_or_else(|| anyhow!("unknown run status: {value}"))
}

fn parse_gate_state(value: &str) -> Result<GateState> {
    GateState::parse(value).ok_or_else(|| anyhow!("unknown gate state: {value}"))
}

fn parse_tier(value: &str) -> Result<Tier> {
    Tier::parse(value).ok_or_else(|| anyhow!("unknown tier: {value}"))
}

fn parse_verdict_status(value: &str) -> Result<VerdictStatus> {
    VerdictStatus::parse(value).ok_or_else(|| anyhow!("unknown verdict status: {value}"))
}

fn rfc3339(value: DateTimeUtc) -> Result<String> {
    Ok(format_rfc3339(value)?)
}

fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    Ok(parse_rfc3339_utc(value)?)
}

#[cfg(test)]
mod tests {
    use super::SqliteAuditStore;
    use serde_json::json;
    use tiergate_audit_core::{baseline_hashes, load_run_audit, AuditStore, RunCommit};
    use tiergate_domain::{
        now_utc, ArtifactId, ConflictEvidence, ConflictRecord, ConflictSeverity,
        ExpectedOutcome, GateDecision, GateReason, GateState, OutcomeType, ProtectedBaseline,
        RunId, RunRecord, RunStatus, ScenarioAssertion, Tier, TierExpectation, Verdict,
        VerdictStatus,
    };
    use tiergate_report::build_report;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "tiergate-audit-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn id(raw: &str) -> ArtifactId {
        must(ArtifactId::new(raw))
    }

    fn fixture_store(name: &str) -> SqliteAuditStore {
        let store = must(SqliteAuditStore::open(&temp_db_path(name)));
        assert!(store.migrate().is_ok());
        store
    }

    fn fixture_run(run_id: RunId, status: RunStatus) -> RunRecord {
        let now = now_utc();
        let decided = status == RunStatus::Decided;
        RunRecord {
            run_id,
            snapshot: "git:abc123".to_string(),
            tiers: vec![Tier::Protected, Tier::Candidate],
            started_at: now,
            ended_at: now,
            status,
            gate_state: decided.then_some(GateState::Blocked),
            error_code: (!decided).then(|| "discovery_error".to_string()),
            error_message: (!decided).then(|| "root missing".to_string()),
            engine_version: "test".to_string(),
            config_json: json!({"coverage_floor": 0.8}),
        }
    }

    fn fixture_verdict(artifact: &str, tier: Tier, status: VerdictStatus) -> Verdict {
        Verdict {
            artifact_id: id(artifact),
            tier,
            status,
            coverage_delta: 0.25,
            attempts: 2,
            detail: (status != VerdictStatus::Pass).then(|| "boom".to_string()),
        }
    }

    fn fixture_conflict() -> ConflictRecord {
        let inputs = json!({"user": "a", "password": "bad"});
        ConflictRecord {
            scenario_key: "login_rejects_bad_password".to_string(),
            protected_expectation: TierExpectation {
                artifact_id: id("p-login"),
                assertion: ScenarioAssertion {
                    scenario_key: "login_rejects_bad_password".to_string(),
                    inputs: inputs.clone(),
                    expected_outcome: ExpectedOutcome::Fail,
                },
            },
            candidate_expectation: TierExpectation {
                artifact_id: id("c-login"),
                assertion: ScenarioAssertion {
                    scenario_key: "login_rejects_bad_password".to_string(),
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
                candidate_verdict: Some(VerdictStatus::Pass),
            },
            severity: ConflictSeverity::Hard,
        }
    }

    fn fixture_decision(run_id: RunId) -> GateDecision {
        GateDecision {
            run_id,
            state: GateState::Blocked,
            reasons: vec![GateReason::HardConflict {
                scenario_key: "login_rejects_bad_password".to_string(),
            }],
            verdict_set_hash: "v".repeat(64),
            conflict_set_hash: "c".repeat(64),
            coverage: Some(0.75),
            coverage_floor: 0.5,
        }
    }

    fn fixture_baseline(location: &str, hash: &str) -> ProtectedBaseline {
        ProtectedBaseline {
            source_location: location.to_string(),
            content_hash: hash.to_string(),
            recorded_at: now_utc(),
            recorded_by: "tiergate-run".to_string(),
            justification: "first observation".to_string(),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store("migrate");
        assert!(store.migrate().is_ok());

        let versions: i64 = must(store.conn.query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ));
        assert_eq!(versions, 1);
    }

    #[test]
    fn committed_run_round_trips() {
        let store = fixture_store("round-trip");
        let run_id = RunId::new();
        let run = fixture_run(run_id, RunStatus::Decided);
        let verdicts = vec![
            fixture_verdict("p-login", Tier::Protected, VerdictStatus::Pass),
            fixture_verdict("c-login", Tier::Candidate, VerdictStatus::Fail),
        ];
        let conflicts = vec![fixture_conflict()];
        let decision = fixture_decision(run_id);
        let report = must(build_report(&decision, &conflicts, &verdicts));
        let baselines = vec![fixture_baseline("auth/login.yaml", "aaa")];

        assert!(store
            .commit_run(&RunCommit {
                run: &run,
                verdicts: &verdicts,
                conflicts: &conflicts,
                decision: &decision,
                report: Some(&report),
                new_baselines: &baselines,
            })
            .is_ok());

        let loaded = must(store.get_run(run_id));
        assert_eq!(loaded.as_ref().map(|run| run.gate_state), Some(Some(GateState::Blocked)));
        assert_eq!(loaded.map(|run| run.tiers), Some(vec![Tier::Protected, Tier::Candidate]));

        let loaded_verdicts = must(store.get_verdicts(run_id));
        assert_eq!(loaded_verdicts, verdicts);
        assert_eq!(must(store.get_conflicts(run_id)), conflicts);
        assert_eq!(must(store.get_decision(run_id)), Some(decision));
        assert_eq!(must(store.get_report(run_id)), Some(report));

        let audit = must(load_run_audit(&store, run_id));
        assert!(audit.as_ref().is_some_and(|audit| audit.has_report));
        assert_eq!(
            baseline_hashes(&must(store.latest_baselines())).get("auth/login.yaml"),
            Some(&"aaa".to_string())
        );
    }

    #[test]
    fn failed_commit_leaves_nothing_behind() {
        let store = fixture_store("atomic");
        let run_id = RunId::new();
        let run = fixture_run(run_id, RunStatus::Decided);
        let duplicate = fixture_verdict("p-login", Tier::Protected, VerdictStatus::Pass);
        let verdicts = vec![duplicate.clone(), duplicate];
        let decision = fixture_decision(run_id);
        let baselines = vec![fixture_baseline("auth/login.yaml", "aaa")];

        let committed = store.commit_run(&RunCommit {
            run: &run,
            verdicts: &verdicts,
            conflicts: &[],
            decision: &decision,
            report: None,
            new_baselines: &baselines,
        });
        assert!(committed.is_err());
        assert!(must(store.get_run(run_id)).is_none());
        assert!(must(store.get_verdicts(run_id)).is_empty());
        assert!(must(store.latest_baselines()).is_empty());
    }

    #[test]
    fn aborted_runs_record_no_decision() {
        let store = fixture_store("aborted");
        let run_id = RunId::new();
        assert!(store
            .record_aborted_run(&fixture_run(run_id, RunStatus::Aborted))
            .is_ok());

        let run = must(store.get_run(run_id));
        assert_eq!(
            run.as_ref().and_then(|run| run.error_code.as_deref()),
            Some("discovery_error")
        );
        assert!(must(store.get_decision(run_id)).is_none());
        assert!(must(store.get_verdicts(run_id)).is_empty());

        assert!(store
            .record_aborted_run(&fixture_run(RunId::new(), RunStatus::Decided))
            .is_err());
        assert_eq!(must(store.list_runs()).len(), 1);
    }

    #[test]
    fn audit_tables_are_append_only() {
        let store = fixture_store("append-only");
        let run_id = RunId::new();
        let run = fixture_run(run_id, RunStatus::Decided);
        let verdicts = vec![fixture_verdict("p-login", Tier::Protected, VerdictStatus::Pass)];
        let decision = fixture_decision(run_id);
        assert!(store
            .commit_run(&RunCommit {
                run: &run,
                verdicts: &verdicts,
                conflicts: &[],
                decision: &decision,
                report: None,
                new_baselines: &[],
            })
            .is_ok());
        assert!(store
            .append_baseline(&fixture_baseline("auth/login.yaml", "aaa"))
            .is_ok());

        assert!(store
            .conn
            .execute("UPDATE run_verdicts SET status = 'fail'", [])
            .is_err());
        assert!(store.conn.execute("DELETE FROM gate_decisions", []).is_err());
        assert!(store
            .conn
            .execute("UPDATE runs SET gate_state = 'green'", [])
            .is_err());
        assert!(store
            .conn
            .execute("UPDATE protected_baselines SET content_hash = 'x'", [])
            .is_err());
    }

    #[test]
    fn latest_baseline_per_location_wins() {
        let store = fixture_store("baselines");
        for baseline in [
            fixture_baseline("auth/login.yaml", "aaa"),
            fixture_baseline("billing/refund.yaml", "bbb"),
            fixture_baseline("auth/login.yaml", "ccc"),
        ] {
            assert!(store.append_baseline(&baseline).is_ok());
        }

        let latest = must(store.latest_baselines());
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].source_location, "auth/login.yaml");
        assert_eq!(latest[0].content_hash, "ccc");
        assert_eq!(latest[1].content_hash, "bbb");
    }
}
