//! Remote record source over a SQLite database laid out like the
//! underwriting system: `isfiles`, `uwtasksdone`, `policies` and the
//! `pop_match_results` table this crate writes to.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};

use crate::pipeline::reconcile::{
    now_timestamp, CandidateQuery, PolicySnapshot, RecordSource, RemoteRow, SourceError,
    WriteBackPayload,
};

const REMOTE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS isfiles (
    ISFileID TEXT PRIMARY KEY,
    FilePath TEXT NOT NULL,
    DateCreated TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS uwtasksdone (
    TaskID INTEGER PRIMARY KEY AUTOINCREMENT,
    ISFileID TEXT NOT NULL,
    PolicyID TEXT,
    TaskComments TEXT NOT NULL,
    DateCreated TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS policies (
    PolicyID TEXT PRIMARY KEY,
    NamedInsured TEXT,
    EffectiveDate TEXT,
    ExpirationDate TEXT,
    AgentCode TEXT,
    PriorCarrier TEXT
);
";

const MATCH_TABLE: &str = "
CREATE TABLE IF NOT EXISTS pop_match_results (
    file_id TEXT PRIMARY KEY,
    policy_id TEXT,
    match_result TEXT NOT NULL,
    written_at TEXT NOT NULL
);
";

/// One row of `pop_match_results`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MatchResultRow {
    pub file_id: String,
    pub policy_id: Option<String>,
    pub match_result: String,
    pub written_at: String,
}

/// `RecordSource` backed by a SQLite file. The call timeout is the
/// connection's busy timeout.
pub struct SqliteRecordSource {
    conn: Mutex<Connection>,
    timeout: Duration,
}

impl SqliteRecordSource {
    /// Open an existing remote database. A missing file is a connection error.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, SourceError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SourceError::Connection(format!("{}: {e}", path.display())))?;
        let source = Self::with_connection(conn, timeout)?;
        source.ensure_match_table()?;
        Ok(source)
    }

    /// In-memory database with the full remote layout (for testing).
    pub fn open_in_memory() -> Result<Self, SourceError> {
        let conn = Connection::open_in_memory().map_err(|e| SourceError::Connection(e.to_string()))?;
        let source = Self::with_connection(conn, Duration::from_secs(5))?;
        source.ensure_remote_schema()?;
        Ok(source)
    }

    fn with_connection(conn: Connection, timeout: Duration) -> Result<Self, SourceError> {
        conn.busy_timeout(timeout).map_err(|e| map_sqlite_error(e, timeout))?;
        Ok(Self {
            conn: Mutex::new(conn),
            timeout,
        })
    }

    /// Create the task, file and policy tables when they do not exist.
    pub fn ensure_remote_schema(&self) -> Result<(), SourceError> {
        self.lock()?
            .execute_batch(REMOTE_SCHEMA)
            .map_err(|e| map_sqlite_error(e, self.timeout))?;
        self.ensure_match_table()
    }

    fn ensure_match_table(&self) -> Result<(), SourceError> {
        self.lock()?
            .execute_batch(MATCH_TABLE)
            .map_err(|e| map_sqlite_error(e, self.timeout))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SourceError> {
        self.conn
            .lock()
            .map_err(|_| SourceError::Connection("remote connection lock poisoned".into()))
    }

    /// Everything in `pop_match_results`, by file id.
    pub fn match_results(&self) -> Result<Vec<MatchResultRow>, SourceError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT file_id, policy_id, match_result, written_at
                 FROM pop_match_results ORDER BY file_id",
            )
            .map_err(|e| map_sqlite_error(e, self.timeout))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MatchResultRow {
                    file_id: row.get(0)?,
                    policy_id: row.get(1)?,
                    match_result: row.get(2)?,
                    written_at: row.get(3)?,
                })
            })
            .map_err(|e| map_sqlite_error(e, self.timeout))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| map_sqlite_error(e, self.timeout))?);
        }
        Ok(results)
    }
}

impl RecordSource for SqliteRecordSource {
    fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<RemoteRow>, SourceError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT f.ISFileID, f.FilePath, CAST(t.PolicyID AS TEXT), t.TaskComments, t.DateCreated
                 FROM uwtasksdone t
                 JOIN isfiles f ON f.ISFileID = t.ISFileID
                 WHERE substr(t.TaskComments, 1, length(?1)) = ?1
                   AND t.DateCreated > datetime('now', ?2)
                 ORDER BY t.DateCreated ASC, t.TaskID ASC",
            )
            .map_err(|e| map_sqlite_error(e, self.timeout))?;

        let window = format!("-{} days", query.lookback_days);
        let rows = stmt
            .query_map(params![query.comment_prefix, window], |row| {
                Ok(RemoteRow {
                    file_id: row.get(0)?,
                    file_path: row.get(1)?,
                    policy_id: row.get(2)?,
                    task_comment: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(|e| map_sqlite_error(e, self.timeout))?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row.map_err(|e| map_sqlite_error(e, self.timeout))?);
        }
        Ok(candidates)
    }

    fn fetch_policy(&self, policy_id: &str) -> Result<Option<PolicySnapshot>, SourceError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT CAST(PolicyID AS TEXT), CAST(NamedInsured AS TEXT), CAST(EffectiveDate AS TEXT),
                    CAST(ExpirationDate AS TEXT), CAST(AgentCode AS TEXT), CAST(PriorCarrier AS TEXT)
             FROM policies WHERE CAST(PolicyID AS TEXT) = ?1",
            params![policy_id.trim()],
            |row| {
                Ok(PolicySnapshot {
                    policy_id: row.get(0)?,
                    named_insured: row.get(1)?,
                    effective_date: row.get(2)?,
                    expiration_date: row.get(3)?,
                    agent_code: row.get(4)?,
                    prior_carrier: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| map_sqlite_error(e, self.timeout))
    }

    fn upsert_match_result(&self, payload: &WriteBackPayload) -> Result<(), SourceError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pop_match_results (file_id, policy_id, match_result, written_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_id) DO UPDATE SET
                 policy_id = excluded.policy_id,
                 match_result = excluded.match_result",
            params![
                payload.document_id,
                payload.policy_id,
                payload.match_result.as_str(),
                now_timestamp(),
            ],
        )
        .map_err(|e| map_sqlite_error(e, self.timeout))?;
        Ok(())
    }
}

fn map_sqlite_error(e: rusqlite::Error, timeout: Duration) -> SourceError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => SourceError::Timeout(timeout),
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied) => {
            SourceError::Connection(e.to_string())
        }
        Some(ErrorCode::ConstraintViolation | ErrorCode::ReadOnly) => SourceError::Rejected(e.to_string()),
        _ => SourceError::Query(e.to_string()),
    }
}
