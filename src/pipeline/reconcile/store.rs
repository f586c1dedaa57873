//! Local state store backed by the SQLite `document_records` table.
//!
//! Every state change is a single conditional `UPDATE … WHERE state = ?`
//! (compare-and-swap), logged to `state_transitions` in the same
//! transaction. Rows are never deleted.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::error::ReconcileError;
use super::traits::StateStore;
use super::types::*;
use crate::db::{self, DatabaseError};

const RECORD_COLUMNS: &str = "document_id, file_path, policy_id, source_comment, source_created_at,
     state, extracted_fields, match_result, match_report, approved, attempt_count,
     last_error, retry_after, created_at, updated_at";

/// SQLite-backed state store. One connection, serialized behind a mutex;
/// other processes may open the same file concurrently.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

/// One row of the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEntry {
    pub document_id: String,
    pub from_state: Option<DocumentState>,
    pub to_state: DocumentState,
    pub note: Option<String>,
    pub at: String,
}

impl SqliteStateStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Open (and migrate) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, ReconcileError> {
        Ok(Self::new(db::open_database(path)?))
    }

    pub fn open_in_memory() -> Result<Self, ReconcileError> {
        Ok(Self::new(db::open_memory_database()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ReconcileError> {
        self.conn
            .lock()
            .map_err(|_| ReconcileError::Database(DatabaseError::LockPoisoned))
    }

    /// All records, newest remote rows first.
    pub fn list_all(&self) -> Result<Vec<DocumentRecord>, ReconcileError> {
        let conn = self.lock()?;
        query_records(
            &conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM document_records
                 ORDER BY source_created_at DESC, document_id ASC"
            ),
            [],
        )
    }

    /// Number of records per state; states with no records are omitted.
    pub fn count_by_state(&self) -> Result<BTreeMap<String, u32>, ReconcileError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM document_records GROUP BY state ORDER BY state",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, count) = row?;
            counts.insert(state, count);
        }
        Ok(counts)
    }

    /// Audit trail for one document, oldest first.
    pub fn transitions_for(&self, document_id: &str) -> Result<Vec<TransitionEntry>, ReconcileError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT document_id, from_state, to_state, note, at
             FROM state_transitions WHERE document_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![document_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (document_id, from_state, to_state, note, at) = row?;
            entries.push(TransitionEntry {
                document_id,
                from_state: from_state.as_deref().map(parse_state).transpose()?,
                to_state: parse_state(&to_state)?,
                note,
                at,
            });
        }
        Ok(entries)
    }
}

impl StateStore for SqliteStateStore {
    fn upsert_if_absent(
        &self,
        document_id: &str,
        initial: &NewDocument,
    ) -> Result<bool, ReconcileError> {
        let now = now_timestamp();
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO document_records
             (document_id, file_path, policy_id, source_comment, source_created_at,
              state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                document_id,
                initial.file_path,
                initial.policy_id,
                initial.source_comment,
                initial.source_created_at,
                DocumentState::Pending.as_str(),
                now,
            ],
        )?;

        if inserted == 0 {
            return Ok(false);
        }

        log_transition(&tx, document_id, None, DocumentState::Pending, Some("discovered"), &now)?;
        tx.commit()?;
        Ok(true)
    }

    fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, ReconcileError> {
        let conn = self.lock()?;
        let mut records = query_records(
            &conn,
            &format!("SELECT {RECORD_COLUMNS} FROM document_records WHERE document_id = ?1"),
            params![document_id],
        )?;
        Ok(records.pop())
    }

    fn get_by_state(&self, state: DocumentState) -> Result<Vec<DocumentRecord>, ReconcileError> {
        let conn = self.lock()?;
        query_records(
            &conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM document_records
                 WHERE state = ?1 ORDER BY created_at ASC, document_id ASC"
            ),
            params![state.as_str()],
        )
    }

    fn get_ready(
        &self,
        state: DocumentState,
        now: &str,
    ) -> Result<Vec<DocumentRecord>, ReconcileError> {
        let conn = self.lock()?;
        query_records(
            &conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM document_records
                 WHERE state = ?1 AND (retry_after IS NULL OR retry_after <= ?2)
                 ORDER BY created_at ASC, document_id ASC"
            ),
            params![state.as_str(), now],
        )
    }

    fn transition(
        &self,
        document_id: &str,
        from: DocumentState,
        to: DocumentState,
        patch: &TransitionPatch,
    ) -> Result<bool, ReconcileError> {
        if !from.can_transition_to(to) {
            return Err(ReconcileError::InvalidTransition { from, to });
        }

        let extracted_json = patch
            .extracted_fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let report_json = patch
            .match_report
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = now_timestamp();

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        // The updated_at guard keeps a writer with a lagging clock from
        // overwriting a newer row.
        let changed = tx.execute(
            "UPDATE document_records
             SET state = ?3,
                 extracted_fields = COALESCE(?4, extracted_fields),
                 match_result = COALESCE(?5, match_result),
                 match_report = COALESCE(?6, match_report),
                 last_error = ?7,
                 attempt_count = CASE WHEN ?3 = 'failed' THEN attempt_count ELSE 0 END,
                 retry_after = NULL,
                 updated_at = ?8
             WHERE document_id = ?1 AND state = ?2 AND updated_at <= ?8",
            params![
                document_id,
                from.as_str(),
                to.as_str(),
                extracted_json,
                patch.match_result.map(|v| v.as_str()),
                report_json,
                patch.last_error,
                now,
            ],
        )?;

        if changed == 0 {
            return Ok(false);
        }

        log_transition(&tx, document_id, Some(from), to, patch.last_error.as_deref(), &now)?;
        tx.commit()?;
        Ok(true)
    }

    fn record_attempt_failure(
        &self,
        document_id: &str,
        state: DocumentState,
        error: &str,
        retry_after: &str,
    ) -> Result<Option<u32>, ReconcileError> {
        let now = now_timestamp();
        let conn = self.lock()?;
        let attempts = conn
            .query_row(
                "UPDATE document_records
                 SET attempt_count = attempt_count + 1,
                     last_error = ?3,
                     retry_after = ?4,
                     updated_at = ?5
                 WHERE document_id = ?1 AND state = ?2 AND updated_at <= ?5
                 RETURNING attempt_count",
                params![document_id, state.as_str(), error, retry_after, now],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        Ok(attempts)
    }

    fn approve(&self, document_id: &str) -> Result<bool, ReconcileError> {
        let now = now_timestamp();
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let changed = tx.execute(
            "UPDATE document_records SET approved = 1, updated_at = ?2
             WHERE document_id = ?1 AND state = 'awaiting_approval' AND updated_at <= ?2",
            params![document_id, now],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        log_transition(
            &tx,
            document_id,
            Some(DocumentState::AwaitingApproval),
            DocumentState::AwaitingApproval,
            Some("approved"),
            &now,
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn reset_failed(&self, document_id: &str) -> Result<bool, ReconcileError> {
        let now = now_timestamp();
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let changed = tx.execute(
            "UPDATE document_records
             SET state = 'pending',
                 extracted_fields = NULL,
                 match_result = NULL,
                 match_report = NULL,
                 approved = 0,
                 attempt_count = 0,
                 last_error = NULL,
                 retry_after = NULL,
                 updated_at = ?2
             WHERE document_id = ?1 AND state = 'failed'",
            params![document_id, now],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        log_transition(
            &tx,
            document_id,
            Some(DocumentState::Failed),
            DocumentState::Pending,
            Some("operator reset"),
            &now,
        )?;
        tx.commit()?;
        Ok(true)
    }
}

fn log_transition(
    conn: &Connection,
    document_id: &str,
    from: Option<DocumentState>,
    to: DocumentState,
    note: Option<&str>,
    at: &str,
) -> Result<(), ReconcileError> {
    conn.execute(
        "INSERT INTO state_transitions (document_id, from_state, to_state, note, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![document_id, from.map(|s| s.as_str()), to.as_str(), note, at],
    )?;
    Ok(())
}

// ═══════════════════════════════════════════
// Internal row mapping
// ═══════════════════════════════════════════

struct RecordRow {
    document_id: String,
    file_path: String,
    policy_id: Option<String>,
    source_comment: String,
    source_created_at: String,
    state: String,
    extracted_fields: Option<String>,
    match_result: Option<String>,
    match_report: Option<String>,
    approved: bool,
    attempt_count: u32,
    last_error: Option<String>,
    retry_after: Option<String>,
    created_at: String,
    updated_at: String,
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<DocumentRecord>, ReconcileError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok(RecordRow {
            document_id: row.get(0)?,
            file_path: row.get(1)?,
            policy_id: row.get(2)?,
            source_comment: row.get(3)?,
            source_created_at: row.get(4)?,
            state: row.get(5)?,
            extracted_fields: row.get(6)?,
            match_result: row.get(7)?,
            match_report: row.get(8)?,
            approved: row.get(9)?,
            attempt_count: row.get(10)?,
            last_error: row.get(11)?,
            retry_after: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    })?;

    let mut records = Vec::new();
    for row in rows {
        records.push(record_from_row(row?)?);
    }
    Ok(records)
}

fn parse_state(value: &str) -> Result<DocumentState, ReconcileError> {
    DocumentState::from_str(value).ok_or_else(|| {
        ReconcileError::Database(DatabaseError::InvalidEnum {
            field: "state".to_string(),
            value: value.to_string(),
        })
    })
}

fn record_from_row(row: RecordRow) -> Result<DocumentRecord, ReconcileError> {
    let state = parse_state(&row.state)?;
    let match_result = row
        .match_result
        .as_deref()
        .map(|v| {
            MatchVerdict::from_str(v).ok_or_else(|| {
                ReconcileError::Database(DatabaseError::InvalidEnum {
                    field: "match_result".to_string(),
                    value: v.to_string(),
                })
            })
        })
        .transpose()?;
    let extracted_fields = row
        .extracted_fields
        .as_deref()
        .map(serde_json::from_str::<ExtractedFields>)
        .transpose()?;
    let match_report = row
        .match_report
        .as_deref()
        .map(serde_json::from_str::<MatchReport>)
        .transpose()?;

    Ok(DocumentRecord {
        document_id: row.document_id,
        file_path: row.file_path,
        policy_id: row.policy_id,
        source_comment: row.source_comment,
        source_created_at: row.source_created_at,
        state,
        extracted_fields,
        match_result,
        match_report,
        approved: row.approved,
        attempt_count: row.attempt_count,
        last_error: row.last_error,
        retry_after: row.retry_after,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
