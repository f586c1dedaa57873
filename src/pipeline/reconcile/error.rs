//! Error kinds for the reconciliation pipeline.
//!
//! `Extraction`, `AmbiguousMatch` and `WriteConflict` are recorded on the
//! record by the stage that hit them. `StateConflict` means another worker
//! moved the record first and counts as skipped. `Connection` and `Database`
//! abort the current stage only.

use thiserror::Error;

use crate::db::DatabaseError;

use super::types::DocumentState;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Remote source unreachable: {0}")]
    Connection(String),

    #[error("Extraction failed for {document_id}: {message}")]
    Extraction { document_id: String, message: String },

    #[error("No comparable fields for {document_id}: {diagnostics}")]
    AmbiguousMatch { document_id: String, diagnostics: String },

    #[error("Remote write-back rejected for {document_id}: {message}")]
    WriteConflict { document_id: String, message: String },

    #[error("Record {document_id} is no longer in state {expected}")]
    StateConflict { document_id: String, expected: DocumentState },

    #[error("Illegal transition {from} -> {to}")]
    InvalidTransition { from: DocumentState, to: DocumentState },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Reconciliation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReconcileError {
    /// Stage-level errors stop the current stage; everything else is
    /// handled against the individual record.
    pub fn is_stage_level(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Database(_) | Self::Json(_) | Self::Cancelled | Self::Config(_)
        )
    }
}

impl From<rusqlite::Error> for ReconcileError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}
