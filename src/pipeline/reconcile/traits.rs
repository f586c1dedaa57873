//! Trait definitions for the reconciliation pipeline.
//!
//! Three traits define the module boundaries:
//! - StateStore: durable per-document state, the single source of truth
//! - RecordSource: the authoritative remote database
//! - ExtractionClient: the document field-extraction API

use std::time::Duration;

use super::error::ReconcileError;
use super::types::*;

/// Local durable state. `transition` is the only concurrency primitive:
/// it must be an atomic compare-and-swap on the state column.
pub trait StateStore: Send + Sync {
    /// Insert a `Pending` record unless the id is already tracked.
    /// Returns true when a record was created.
    fn upsert_if_absent(
        &self,
        document_id: &str,
        initial: &NewDocument,
    ) -> Result<bool, ReconcileError>;

    fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, ReconcileError>;

    fn get_by_state(&self, state: DocumentState) -> Result<Vec<DocumentRecord>, ReconcileError>;

    /// Records in `state` whose retry delay has elapsed at `now`.
    fn get_ready(
        &self,
        state: DocumentState,
        now: &str,
    ) -> Result<Vec<DocumentRecord>, ReconcileError>;

    /// Move a record from `from` to `to`, applying `patch`.
    /// Returns false without mutating anything when the record is no longer in `from`.
    fn transition(
        &self,
        document_id: &str,
        from: DocumentState,
        to: DocumentState,
        patch: &TransitionPatch,
    ) -> Result<bool, ReconcileError>;

    /// Count a failed attempt against a record still in `state`.
    /// Returns the new attempt count, or `None` if the record moved on.
    fn record_attempt_failure(
        &self,
        document_id: &str,
        state: DocumentState,
        error: &str,
        retry_after: &str,
    ) -> Result<Option<u32>, ReconcileError>;

    /// Set the approval flag on a record in `awaiting_approval`.
    fn approve(&self, document_id: &str) -> Result<bool, ReconcileError>;

    /// Operator override: put a `failed` record back to `pending`.
    fn reset_failed(&self, document_id: &str) -> Result<bool, ReconcileError>;
}

/// Remote authoritative store. Implementations enforce their own call timeout.
pub trait RecordSource: Send + Sync {
    /// Candidate task rows matching the comment prefix within the lookback window.
    fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<RemoteRow>, SourceError>;

    fn fetch_policy(&self, policy_id: &str) -> Result<Option<PolicySnapshot>, SourceError>;

    /// Keyed upsert on `document_id`. Applying the same payload twice must
    /// leave the remote side as applying it once.
    fn upsert_match_result(&self, payload: &WriteBackPayload) -> Result<(), SourceError>;
}

/// Failure talking to the remote source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// Document field extraction.
pub trait ExtractionClient: Send + Sync {
    fn extract(
        &self,
        document: &DocumentRef,
        timeout: Duration,
    ) -> Result<ExtractionOutput, ExtractionFailure>;
}
