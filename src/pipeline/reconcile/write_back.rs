//! Write-back: publish verified match results to the remote source.
//!
//! The remote upsert happens before the local transition. A crash between the
//! two leaves the record `matched` (or `awaiting_approval`) and the next cycle
//! repeats the keyed upsert, which the remote side absorbs.

use super::error::ReconcileError;
use super::retry::{register_failure, RetryPolicy};
use super::traits::{RecordSource, SourceError, StateStore};
use super::types::*;

/// Process one `matched` or approved `awaiting_approval` record.
pub fn write_back_record(
    store: &dyn StateStore,
    source: &dyn RecordSource,
    policy: &RetryPolicy,
    require_approval: bool,
    record: &DocumentRecord,
) -> Result<RecordOutcome, ReconcileError> {
    let document_id = record.document_id.as_str();

    match record.state {
        DocumentState::Matched if require_approval => {
            let moved = store.transition(
                document_id,
                DocumentState::Matched,
                DocumentState::AwaitingApproval,
                &TransitionPatch::default(),
            )?;
            if moved {
                tracing::info!(document_id, "Holding match for approval");
                return Ok(RecordOutcome::Advanced(DocumentState::AwaitingApproval));
            }
            return Ok(RecordOutcome::Skipped);
        }
        DocumentState::Matched => {}
        DocumentState::AwaitingApproval if record.approved => {}
        _ => return Ok(RecordOutcome::Skipped),
    }

    if record.match_result != Some(MatchVerdict::Matched) {
        let moved = store.transition(
            document_id,
            record.state,
            DocumentState::Failed,
            &TransitionPatch::failure("write-back requires a matched result"),
        )?;
        return Ok(if moved {
            RecordOutcome::Failed
        } else {
            RecordOutcome::Skipped
        });
    }

    let payload = WriteBackPayload {
        document_id: record.document_id.clone(),
        policy_id: record.lookup_policy_id().map(str::to_string),
        match_result: MatchVerdict::Matched,
    };

    match source.upsert_match_result(&payload) {
        Ok(()) => {}
        Err(SourceError::Connection(message)) => return Err(ReconcileError::Connection(message)),
        Err(SourceError::Rejected(message)) => {
            let error = ReconcileError::WriteConflict {
                document_id: record.document_id.clone(),
                message,
            };
            return register_failure(store, policy, record, &error.to_string());
        }
        Err(e) => return register_failure(store, policy, record, &e.to_string()),
    }

    if !store.transition(
        document_id,
        record.state,
        DocumentState::WrittenBack,
        &TransitionPatch::default(),
    )? {
        return Err(ReconcileError::StateConflict {
            document_id: record.document_id.clone(),
            expected: record.state,
        });
    }
    tracing::debug!(document_id, "Match result written back");
    Ok(RecordOutcome::Advanced(DocumentState::WrittenBack))
}
