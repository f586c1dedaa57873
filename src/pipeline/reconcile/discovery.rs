//! Discovery: find candidate task rows in the remote source and start
//! tracking the ones the local store has never seen.

use std::sync::atomic::{AtomicBool, Ordering};

use super::error::ReconcileError;
use super::traits::{RecordSource, StateStore};
use super::types::*;

/// Run one discovery pass. Known documents are left exactly as they are.
///
/// Any remote failure aborts the pass; rows already registered stay registered.
pub fn discover(
    store: &dyn StateStore,
    source: &dyn RecordSource,
    query: &CandidateQuery,
    cancel: &AtomicBool,
) -> Result<DiscoveryReport, ReconcileError> {
    let rows = source
        .find_candidates(query)
        .map_err(|e| ReconcileError::Connection(e.to_string()))?;

    let mut report = DiscoveryReport::default();
    for row in &rows {
        if cancel.load(Ordering::Relaxed) {
            return Err(ReconcileError::Cancelled);
        }
        report.rows_seen += 1;

        // The remote side may compare case-insensitively.
        if !is_candidate(row, &query.comment_prefix) {
            report.filtered_out += 1;
            continue;
        }

        if store.upsert_if_absent(row.file_id.trim(), &NewDocument::from(row))? {
            tracing::debug!(document_id = %row.file_id, "Tracking new document");
            report.created += 1;
        } else {
            report.already_known += 1;
        }
    }

    tracing::info!(
        rows = report.rows_seen,
        created = report.created,
        known = report.already_known,
        filtered = report.filtered_out,
        "Discovery complete"
    );
    Ok(report)
}

fn is_candidate(row: &RemoteRow, prefix: &str) -> bool {
    !row.file_id.trim().is_empty() && row.task_comment.starts_with(prefix)
}
