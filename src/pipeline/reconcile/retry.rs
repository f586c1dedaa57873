//! Retry scheduling shared by the extraction and write-back stages.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::error::ReconcileError;
use super::traits::StateStore;
use super::types::*;

/// Exponential backoff with a ceiling and an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_secs(config.retry_backoff_secs),
            max: Duration::from_secs(config.retry_backoff_max_secs),
        }
    }

    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// RFC 3339 time before which the record must not be picked up again.
    pub fn retry_after(&self, attempt: u32, now: DateTime<Utc>) -> String {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        format_timestamp(now + delay)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Count a failed attempt against a record still in `state`; once the budget
/// is spent the record moves to `Failed` with `error` as its last error.
pub fn register_failure(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    record: &DocumentRecord,
    error: &str,
) -> Result<RecordOutcome, ReconcileError> {
    let document_id = record.document_id.as_str();
    let state = record.state;
    let retry_after = policy.retry_after(record.attempt_count + 1, Utc::now());

    let attempts = match store.record_attempt_failure(document_id, state, error, &retry_after)? {
        Some(n) => n,
        None => return Ok(RecordOutcome::Skipped),
    };

    if policy.is_exhausted(attempts) {
        tracing::warn!(document_id, attempts, error, "Retries exhausted, marking failed");
        let moved = store.transition(
            document_id,
            state,
            DocumentState::Failed,
            &TransitionPatch::failure(error),
        )?;
        return Ok(if moved {
            RecordOutcome::Failed
        } else {
            RecordOutcome::Skipped
        });
    }

    tracing::warn!(document_id, attempt = attempts, error, "Attempt failed, will retry");
    Ok(RecordOutcome::Retrying { attempt: attempts })
}
