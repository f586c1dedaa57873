//! Extraction: send each `pending` document to the extraction API and
//! store the returned fields.

use std::time::Duration;

use super::error::ReconcileError;
use super::retry::{register_failure, RetryPolicy};
use super::traits::{ExtractionClient, StateStore};
use super::types::*;

/// Extract one `pending` record.
///
/// A response with every field empty still advances the record; matching
/// decides what an empty document means.
pub fn extract_record(
    store: &dyn StateStore,
    client: &dyn ExtractionClient,
    policy: &RetryPolicy,
    timeout: Duration,
    record: &DocumentRecord,
) -> Result<RecordOutcome, ReconcileError> {
    tracing::debug!(document_id = %record.document_id, attempt = record.attempt_count + 1, "Extracting");

    let output = match client.extract(&record.document_ref(), timeout) {
        Ok(output) => output,
        Err(failure) => {
            let error = ReconcileError::Extraction {
                document_id: record.document_id.clone(),
                message: failure.to_string(),
            };
            return register_failure(store, policy, record, &error.to_string());
        }
    };

    // `policy_id` stays the discovery-time id; the document's own id is
    // only ever read through `DocumentRecord::policy_key`.
    let patch = TransitionPatch {
        extracted_fields: Some(output.fields),
        ..TransitionPatch::default()
    };

    if !store.transition(
        &record.document_id,
        DocumentState::Pending,
        DocumentState::Extracted,
        &patch,
    )? {
        return Err(ReconcileError::StateConflict {
            document_id: record.document_id.clone(),
            expected: DocumentState::Pending,
        });
    }
    Ok(RecordOutcome::Advanced(DocumentState::Extracted))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::pipeline::reconcile::store::SqliteStateStore;

    struct TimesOut {
        calls: AtomicU32,
    }

    impl ExtractionClient for TimesOut {
        fn extract(&self, _doc: &DocumentRef, timeout: Duration) -> Result<ExtractionOutput, ExtractionFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExtractionFailure::new(
                ExtractionFailureKind::Timeout,
                format!("no response within {}s", timeout.as_secs()),
            ))
        }
    }

    struct Returns(ExtractedFields);

    impl ExtractionClient for Returns {
        fn extract(&self, _doc: &DocumentRef, _timeout: Duration) -> Result<ExtractionOutput, ExtractionFailure> {
            Ok(ExtractionOutput { fields: self.0.clone() })
        }
    }

    fn setup(policy_id: Option<&str>) -> SqliteStateStore {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .upsert_if_absent(
                "F1",
                &NewDocument {
                    file_path: "/pop/F1.pdf".into(),
                    policy_id: policy_id.map(str::to_string),
                    source_comment: "Proof of Prior - Auto".into(),
                    source_created_at: "2026-10-01 10:30:00".into(),
                },
            )
            .unwrap();
        store
    }

    fn immediate_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    #[test]
    fn success_stores_fields_and_advances() {
        let store = setup(None);
        let fields = ExtractedFields {
            policy_id: Field::Present("P-EXT".into()),
            named_insured: Field::Present("Jane Doe".into()),
            ..Default::default()
        };
        let record = store.get("F1").unwrap().unwrap();

        let outcome = extract_record(&store, &Returns(fields.clone()), &immediate_retry(), Duration::from_secs(5), &record).unwrap();
        assert_eq!(outcome, RecordOutcome::Advanced(DocumentState::Extracted));

        let record = store.get("F1").unwrap().unwrap();
        assert_eq!(record.state, DocumentState::Extracted);
        assert_eq!(record.extracted_fields, Some(fields));
        assert_eq!(record.policy_id, None);
        assert_eq!(record.policy_key(), Some(PolicyKey::FromDocument("P-EXT")));
    }

    #[test]
    fn discovery_policy_id_is_kept() {
        let store = setup(Some("P100"));
        let fields = ExtractedFields {
            policy_id: Field::Present("P-EXT".into()),
            ..Default::default()
        };
        let record = store.get("F1").unwrap().unwrap();
        extract_record(&store, &Returns(fields), &immediate_retry(), Duration::from_secs(5), &record).unwrap();
        let record = store.get("F1").unwrap().unwrap();
        assert_eq!(record.policy_key(), Some(PolicyKey::Discovered("P100")));
    }

    #[test]
    fn empty_fields_are_not_a_failure() {
        let store = setup(None);
        let record = store.get("F1").unwrap().unwrap();
        let outcome =
            extract_record(&store, &Returns(ExtractedFields::default()), &immediate_retry(), Duration::from_secs(5), &record).unwrap();
        assert_eq!(outcome, RecordOutcome::Advanced(DocumentState::Extracted));
    }

    #[test]
    fn repeated_timeouts_end_in_failed() {
        let store = setup(Some("P100"));
        let client = TimesOut { calls: AtomicU32::new(0) };
        let policy = immediate_retry();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let record = store.get("F1").unwrap().unwrap();
            outcomes.push(extract_record(&store, &client, &policy, Duration::from_secs(120), &record).unwrap());
        }
        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::Retrying { attempt: 1 },
                RecordOutcome::Retrying { attempt: 2 },
                RecordOutcome::Failed,
            ]
        );

        let record = store.get("F1").unwrap().unwrap();
        assert_eq!(record.state, DocumentState::Failed);
        assert!(record.last_error.as_deref().unwrap().contains("timeout"));
        // Failed records are never picked up again
        assert!(store.get_ready(DocumentState::Pending, &now_timestamp()).unwrap().is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }
}
