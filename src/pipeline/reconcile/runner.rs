//! Reconciler: runs Discovery → Extraction → Matching → Write-Back as one cycle.
//!
//! Each stage reads the records in the state it owns and hands them to a
//! bounded pool of scoped worker threads. Per-record failures are absorbed
//! into the record; a stage-level failure stops that stage only.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::discovery::discover;
use super::error::ReconcileError;
use super::extraction::extract_record;
use super::matching::match_record;
use super::retry::RetryPolicy;
use super::traits::*;
use super::types::*;
use super::write_back::write_back_record;
use crate::db::DatabaseError;

/// Owns the collaborators and settings for reconciliation cycles.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    source: Arc<dyn RecordSource>,
    client: Arc<dyn ExtractionClient>,
    config: ReconcileConfig,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        source: Arc<dyn RecordSource>,
        client: Arc<dyn ExtractionClient>,
        config: ReconcileConfig,
    ) -> Result<Self, ReconcileError> {
        config.validate().map_err(ReconcileError::Config)?;
        let retry = RetryPolicy::from_config(&config);
        Ok(Self {
            store,
            source,
            client,
            config,
            retry,
        })
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one full cycle. Never fails as a whole: stage errors are listed
    /// in the report and the remaining stages still run.
    pub fn run_cycle(&self, cancel: &AtomicBool) -> CycleReport {
        let start = Instant::now();
        let mut report = CycleReport::new(uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!("cycle", cycle_id = %report.cycle_id);
        let _enter = span.enter();

        tracing::info!("Reconciliation cycle starting");

        for stage in [Stage::Discovery, Stage::Extraction, Stage::Matching, Stage::WriteBack] {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }

            let result = match stage {
                Stage::Discovery => {
                    discover(&*self.store, &*self.source, &self.config.candidate_query(), cancel)
                        .map(|d| report.discovery = Some(d))
                }
                _ => self.run_stage(stage, cancel).map(|s| {
                    report.cancelled |= s.interrupted;
                    report.stages.push(s);
                }),
            };

            match result {
                Ok(()) => {}
                Err(ReconcileError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(stage = %stage, error = %e, "Stage aborted");
                    report.stage_errors.push((stage, e.to_string()));
                }
            }
            if report.cancelled {
                break;
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            cancelled = report.cancelled,
            stage_errors = report.stage_errors.len(),
            duration_ms = report.duration_ms,
            "Reconciliation cycle finished"
        );
        report
    }

    fn run_stage(&self, stage: Stage, cancel: &AtomicBool) -> Result<StageReport, ReconcileError> {
        let now = now_timestamp();
        let store = &*self.store;
        let source = &*self.source;

        let report = match stage {
            Stage::Extraction => {
                let records = store.get_ready(DocumentState::Pending, &now)?;
                let timeout = self.config.extraction_timeout();
                self.process_records(stage, records, cancel, |record| {
                    extract_record(store, &*self.client, &self.retry, timeout, record)
                })?
            }
            Stage::Matching => {
                let records = store.get_ready(DocumentState::Extracted, &now)?;
                self.process_records(stage, records, cancel, |record| {
                    match_record(store, source, &self.retry, record)
                })?
            }
            Stage::WriteBack => {
                let mut records = store.get_ready(DocumentState::Matched, &now)?;
                records.extend(
                    store
                        .get_ready(DocumentState::AwaitingApproval, &now)?
                        .into_iter()
                        .filter(|r| r.approved),
                );
                let require_approval = self.config.require_human_approval;
                self.process_records(stage, records, cancel, |record| {
                    write_back_record(store, source, &self.retry, require_approval, record)
                })?
            }
            Stage::Discovery => StageReport::new(stage),
        };

        tracing::info!(
            stage = %stage,
            examined = report.examined,
            advanced = report.advanced,
            retrying = report.retrying,
            failed = report.failed,
            skipped = report.skipped,
            interrupted = report.interrupted,
            "Stage complete"
        );
        Ok(report)
    }

    /// Fan `records` out over at most `workers` scoped threads.
    fn process_records<F>(
        &self,
        stage: Stage,
        records: Vec<DocumentRecord>,
        cancel: &AtomicBool,
        handle: F,
    ) -> Result<StageReport, ReconcileError>
    where
        F: Fn(&DocumentRecord) -> Result<RecordOutcome, ReconcileError> + Sync,
    {
        if records.is_empty() {
            return Ok(StageReport::new(stage));
        }

        let workers = self.config.workers.clamp(1, records.len());
        let next = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let report = Mutex::new(StageReport::new(stage));
        let abort: Mutex<Option<ReconcileError>> = Mutex::new(None);

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    if cancel.load(Ordering::Relaxed) || stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(record) = records.get(next.fetch_add(1, Ordering::Relaxed)) else {
                        break;
                    };

                    let outcome = match handle(record) {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_stage_level() => {
                            stop.store(true, Ordering::Relaxed);
                            if let Ok(mut slot) = abort.lock() {
                                slot.get_or_insert(e);
                            }
                            break;
                        }
                        Err(e @ ReconcileError::StateConflict { .. }) => {
                            tracing::debug!(document_id = %record.document_id, error = %e, "Record moved by another worker");
                            RecordOutcome::Skipped
                        }
                        Err(e) => {
                            tracing::warn!(document_id = %record.document_id, error = %e, "Record skipped");
                            RecordOutcome::Skipped
                        }
                    };
                    if let Ok(mut r) = report.lock() {
                        r.record(outcome);
                    }
                });
            }
        });

        if let Some(e) = abort.into_inner().map_err(|_| DatabaseError::LockPoisoned)? {
            return Err(e);
        }
        let mut report = report.into_inner().map_err(|_| DatabaseError::LockPoisoned)?;
        // Records already handled stay counted.
        if cancel.load(Ordering::Relaxed) && (report.examined as usize) < records.len() {
            report.interrupted = true;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;
    use crate::pipeline::reconcile::store::SqliteStateStore;

    // ── Scripted collaborators ───────────────────────────

    #[derive(Default)]
    struct FakeRemote {
        rows: Vec<RemoteRow>,
        policies: HashMap<String, PolicySnapshot>,
        written: Mutex<HashMap<String, WriteBackPayload>>,
        write_calls: AtomicU32,
        offline: bool,
    }

    impl RecordSource for FakeRemote {
        fn find_candidates(&self, _query: &CandidateQuery) -> Result<Vec<RemoteRow>, SourceError> {
            if self.offline {
                return Err(SourceError::Connection("network unreachable".into()));
            }
            Ok(self.rows.clone())
        }

        fn fetch_policy(&self, policy_id: &str) -> Result<Option<PolicySnapshot>, SourceError> {
            if self.offline {
                return Err(SourceError::Connection("network unreachable".into()));
            }
            Ok(self.policies.get(policy_id).cloned())
        }

        fn upsert_match_result(&self, payload: &WriteBackPayload) -> Result<(), SourceError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            self.written
                .lock()
                .unwrap()
                .insert(payload.document_id.clone(), payload.clone());
            Ok(())
        }
    }

    /// Returns canned fields per document id; anything else times out.
    #[derive(Default)]
    struct ScriptedExtractor {
        responses: HashMap<String, ExtractedFields>,
        calls: AtomicU32,
    }

    impl ExtractionClient for ScriptedExtractor {
        fn extract(&self, doc: &DocumentRef, timeout: Duration) -> Result<ExtractionOutput, ExtractionFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(&doc.document_id) {
                Some(fields) => Ok(ExtractionOutput { fields: fields.clone() }),
                None => Err(ExtractionFailure::new(
                    ExtractionFailureKind::Timeout,
                    format!("no response within {:?}", timeout),
                )),
            }
        }
    }

    fn row(id: &str, policy_id: Option<&str>) -> RemoteRow {
        RemoteRow {
            file_id: id.into(),
            file_path: format!("/pop/{id}.pdf"),
            policy_id: policy_id.map(str::to_string),
            task_comment: "Proof of Prior - Auto".into(),
            created_at: "2026-10-01 10:30:00".into(),
        }
    }

    fn jane_doe_policy() -> PolicySnapshot {
        PolicySnapshot {
            policy_id: "P100".into(),
            named_insured: Some("JANE DOE".into()),
            effective_date: Some("2025-01-15".into()),
            ..Default::default()
        }
    }

    fn jane_doe_fields(policy_id: Field<String>) -> ExtractedFields {
        ExtractedFields {
            policy_id,
            named_insured: Field::Present("Jane Doe".into()),
            effective_date: Field::Present("01/15/2025".into()),
            ..Default::default()
        }
    }

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            retry_backoff_secs: 0,
            retry_backoff_max_secs: 0,
            ..Default::default()
        }
    }

    struct Harness {
        store: Arc<SqliteStateStore>,
        remote: Arc<FakeRemote>,
        extractor: Arc<ScriptedExtractor>,
        reconciler: Reconciler,
    }

    fn harness(remote: FakeRemote, extractor: ScriptedExtractor, config: ReconcileConfig) -> Harness {
        let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let remote = Arc::new(remote);
        let extractor = Arc::new(extractor);
        let reconciler = Reconciler::new(store.clone(), remote.clone(), extractor.clone(), config).unwrap();
        Harness {
            store,
            remote,
            extractor,
            reconciler,
        }
    }

    fn cycle(h: &Harness) -> CycleReport {
        h.reconciler.run_cycle(&AtomicBool::new(false))
    }

    #[test]
    fn full_cycle_writes_back_matched_document() {
        let h = harness(
            FakeRemote {
                rows: vec![row("F1", Some("P100"))],
                policies: HashMap::from([("P100".to_string(), jane_doe_policy())]),
                ..Default::default()
            },
            ScriptedExtractor {
                responses: HashMap::from([("F1".to_string(), jane_doe_fields(Field::Present("P100".into())))]),
                ..Default::default()
            },
            config(),
        );

        let report = cycle(&h);
        assert!(report.stage_errors.is_empty());
        assert_eq!(report.discovery.as_ref().unwrap().created, 1);
        assert_eq!(report.stage(Stage::WriteBack).unwrap().advanced, 1);

        let record = h.store.get("F1").unwrap().unwrap();
        assert_eq!(record.state, DocumentState::WrittenBack);
        assert_eq!(record.match_result, Some(MatchVerdict::Matched));

        let written = h.remote.written.lock().unwrap();
        assert_eq!(written["F1"].policy_id.as_deref(), Some("P100"));
    }

    #[test]
    fn null_extracted_policy_id_still_matches() {
        let h = harness(
            FakeRemote {
                rows: vec![row("F1", Some("P100"))],
                policies: HashMap::from([("P100".to_string(), jane_doe_policy())]),
                ..Default::default()
            },
            ScriptedExtractor {
                responses: HashMap::from([("F1".to_string(), jane_doe_fields(Field::Null))]),
                ..Default::default()
            },
            config(),
        );

        cycle(&h);
        let record = h.store.get("F1").unwrap().unwrap();
        assert_eq!(record.state, DocumentState::WrittenBack);
        let report = record.match_report.unwrap();
        assert!(report
            .excluded
            .iter()
            .any(|e| e.field == MatchField::PolicyId && e.reason == "null in document"));
    }

    #[test]
    fn timeouts_exhaust_after_max_attempts() {
        let h = harness(
            FakeRemote {
                rows: vec![row("F1", Some("P100"))],
                ..Default::default()
            },
            ScriptedExtractor::default(),
            config(),
        );

        for _ in 0..3 {
            cycle(&h);
        }
        let record = h.store.get("F1").unwrap().unwrap();
        assert_eq!(record.state, DocumentState::Failed);
        assert!(record.last_error.as_deref().unwrap().contains("timeout"));

        // Failed is terminal: further cycles never call the client again.
        cycle(&h);
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn repeated_cycles_write_back_once() {
        let h = harness(
            FakeRemote {
                rows: vec![row("F1", Some("P100"))],
                policies: HashMap::from([("P100".to_string(), jane_doe_policy())]),
                ..Default::default()
            },
            ScriptedExtractor {
                responses: HashMap::from([("F1".to_string(), jane_doe_fields(Field::Absent))]),
                ..Default::default()
            },
            config(),
        );

        cycle(&h);
        cycle(&h);
        assert_eq!(h.remote.write_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn approval_required_holds_then_releases() {
        let h = harness(
            FakeRemote {
                rows: vec![row("F1", Some("P100"))],
                policies: HashMap::from([("P100".to_string(), jane_doe_policy())]),
                ..Default::default()
            },
            ScriptedExtractor {
                responses: HashMap::from([("F1".to_string(), jane_doe_fields(Field::Absent))]),
                ..Default::default()
            },
            ReconcileConfig {
                require_human_approval: true,
                ..config()
            },
        );

        cycle(&h);
        assert_eq!(h.store.get("F1").unwrap().unwrap().state, DocumentState::AwaitingApproval);
        cycle(&h);
        assert_eq!(h.remote.write_calls.load(Ordering::SeqCst), 0);

        assert!(h.store.approve("F1").unwrap());
        cycle(&h);
        assert_eq!(h.store.get("F1").unwrap().unwrap().state, DocumentState::WrittenBack);
        assert_eq!(h.remote.write_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn offline_remote_aborts_stages_not_cycle() {
        let h = harness(
            FakeRemote {
                offline: true,
                ..Default::default()
            },
            ScriptedExtractor::default(),
            config(),
        );

        let report = cycle(&h);
        assert!(!report.cancelled);
        assert_eq!(report.stage_errors.len(), 1);
        assert_eq!(report.stage_errors[0].0, Stage::Discovery);
        assert!(report.stage(Stage::Extraction).is_some());
    }

    #[test]
    fn offline_matching_leaves_records_untouched() {
        let h = harness(
            FakeRemote {
                offline: true,
                ..Default::default()
            },
            ScriptedExtractor {
                responses: HashMap::from([("F1".to_string(), jane_doe_fields(Field::Absent))]),
                ..Default::default()
            },
            config(),
        );
        h.store.upsert_if_absent("F1", &NewDocument::from(&row("F1", Some("P100")))).unwrap();

        let report = cycle(&h);
        assert!(report.stage_errors.iter().any(|(s, _)| *s == Stage::Matching));
        let record = h.store.get("F1").unwrap().unwrap();
        assert_eq!(record.state, DocumentState::Extracted);
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn many_documents_across_workers() {
        let ids: Vec<String> = (0..25).map(|i| format!("F{i:03}")).collect();
        let h = harness(
            FakeRemote {
                rows: ids.iter().map(|id| row(id, Some("P100"))).collect(),
                policies: HashMap::from([("P100".to_string(), jane_doe_policy())]),
                ..Default::default()
            },
            ScriptedExtractor {
                responses: ids
                    .iter()
                    .map(|id| (id.clone(), jane_doe_fields(Field::Absent)))
                    .collect(),
                ..Default::default()
            },
            config(),
        );

        let report = cycle(&h);
        assert_eq!(report.stage(Stage::Extraction).unwrap().advanced, 25);
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 25);
        assert_eq!(h.remote.write_calls.load(Ordering::SeqCst), 25);
        assert_eq!(h.store.count_by_state().unwrap().get("written_back"), Some(&25));
    }

    #[test]
    fn cancelled_cycle_does_no_work() {
        let h = harness(
            FakeRemote {
                rows: vec![row("F1", Some("P100"))],
                ..Default::default()
            },
            ScriptedExtractor::default(),
            config(),
        );

        let report = h.reconciler.run_cycle(&AtomicBool::new(true));
        assert!(report.cancelled);
        assert!(report.discovery.is_none());
        assert!(h.store.get("F1").unwrap().is_none());
    }

    /// Raises the cancel flag from inside its first call.
    struct CancelsOnFirstCall {
        flag: Arc<AtomicBool>,
        calls: AtomicU32,
    }

    impl ExtractionClient for CancelsOnFirstCall {
        fn extract(&self, _doc: &DocumentRef, _timeout: Duration) -> Result<ExtractionOutput, ExtractionFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.flag.store(true, Ordering::SeqCst);
            Ok(ExtractionOutput {
                fields: jane_doe_fields(Field::Absent),
            })
        }
    }

    #[test]
    fn cancellation_mid_stage_keeps_partial_counts() {
        let flag = Arc::new(AtomicBool::new(false));
        let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let extractor = Arc::new(CancelsOnFirstCall {
            flag: flag.clone(),
            calls: AtomicU32::new(0),
        });
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(FakeRemote::default()),
            extractor.clone(),
            ReconcileConfig {
                workers: 1,
                ..config()
            },
        )
        .unwrap();
        for id in ["F1", "F2", "F3"] {
            store.upsert_if_absent(id, &NewDocument::from(&row(id, Some("P100")))).unwrap();
        }

        let report = reconciler.run_cycle(&flag);
        assert!(report.cancelled);
        assert!(report.stage_errors.is_empty());
        assert_eq!(report.stages.len(), 1);
        let extraction = report.stage(Stage::Extraction).unwrap();
        assert!(extraction.interrupted);
        assert_eq!(extraction.examined, 1);
        assert_eq!(extraction.advanced, 1);

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        let counts = store.count_by_state().unwrap();
        assert_eq!(counts.get("extracted"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&2));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let result = Reconciler::new(
            store,
            Arc::new(FakeRemote::default()),
            Arc::new(ScriptedExtractor::default()),
            ReconcileConfig {
                workers: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ReconcileError::Config(_))));
    }
}
