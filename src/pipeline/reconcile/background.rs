//! Background reconciler: runs a cycle, sleeps, repeats.
//!
//! Shutdown is observed between cycles (sleep is sliced) and inside a cycle
//! at the next record boundary, since the same flag is the cycle's
//! cancellation signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::runner::Reconciler;

/// Sleep granularity for shutdown responsiveness.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Handle for the background reconciler thread.
///
/// Dropping the handle requests shutdown and joins the thread.
pub struct ReconcilerHandle {
    shutdown: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Request shutdown. The in-flight cycle stops at its next record boundary.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Number of cycles finished so far.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Block until the thread exits (after `shutdown`, or never).
    pub fn join(mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Start running cycles on a dedicated thread, the first one immediately.
pub fn start_background_reconciler(reconciler: Arc<Reconciler>, interval: Duration) -> ReconcilerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let cycles = Arc::new(AtomicU64::new(0));
    let flag = shutdown.clone();
    let counter = cycles.clone();

    let handle = std::thread::spawn(move || {
        tracing::info!(interval_secs = interval.as_secs(), "Background reconciler started");
        reconcile_loop(&reconciler, interval, &flag, &counter);
        tracing::info!("Background reconciler shutting down");
    });

    ReconcilerHandle {
        shutdown,
        cycles,
        handle: Some(handle),
    }
}

fn reconcile_loop(reconciler: &Reconciler, interval: Duration, shutdown: &AtomicBool, cycles: &AtomicU64) {
    while !shutdown.load(Ordering::Relaxed) {
        let report = reconciler.run_cycle(shutdown);
        cycles.fetch_add(1, Ordering::Relaxed);
        if !report.stage_errors.is_empty() {
            tracing::warn!(errors = ?report.stage_errors, "Cycle finished with stage errors");
        }

        let mut remaining = interval;
        while !remaining.is_zero() {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::pipeline::reconcile::store::SqliteStateStore;
    use crate::pipeline::reconcile::traits::*;
    use crate::pipeline::reconcile::types::*;

    struct EmptyRemote;

    impl RecordSource for EmptyRemote {
        fn find_candidates(&self, _query: &CandidateQuery) -> Result<Vec<RemoteRow>, SourceError> {
            Ok(vec![])
        }

        fn fetch_policy(&self, _policy_id: &str) -> Result<Option<PolicySnapshot>, SourceError> {
            Ok(None)
        }

        fn upsert_match_result(&self, _payload: &WriteBackPayload) -> Result<(), SourceError> {
            Ok(())
        }
    }

    struct NeverCalled;

    impl ExtractionClient for NeverCalled {
        fn extract(&self, _doc: &DocumentRef, _timeout: Duration) -> Result<ExtractionOutput, ExtractionFailure> {
            Err(ExtractionFailure::new(ExtractionFailureKind::Transport, "unused"))
        }
    }

    fn reconciler() -> Arc<Reconciler> {
        Arc::new(
            Reconciler::new(
                Arc::new(SqliteStateStore::open_in_memory().unwrap()),
                Arc::new(EmptyRemote),
                Arc::new(NeverCalled),
                ReconcileConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn runs_first_cycle_immediately_and_stops_promptly() {
        let handle = start_background_reconciler(reconciler(), Duration::from_secs(3600));

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.cycles_completed() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.cycles_completed(), 1);

        let stopping = Instant::now();
        drop(handle);
        assert!(stopping.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn short_interval_runs_repeatedly() {
        let handle = start_background_reconciler(reconciler(), Duration::from_millis(20));

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.cycles_completed() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();
        assert!(handle.cycles_completed() >= 3);
    }
}
