use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use super::descriptor::{self, DownloadState};
use super::index::StoreIndex;
use super::livequery::{LiveQuery, QueryEvent, QueryScope};
use super::observer::ObserverRegistry;
use super::paths;

/// Idle-timeout schedule (one entry per attempt) and inter-attempt backoff
/// schedule. Both reuse their last entry when the attempt index runs past the
/// end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    idle: Vec<Duration>,
    backoff: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(idle: Vec<Duration>, backoff: Vec<Duration>) -> Self {
        if idle.is_empty() {
            return Self::default();
        }
        Self { idle, backoff }
    }

    pub fn from_secs(idle: &[u64], backoff: &[u64]) -> Self {
        Self::new(
            idle.iter().copied().map(Duration::from_secs).collect(),
            backoff.iter().copied().map(Duration::from_secs).collect(),
        )
    }

    /// Number of attempts the watchdog makes before giving up.
    pub fn attempts(&self) -> usize {
        self.idle.len()
    }

    pub fn idle_for(&self, attempt: usize) -> Duration {
        self.idle[attempt.min(self.idle.len() - 1)]
    }

    pub fn backoff_for(&self, attempt: usize) -> Duration {
        match self.backoff.last() {
            Some(last) => *self.backoff.get(attempt).unwrap_or(last),
            None => Duration::ZERO,
        }
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            idle: vec![
                Duration::from_secs(60),
                Duration::from_secs(90),
                Duration::from_secs(180),
            ],
            backoff: vec![Duration::from_secs(2), Duration::from_secs(4)],
        }
    }
}

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("transfer stalled after {attempts} attempts")]
    Stalled { attempts: usize },
    #[error("download failed: {0}")]
    Download(String),
    #[error("operation cancelled")]
    Cancelled,
}

enum Resolution {
    Complete,
    Failed(String),
    Progress(f64),
    Pending,
}

enum AttemptOutcome {
    Complete,
    Failed(String),
    Cancelled,
    IdleExpired,
}

/// Waits for an item to become fully materialized locally. Slow transfers are
/// tolerated indefinitely; only the absence of forward progress for the
/// attempt's idle window counts against it. Progress comparison is strict —
/// a store re-reporting the same value must not reset the clock.
pub struct DownloadWatchdog {
    index: Arc<StoreIndex>,
    registry: Arc<ObserverRegistry>,
    data_root: PathBuf,
}

impl DownloadWatchdog {
    pub fn new(index: Arc<StoreIndex>, registry: Arc<ObserverRegistry>, data_root: PathBuf) -> Self {
        Self {
            index,
            registry,
            data_root,
        }
    }

    /// Block the calling timeline until `remote_path` is materialized, the
    /// store reports a terminal download error, the schedule is exhausted, or
    /// `cancel` fires. `on_progress` sees every observed progress value, in
    /// order, at most once each.
    pub async fn await_materialized(
        &self,
        remote_path: &str,
        schedule: &RetrySchedule,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(f64),
    ) -> Result<(), WatchdogError> {
        // Present state first, without opening a query.
        if self.is_materialized(remote_path) {
            return Ok(());
        }

        let attempts = schedule.attempts();
        for attempt in 0..attempts {
            let mut query = LiveQuery::open(
                Arc::clone(&self.index),
                Arc::clone(&self.registry),
                QueryScope::item(remote_path),
            );
            let idle = schedule.idle_for(attempt);
            let timer = sleep(idle);
            tokio::pin!(timer);
            let mut last_progress: Option<f64> = None;

            let outcome = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break AttemptOutcome::Cancelled,
                    _ = timer.as_mut() => break AttemptOutcome::IdleExpired,
                    event = query.next() => {
                        let Some(event) = event else {
                            debug_assert!(false, "live query closed before stop");
                            break AttemptOutcome::IdleExpired;
                        };
                        let is_baseline = matches!(event, QueryEvent::Gathered { .. });
                        match self.evaluate(&event, remote_path) {
                            Resolution::Complete => break AttemptOutcome::Complete,
                            Resolution::Failed(message) => break AttemptOutcome::Failed(message),
                            Resolution::Progress(value) => {
                                let first = last_progress.is_none();
                                let increased =
                                    last_progress.is_some_and(|previous| value > previous);
                                if first || increased {
                                    last_progress = Some(value);
                                    on_progress(value);
                                }
                                // The gathering snapshot only sets the
                                // baseline; it must not buy the attempt a
                                // fresh idle window.
                                if increased || (first && !is_baseline) {
                                    timer.as_mut().reset(Instant::now() + idle);
                                }
                            }
                            Resolution::Pending => {}
                        }
                    }
                }
            };
            query.stop();

            match outcome {
                AttemptOutcome::Complete => return Ok(()),
                AttemptOutcome::Failed(message) => return Err(WatchdogError::Download(message)),
                AttemptOutcome::Cancelled => return Err(WatchdogError::Cancelled),
                AttemptOutcome::IdleExpired => {
                    if attempt + 1 == attempts {
                        return Err(WatchdogError::Stalled { attempts });
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(WatchdogError::Cancelled),
                        _ = sleep(schedule.backoff_for(attempt)) => {}
                    }
                }
            }
        }
        Err(WatchdogError::Stalled { attempts })
    }

    /// Two-stage status resolution: a matching query result wins (it reflects
    /// recent moves and renames); with no result — index lag — the local
    /// filesystem at the original location is asked directly.
    fn evaluate(&self, event: &QueryEvent, remote_path: &str) -> Resolution {
        match event {
            QueryEvent::Gathered { matches } => {
                match matches.iter().find(|record| record.path == remote_path) {
                    Some(record) => self.resolve_record(&record.document),
                    None => self.resolve_local(remote_path),
                }
            }
            QueryEvent::Updated(record) => self.resolve_record(&record.document),
            QueryEvent::Removed { .. } => self.resolve_local(remote_path),
        }
    }

    fn resolve_record(&self, document: &Value) -> Resolution {
        if let Some(message) = descriptor::download_error(document) {
            return Resolution::Failed(message);
        }
        if descriptor::download_state(document) == DownloadState::Current {
            return Resolution::Complete;
        }
        match descriptor::download_progress(document) {
            Some(value) => Resolution::Progress(value),
            None => Resolution::Pending,
        }
    }

    fn resolve_local(&self, remote_path: &str) -> Resolution {
        if self.is_materialized(remote_path) {
            Resolution::Complete
        } else {
            Resolution::Pending
        }
    }

    fn is_materialized(&self, remote_path: &str) -> bool {
        materialized_file_exists(&self.data_root, remote_path)
    }
}

fn materialized_file_exists(data_root: &Path, remote_path: &str) -> bool {
    paths::materialized_path_for(data_root, remote_path)
        .map(|local| local.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const ITEM: &str = "/containers/notes/big.bin";

    struct Fixture {
        index: Arc<StoreIndex>,
        registry: Arc<ObserverRegistry>,
        watchdog: DownloadWatchdog,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let index = Arc::new(StoreIndex::new());
        let registry = Arc::new(ObserverRegistry::new());
        let watchdog = DownloadWatchdog::new(
            Arc::clone(&index),
            Arc::clone(&registry),
            dir.path().to_path_buf(),
        );
        Fixture {
            index,
            registry,
            watchdog,
            _dir: dir,
        }
    }

    fn downloading_doc(progress: f64) -> serde_json::Value {
        json!({
            "path": ITEM,
            "type": "file",
            "size": 1_000_000,
            "download": {"state": "none", "progress": progress}
        })
    }

    fn current_doc() -> serde_json::Value {
        json!({
            "path": ITEM,
            "type": "file",
            "size": 1_000_000,
            "download": {"state": "current", "progress": 1.0}
        })
    }

    #[test]
    fn schedules_reuse_their_last_entry() {
        let schedule = RetrySchedule::from_secs(&[60, 90, 180], &[2, 4]);

        assert_eq!(schedule.attempts(), 3);
        assert_eq!(schedule.idle_for(0), Duration::from_secs(60));
        assert_eq!(schedule.idle_for(2), Duration::from_secs(180));
        assert_eq!(schedule.idle_for(7), Duration::from_secs(180));
        assert_eq!(schedule.backoff_for(0), Duration::from_secs(2));
        // attempt index 2 reuses the last backoff entry, it is not zero
        assert_eq!(schedule.backoff_for(2), Duration::from_secs(4));
        assert_eq!(schedule.backoff_for(9), Duration::from_secs(4));
    }

    #[test]
    fn empty_idle_schedule_falls_back_to_the_default() {
        let schedule = RetrySchedule::new(Vec::new(), Vec::new());
        assert_eq!(schedule, RetrySchedule::default());
        assert_eq!(RetrySchedule::from_secs(&[5], &[]).backoff_for(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_but_progressing_transfer_never_times_out() {
        let fixture = fixture();
        fixture.index.apply(ITEM, downloading_doc(0.0));

        let index = Arc::clone(&fixture.index);
        tokio::spawn(async move {
            // forward progress just inside each 5s idle window, for a total
            // elapsed time far beyond any single window
            for step in 1..=20u32 {
                sleep(Duration::from_secs(4)).await;
                index.apply(ITEM, downloading_doc(f64::from(step) * 0.04));
            }
            sleep(Duration::from_secs(4)).await;
            index.apply(ITEM, current_doc());
        });

        let schedule = RetrySchedule::from_secs(&[5], &[]);
        let started = Instant::now();
        fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(84));
        assert_eq!(fixture.registry.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_progress_values_do_not_reset_the_clock() {
        let fixture = fixture();
        fixture.index.apply(ITEM, downloading_doc(0.3));

        let index = Arc::clone(&fixture.index);
        tokio::spawn(async move {
            // the store keeps re-reporting the same value; that is a stall
            loop {
                sleep(Duration::from_secs(1)).await;
                index.apply(ITEM, downloading_doc(0.3));
            }
        });

        let schedule = RetrySchedule::from_secs(&[5], &[]);
        let started = Instant::now();
        let err = fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, WatchdogError::Stalled { attempts: 1 }));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_schedule_fails_after_the_exact_total_wait() {
        let fixture = fixture();
        fixture.index.apply(ITEM, downloading_doc(0.1));

        let schedule = RetrySchedule::from_secs(&[5, 5, 5], &[1, 1]);
        let started = Instant::now();
        let err = fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, WatchdogError::Stalled { attempts: 3 }));
        // 5 + 1 + 5 + 1 + 5
        assert_eq!(started.elapsed(), Duration::from_secs(17));
        assert_eq!(fixture.registry.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_download_error_fails_the_wait() {
        let fixture = fixture();
        fixture.index.apply(ITEM, downloading_doc(0.2));

        let index = Arc::clone(&fixture.index);
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            index.merge(ITEM, json!({"download": {"error": "blob service unreachable"}}));
        });

        let schedule = RetrySchedule::from_secs(&[30], &[]);
        let err = fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, WatchdogError::Download(ref m) if m.contains("unreachable")));
    }

    #[tokio::test(start_paused = true)]
    async fn materialized_file_short_circuits_without_a_query() {
        let fixture = fixture();
        let local = paths::materialized_path_for(fixture.watchdog.data_root.as_path(), ITEM).unwrap();
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, b"bytes").unwrap();

        let schedule = RetrySchedule::from_secs(&[5], &[]);
        fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(fixture.registry.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn index_lag_falls_back_to_the_filesystem() {
        // The index has no record of the item at all, but the engine already
        // materialized it: stage two must still resolve to completed.
        let fixture = fixture();
        let data_root = fixture.watchdog.data_root.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            let local = paths::materialized_path_for(&data_root, ITEM).unwrap();
            std::fs::create_dir_all(local.parent().unwrap()).unwrap();
            std::fs::write(&local, b"bytes").unwrap();
        });

        let schedule = RetrySchedule::from_secs(&[2, 2, 2], &[1]);
        let started = Instant::now();
        fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        // found by the second attempt's gathering scan
        assert!(started.elapsed() <= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_values_are_forwarded_in_order() {
        let fixture = fixture();
        fixture.index.apply(ITEM, downloading_doc(0.1));

        let index = Arc::clone(&fixture.index);
        tokio::spawn(async move {
            for value in [0.2, 0.2, 0.5] {
                sleep(Duration::from_secs(1)).await;
                index.apply(ITEM, downloading_doc(value));
            }
            sleep(Duration::from_secs(1)).await;
            index.apply(ITEM, current_doc());
        });

        let mut observed = Vec::new();
        let schedule = RetrySchedule::from_secs(&[10], &[]);
        fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &CancellationToken::new(), |value| {
                observed.push(value);
            })
            .await
            .unwrap();

        assert_eq!(observed, vec![0.1, 0.2, 0.5]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_tears_down_and_reports_once() {
        let fixture = fixture();
        fixture.index.apply(ITEM, downloading_doc(0.1));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let schedule = RetrySchedule::from_secs(&[60], &[]);
        let err = fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &cancel, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, WatchdogError::Cancelled));
        assert_eq!(fixture.registry.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_racing_completion_yields_exactly_one_outcome() {
        let fixture = fixture();
        fixture.index.apply(ITEM, downloading_doc(0.9));
        let cancel = CancellationToken::new();

        let index = Arc::clone(&fixture.index);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            index.apply(ITEM, current_doc());
            trigger.cancel();
        });

        let schedule = RetrySchedule::from_secs(&[60], &[]);
        let result = fixture
            .watchdog
            .await_materialized(ITEM, &schedule, &cancel, |_| {})
            .await;

        // whichever path won, cleanup ran exactly once and the registry is empty
        assert!(matches!(result, Ok(()) | Err(WatchdogError::Cancelled)));
        assert_eq!(fixture.registry.active(), 0);
    }
}
