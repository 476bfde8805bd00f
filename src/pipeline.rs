use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use rusqlite::Connection;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archive::Archive;
use crate::db;
use crate::feed::FeedClient;
use crate::fetcher::{self, FetchOptions, StopReason};
use crate::model::ArchiveRef;
use crate::transform::{TransformStop, Transformer};

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Nothing was archived, so nothing was transformed.
    Empty,
    Completed,
    Failed(String),
    Cancelled,
    /// Another run still held the single-flight guard.
    Skipped,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Empty => write!(f, "empty"),
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Failed(msg) => write!(f, "failed: {}", msg),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub pages_fetched: usize,
    pub records_inserted: usize,
    pub stop: Option<StopReason>,
    pub outcome: RunOutcome,
}

/// Clears the in-flight flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fetch then transform, once per call. Owns every handle a run touches.
pub struct Pipeline<F> {
    feed: F,
    archive: Archive,
    conn: Arc<Mutex<Connection>>,
    transformer: Arc<Transformer>,
    fetch: FetchOptions,
    in_flight: AtomicBool,
}

impl<F: FeedClient> Pipeline<F> {
    pub fn new(
        feed: F,
        archive: Archive,
        conn: Connection,
        transformer: Transformer,
        fetch: FetchOptions,
    ) -> Self {
        Pipeline {
            feed,
            archive,
            conn: Arc::new(Mutex::new(conn)),
            transformer: Arc::new(transformer),
            fetch,
            in_flight: AtomicBool::new(false),
        }
    }

    /// One run: START → FETCH → (END-EMPTY | TRANSFORM → END). Never fails outward.
    pub async fn run(&self, cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let run_id = format!("run-{}", started_at.format("%Y%m%dT%H%M%S%.3f"));

        let Some(_guard) = RunGuard::try_acquire(&self.in_flight) else {
            warn!(run_id = %run_id, "Previous run still in flight, skipping");
            return RunReport {
                run_id,
                started_at,
                elapsed: Duration::ZERO,
                pages_fetched: 0,
                records_inserted: 0,
                stop: None,
                outcome: RunOutcome::Skipped,
            };
        };

        let t0 = Instant::now();
        info!(run_id = %run_id, "Starting pipeline run");

        let fetched = fetcher::fetch_pages(&self.feed, &self.archive, &self.fetch, cancel).await;
        let pages_fetched = fetched.pages.len();

        let (records_inserted, outcome) = if fetched.pages.is_empty() {
            info!(run_id = %run_id, stop = %fetched.stop, "No new pages to transform");
            let outcome = match fetched.stop {
                StopReason::Cancelled => RunOutcome::Cancelled,
                _ => RunOutcome::Empty,
            };
            (0, outcome)
        } else {
            self.transform(fetched.pages, cancel).await
        };

        let report = RunReport {
            run_id,
            started_at,
            elapsed: t0.elapsed(),
            pages_fetched,
            records_inserted,
            stop: Some(fetched.stop),
            outcome,
        };
        info!(
            run_id = %report.run_id,
            pages = report.pages_fetched,
            inserted = report.records_inserted,
            outcome = %report.outcome,
            "Pipeline run finished in {:.2}s",
            report.elapsed.as_secs_f64()
        );
        self.record(&report);
        report
    }

    /// rayon and SQLite work runs on the blocking pool, off the scheduler's threads.
    async fn transform(&self, pages: Vec<ArchiveRef>, cancel: &CancellationToken) -> (usize, RunOutcome) {
        let conn = Arc::clone(&self.conn);
        let transformer = Arc::clone(&self.transformer);
        let archive = self.archive.clone();
        let cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            transformer.transform_pages(&conn, &archive, &pages, &cancel, &ProgressBar::hidden())
        });

        match task.await {
            Ok(report) => {
                let outcome = match report.stopped {
                    None => RunOutcome::Completed,
                    Some(TransformStop::Cancelled) => RunOutcome::Cancelled,
                    Some(TransformStop::Storage(ref e)) => RunOutcome::Failed(e.to_string()),
                };
                (report.inserted(), outcome)
            }
            Err(e) => {
                error!("Transform task died: {}", e);
                (0, RunOutcome::Failed(e.to_string()))
            }
        }
    }

    fn record(&self, report: &RunReport) {
        let row = db::RunRow {
            run_id: report.run_id.clone(),
            started_at: report.started_at.to_rfc3339(),
            elapsed_ms: report.elapsed.as_millis() as i64,
            pages_fetched: report.pages_fetched,
            records_inserted: report.records_inserted,
            stop_reason: report.stop.as_ref().map(|s| s.to_string()).unwrap_or_default(),
            outcome: report.outcome.to_string(),
        };
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = db::insert_run(&conn, &row) {
            error!(run_id = %report.run_id, "Failed to record run summary: {}", e);
        }
    }
}

/// Run on a fixed interval until `cancel` fires. The first run starts immediately.
///
/// Runs are awaited inline, so a slow run delays the next tick instead of overlapping it.
pub async fn watch<F: FeedClient>(
    pipeline: &Pipeline<F>,
    interval: Duration,
    cancel: &CancellationToken,
) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Scheduler started (interval: {}s)", interval.as_secs());

    let mut runs = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        pipeline.run(cancel).await;
        runs += 1;
    }

    info!(runs, "Scheduler stopped");
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory;
    use crate::fetcher::tests::{opts, page, rate_limited, ScriptedFeed};
    use crate::feed::FeedResponse;
    use std::collections::HashSet;

    fn pipeline(feed: ScriptedFeed, dir: &std::path::Path, max_pages: usize) -> Pipeline<ScriptedFeed> {
        let kinds: HashSet<String> = ["PullRequestEvent".to_string()].into();
        Pipeline::new(
            feed,
            Archive::open(dir).unwrap(),
            memory(),
            Transformer::new(kinds, 64 * 1024),
            opts(max_pages),
        )
    }

    fn run_rows(p: &Pipeline<ScriptedFeed>) -> usize {
        let conn = p.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0)).unwrap()
    }

    fn stored(p: &Pipeline<ScriptedFeed>) -> usize {
        db::count_events(&p.conn.lock().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn rate_limit_mid_run_transforms_what_was_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let feed = ScriptedFeed::new(vec![Ok(page(1, "a", true)), Ok(rate_limited())]);
        let p = pipeline(feed, dir.path(), 5);

        let report = p.run(&CancellationToken::new()).await;

        assert_eq!(report.pages_fetched, 1);
        assert_eq!(report.records_inserted, 1);
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(matches!(report.stop, Some(StopReason::RateLimited { .. })));
        assert_eq!(p.archive.list().unwrap().len(), 1);
        assert_eq!(run_rows(&p), 1);
    }

    #[tokio::test]
    async fn empty_feed_skips_transform() {
        let dir = tempfile::tempdir().unwrap();
        let empty = FeedResponse {
            status: 200,
            body: "[]".into(),
            ..Default::default()
        };
        let p = pipeline(ScriptedFeed::new(vec![Ok(empty)]), dir.path(), 5);

        let report = p.run(&CancellationToken::new()).await;

        assert_eq!(report.outcome, RunOutcome::Empty);
        assert_eq!(report.pages_fetched, 0);
        assert_eq!(stored(&p), 0);
        assert_eq!(run_rows(&p), 1);
    }

    #[tokio::test]
    async fn repeated_runs_over_same_events_insert_once() {
        let dir = tempfile::tempdir().unwrap();
        let feed = ScriptedFeed::new(vec![
            Ok(page(1, "same", false)),
            Ok(page(1, "same", false)),
        ]);
        let p = pipeline(feed, dir.path(), 5);
        let cancel = CancellationToken::new();

        let first = p.run(&cancel).await;
        let second = p.run(&cancel).await;

        assert_eq!(first.records_inserted, 1);
        assert_eq!(second.pages_fetched, 1);
        assert_eq!(second.records_inserted, 0);
        assert_eq!(stored(&p), 1);
    }

    #[tokio::test]
    async fn network_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(ScriptedFeed::new(Vec::new()), dir.path(), 5);

        let report = p.run(&CancellationToken::new()).await;

        assert_eq!(report.outcome, RunOutcome::Empty);
        assert!(matches!(report.stop, Some(StopReason::Transient(_))));
    }

    #[tokio::test]
    async fn in_flight_run_blocks_a_second() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(ScriptedFeed::endless(), dir.path(), 1);

        let guard = RunGuard::try_acquire(&p.in_flight).unwrap();
        let report = p.run(&CancellationToken::new()).await;
        assert_eq!(report.outcome, RunOutcome::Skipped);
        assert_eq!(p.feed.calls(), 0);
        assert_eq!(run_rows(&p), 0);

        drop(guard);
        let report = p.run(&CancellationToken::new()).await;
        assert_eq!(report.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(ScriptedFeed::endless(), dir.path(), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = p.run(&cancel).await;
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(p.feed.calls(), 0);
    }

    #[tokio::test]
    async fn transform_leaves_the_scheduler_free() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(ScriptedFeed::new(vec![Ok(page(1, "a", false))]), dir.path(), 5);
        let other_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&other_ran);
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

        let report = p.run(&CancellationToken::new()).await;

        assert_eq!(report.records_inserted, 1);
        assert!(other_ran.load(Ordering::SeqCst), "spawned task should run while the transform is off-thread");
    }

    #[tokio::test(start_paused = true)]
    async fn watch_runs_on_interval_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(ScriptedFeed::endless(), dir.path(), 1);
        let cancel = CancellationToken::new();

        let (runs, _) = tokio::join!(watch(&p, Duration::from_secs(15), &cancel), async {
            tokio::time::sleep(Duration::from_secs(40)).await;
            cancel.cancel();
        });

        // Ticks at 0s, 15s and 30s.
        assert_eq!(runs, 3);
        assert_eq!(run_rows(&p), 3);
        assert_eq!(stored(&p), 3);
    }
}
