use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use pdfsift_core::config::AppConfig;
use pdfsift_core::db::Database;
use pdfsift_core::retention::{self, SweepReport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::state::lock_db;

/// `service_state` key holding the most recent [`CleanupRun`].
pub const LAST_RUN_KEY: &str = "file_cleanup.last_run";

/// A finished sweep as persisted in `service_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: SweepReport,
}

/// Shared cleanup worker metrics, read by `GET /workers/status`.
pub struct CleanupMetrics {
    pub running: AtomicBool,
    pub runs: AtomicU64,
    pub files_deleted: AtomicU64,
    pub bytes_deleted: AtomicU64,
    retention: Duration,
    interval: Duration,
    last_run: Mutex<Option<CleanupRun>>,
    next_run: Mutex<Option<DateTime<Utc>>>,
}

/// Status snapshot as served over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub retention_minutes: u64,
    pub interval_seconds: u64,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub runs: u64,
    pub files_deleted: u64,
    pub bytes_deleted: u64,
    pub job_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report: Option<SweepReport>,
}

impl CleanupMetrics {
    pub fn new(retention: Duration, interval: Duration) -> Self {
        Self {
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            files_deleted: AtomicU64::new(0),
            bytes_deleted: AtomicU64::new(0),
            retention,
            interval,
            last_run: Mutex::new(None),
            next_run: Mutex::new(None),
        }
    }

    fn record(&self, run: CleanupRun) {
        self.files_deleted
            .fetch_add(run.report.deleted, Ordering::Relaxed);
        self.bytes_deleted
            .fetch_add(run.report.bytes_deleted, Ordering::Relaxed);
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(run);
        // Counted last so a reader that sees the run also sees its totals
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn set_next_run(&self, at: Option<DateTime<Utc>>) {
        *self.next_run.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn status(&self) -> WorkerStatus {
        let running = self.running.load(Ordering::SeqCst);
        let last_run = self
            .last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        WorkerStatus {
            running,
            retention_minutes: self.retention.as_secs() / 60,
            interval_seconds: self.interval.as_secs(),
            next_run: *self.next_run.lock().unwrap_or_else(|e| e.into_inner()),
            last_run: last_run.as_ref().map(|r| r.finished_at),
            runs: self.runs.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
            bytes_deleted: self.bytes_deleted.load(Ordering::Relaxed),
            job_count: u32::from(running),
            last_report: last_run.map(|r| r.report),
        }
    }
}

/// Handle to the running cleanup task, used for shutdown.
pub struct CleanupWorker {
    pub metrics: Arc<CleanupMetrics>,
    task: tokio::task::JoinHandle<()>,
}

impl CleanupWorker {
    pub async fn shutdown(self) {
        info!("shutting down file cleanup worker");
        self.task.abort();
        let _ = self.task.await;
        self.metrics.running.store(false, Ordering::SeqCst);
        self.metrics.set_next_run(None);
        info!("file cleanup worker stopped");
    }
}

/// Directories whose files expire.
pub fn cleanup_dirs(config: &AppConfig) -> pdfsift_core::Result<Vec<PathBuf>> {
    Ok(vec![config.image_dir()?, config.upload_dir()?])
}

/// Run one sweep off the async executor.
pub async fn sweep_once(dirs: Vec<PathBuf>, retention: Duration, dry_run: bool) -> SweepReport {
    let result = tokio::task::spawn_blocking(move || {
        retention::sweep_dirs(&dirs, retention, SystemTime::now(), dry_run)
    })
    .await;
    match result {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "sweep task panicked");
            SweepReport {
                errors: 1,
                ..SweepReport::default()
            }
        }
    }
}

/// Start the periodic cleanup task with the configured retention and interval.
pub fn start_cleanup_worker(
    config: &AppConfig,
    db: Arc<Mutex<Database>>,
    metrics: Arc<CleanupMetrics>,
) -> pdfsift_core::Result<CleanupWorker> {
    let dirs = cleanup_dirs(config)?;
    Ok(spawn_worker(dirs, db, metrics))
}

fn spawn_worker(
    dirs: Vec<PathBuf>,
    db: Arc<Mutex<Database>>,
    metrics: Arc<CleanupMetrics>,
) -> CleanupWorker {
    restore_last_run(&db, &metrics);
    metrics.running.store(true, Ordering::SeqCst);

    let task = {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            run_cleanup_loop(dirs, db, metrics).await;
        })
    };

    info!(
        retention_minutes = metrics.retention.as_secs() / 60,
        interval_seconds = metrics.interval.as_secs(),
        "file cleanup worker started"
    );
    CleanupWorker { metrics, task }
}

async fn run_cleanup_loop(dirs: Vec<PathBuf>, db: Arc<Mutex<Database>>, metrics: Arc<CleanupMetrics>) {
    let period = metrics.interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        metrics.set_next_run(chrono::Duration::from_std(period).ok().map(|d| Utc::now() + d));
        ticker.tick().await;

        let started_at = Utc::now();
        let report = sweep_once(dirs.clone(), metrics.retention, false).await;
        let run = CleanupRun {
            started_at,
            finished_at: Utc::now(),
            report,
        };

        if run.report.deleted > 0 || run.report.errors > 0 {
            info!(
                deleted = run.report.deleted,
                bytes = run.report.bytes_deleted,
                errors = run.report.errors,
                "file cleanup run finished"
            );
        } else {
            debug!(scanned = run.report.scanned, "file cleanup run found nothing to delete");
        }

        persist_run(&db, &run).await;
        metrics.record(run);
    }
}

async fn persist_run(db: &Arc<Mutex<Database>>, run: &CleanupRun) {
    let value = match serde_json::to_string(run) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "failed to serialize cleanup report");
            return;
        }
    };
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || {
        let db = lock_db(&db);
        db.set_service_state(LAST_RUN_KEY, &value)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "failed to persist cleanup report"),
        Err(e) => warn!(error = %e, "persist task panicked"),
    }
}

/// Seed `last_run` from the previous process so status survives restarts.
fn restore_last_run(db: &Mutex<Database>, metrics: &CleanupMetrics) {
    let stored = match lock_db(db).get_service_state(LAST_RUN_KEY) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(error = %e, "failed to read previous cleanup report");
            return;
        }
    };
    if let Some(run) = stored.and_then(|s| serde_json::from_str::<CleanupRun>(&s).ok()) {
        debug!(finished_at = %run.finished_at, "restored previous cleanup report");
        *metrics.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(run);
    }
}
