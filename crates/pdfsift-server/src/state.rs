use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use pdfsift_core::config::AppConfig;
use pdfsift_core::db::Database;
use pdfsift_core::llm::Summarizer;
use tracing::warn;

use crate::worker::CleanupMetrics;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub config: Arc<AppConfig>,
    pub summarizer: Option<Arc<Summarizer>>,
    pub cleanup: Arc<CleanupMetrics>,
    pub upload_dir: PathBuf,
    pub image_dir: PathBuf,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: Arc<Mutex<Database>>,
        summarizer: Option<Summarizer>,
        cleanup: Arc<CleanupMetrics>,
    ) -> pdfsift_core::Result<Self> {
        Ok(Self {
            upload_dir: config.upload_dir()?,
            image_dir: config.image_dir()?,
            db,
            config: Arc::new(config),
            summarizer: summarizer.map(Arc::new),
            cleanup,
        })
    }

    pub fn api_prefix(&self) -> &str {
        self.config.api_prefix()
    }
}

/// Lock a mutex, logging a warning if it was poisoned.
pub fn lock_db(db: &Mutex<Database>) -> std::sync::MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(|e| {
        warn!("database mutex was poisoned, recovering");
        e.into_inner()
    })
}
