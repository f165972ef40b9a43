//! Batch tracking
//!
//! Persistent watermark tracking per tracked entity: the `[min, max]`
//! sequence range last completed, with gap detection. Survives restarts so a
//! relay never reprocesses a completed range and never silently drops one.
//!
//! ## Invariants
//!
//! - `last_max_mark` is monotonically non-decreasing.
//! - A completion whose `min` leaves a hole after the previous `max` records
//!   `has_gap = true`; it is never swallowed.

use crate::change::MarkRange;
use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Watermark state for one tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerEntry {
    /// Minimum mark of the last completed range
    pub last_min_mark: u64,
    /// Maximum mark ever completed (monotonically non-decreasing)
    pub last_max_mark: u64,
    /// When the range was completed
    pub completed_at: DateTime<Utc>,
    /// Correlation id of the completing run
    pub correlation_id: String,
    /// Whether the completing range left a hole after the previous maximum
    pub has_gap: bool,
}

impl TrackerEntry {
    fn advance(previous: Option<&TrackerEntry>, range: MarkRange, correlation_id: &str) -> Self {
        let has_gap = previous
            .map(|p| range.min > p.last_max_mark.saturating_add(1))
            .unwrap_or(false);
        // Never regress the high-water mark, even for an out-of-order range.
        let last_max_mark = previous
            .map(|p| p.last_max_mark.max(range.max))
            .unwrap_or(range.max);
        Self {
            last_min_mark: range.min,
            last_max_mark,
            completed_at: Utc::now(),
            correlation_id: correlation_id.to_string(),
            has_gap,
        }
    }
}

/// Trait for tracker storage backends.
#[async_trait::async_trait]
pub trait TrackerStore: Send + Sync {
    /// Load the current entry for an entity.
    async fn load(&self, entity: &str) -> Result<Option<TrackerEntry>>;

    /// Record a completed range, advancing the watermark.
    async fn complete(
        &self,
        entity: &str,
        range: MarkRange,
        correlation_id: &str,
    ) -> Result<TrackerEntry>;

    /// List tracked entity names.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Shared tracker store handle.
pub type SharedTrackerStore = Arc<dyn TrackerStore>;

/// In-memory tracker store (tests, single-process runs).
#[derive(Debug, Default)]
pub struct MemoryTrackerStore {
    entries: RwLock<HashMap<String, TrackerEntry>>,
}

impl MemoryTrackerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TrackerStore for MemoryTrackerStore {
    async fn load(&self, entity: &str) -> Result<Option<TrackerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(entity).cloned())
    }

    async fn complete(
        &self,
        entity: &str,
        range: MarkRange,
        correlation_id: &str,
    ) -> Result<TrackerEntry> {
        let mut entries = self.entries.write().await;
        let entry = TrackerEntry::advance(entries.get(entity), range, correlation_id);
        if entry.has_gap {
            warn!(entity, range = %range, "completed range leaves a gap");
        }
        entries.insert(entity.to_string(), entry.clone());
        Ok(entry)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries.keys().cloned().collect())
    }
}

/// Persistent tracker store.
///
/// One JSON file per tracked entity, written atomically via temp file and
/// rename, fronted by an in-memory cache.
pub struct FileTrackerStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, TrackerEntry>>,
    fsync: bool,
}

impl FileTrackerStore {
    /// Open (or create) a tracker directory and load existing entries.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Open with explicit fsync behavior.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await.map_err(RelayError::Io)?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    async fn persist(&self, entity: &str, entry: &TrackerEntry) -> Result<()> {
        if entity.is_empty() || entity.contains('/') || entity.contains('\\') {
            return Err(RelayError::config("Invalid tracker entity name"));
        }

        let file_path = self.file_path(entity);
        let temp_path = file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(entry)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(RelayError::Io)?;
        file.write_all(json.as_bytes()).await.map_err(RelayError::Io)?;
        if self.fsync {
            file.sync_all().await.map_err(RelayError::Io)?;
        }

        fs::rename(&temp_path, &file_path)
            .await
            .map_err(RelayError::Io)?;
        debug!(entity, max = entry.last_max_mark, "persisted tracker entry");
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await.map_err(RelayError::Io)?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await.map_err(RelayError::Io)? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    match self.read_file(&path).await {
                        Ok(tracker) => {
                            self.cache.write().await.insert(stem.to_string(), tracker);
                            loaded += 1;
                        }
                        Err(e) => warn!(entity = stem, error = %e, "failed to load tracker entry"),
                    }
                }
            }
        }
        if loaded > 0 {
            info!(count = loaded, dir = %self.base_dir.display(), "loaded tracker entries");
        }
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<TrackerEntry> {
        let mut file = File::open(path).await.map_err(RelayError::Io)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .await
            .map_err(RelayError::Io)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn file_path(&self, entity: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", entity))
    }
}

#[async_trait::async_trait]
impl TrackerStore for FileTrackerStore {
    async fn load(&self, entity: &str) -> Result<Option<TrackerEntry>> {
        let cache = self.cache.read().await;
        Ok(cache.get(entity).cloned())
    }

    async fn complete(
        &self,
        entity: &str,
        range: MarkRange,
        correlation_id: &str,
    ) -> Result<TrackerEntry> {
        let mut cache = self.cache.write().await;
        let entry = TrackerEntry::advance(cache.get(entity), range, correlation_id);
        if entry.has_gap {
            warn!(entity, range = %range, "completed range leaves a gap");
        }
        self.persist(entity, &entry).await?;
        cache.insert(entity.to_string(), entry.clone());
        Ok(entry)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let cache = self.cache.read().await;
        Ok(cache.keys().cloned().collect())
    }
}
