//! Content deduplication
//!
//! Tracks the last observed tracking hash per row identity so that a
//! re-captured row with identical content produces no event. Dedup is by
//! content fingerprint, not by key: a row can change and change back, and
//! both transitions emit.
//!
//! Deletes are never filtered here; there may be no future chance to diff a
//! hash for a deleted row.

use crate::change::TableRef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Last observed tracking hash per `(schema, table, key)`.
#[derive(Debug, Default)]
pub struct ChangeDeduplicator {
    seen: RwLock<HashMap<String, String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChangeDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    fn identity(table: &TableRef, key: &str) -> String {
        format!("{}:{}", table.qualified(), key)
    }

    /// Whether the row's content is unchanged from the last recorded hash.
    pub async fn is_unchanged(&self, table: &TableRef, key: &str, tracking_hash: &str) -> bool {
        let seen = self.seen.read().await;
        let unchanged = seen
            .get(&Self::identity(table, key))
            .is_some_and(|h| h == tracking_hash);
        if unchanged {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(table = %table, key, "unchanged content, suppressing event");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        unchanged
    }

    /// Record the hash actually delivered for a row.
    ///
    /// Called only after a cycle completes; a failed cycle must re-emit.
    pub async fn record(&self, table: &TableRef, key: &str, tracking_hash: &str) {
        let mut seen = self.seen.write().await;
        seen.insert(Self::identity(table, key), tracking_hash.to_string());
    }

    /// Forget a row identity (e.g. after physical deletion).
    pub async fn forget(&self, table: &TableRef, key: &str) {
        let mut seen = self.seen.write().await;
        seen.remove(&Self::identity(table, key));
    }

    /// Number of tracked identities.
    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.read().await.is_empty()
    }

    /// (suppressed, emitted) counts since construction.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
