//! Event outbox
//!
//! Durable store-and-forward layer guaranteeing at-least-once delivery.
//! Enqueue is invoked by the orchestrator's publish step in the same unit of
//! work as batch completion; the relay loop independently drains unsent
//! records to a pluggable sender and marks each one dequeued only after the
//! sender confirms.
//!
//! A crash between send and mark-dequeued redelivers on the next pass.
//! Downstream consumers are expected to be idempotent, keyed by the event id.

use crate::error::{RelayError, Result};
use crate::event::EventData;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Durable outbox row.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    /// Event id; consumers deduplicate on it
    pub id: String,
    pub event_type: String,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Serialized wire envelope
    pub payload: Bytes,
    pub dequeued: bool,
    pub dequeued_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Build a record from an event, serializing its wire envelope.
    pub fn from_event(event: &EventData) -> Result<Self> {
        Ok(Self {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            timestamp: event.timestamp,
            payload: event.to_payload()?,
            dequeued: false,
            dequeued_at: None,
        })
    }
}

/// Trait for outbox storage backends.
///
/// `fetch_pending` must return records in enqueue order; the relay preserves
/// that order per outbox instance.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append records in order.
    async fn enqueue(&self, records: Vec<OutboxRecord>) -> Result<()>;

    /// Unsent records, oldest first.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Mark a record delivered.
    async fn mark_dequeued(&self, id: &str) -> Result<()>;

    /// Number of unsent records.
    async fn pending_len(&self) -> Result<usize>;
}

/// Shared outbox store handle.
pub type SharedOutboxStore = Arc<dyn OutboxStore>;

/// Pluggable wire transport for delivered records.
#[async_trait::async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, record: &OutboxRecord) -> Result<()>;
}

/// In-memory outbox store preserving enqueue order.
#[derive(Debug, Default)]
pub struct MemoryOutboxStore {
    records: RwLock<Vec<OutboxRecord>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records including dequeued ones (test inspection).
    pub async fn all(&self) -> Vec<OutboxRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait::async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, records: Vec<OutboxRecord>) -> Result<()> {
        let mut all = self.records.write().await;
        all.extend(records);
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let all = self.records.read().await;
        Ok(all.iter().filter(|r| !r.dequeued).take(limit).cloned().collect())
    }

    async fn mark_dequeued(&self, id: &str) -> Result<()> {
        let mut all = self.records.write().await;
        match all.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.dequeued = true;
                record.dequeued_at = Some(Utc::now());
                Ok(())
            }
            None => Err(RelayError::InvalidState(format!(
                "unknown outbox record {id}"
            ))),
        }
    }

    async fn pending_len(&self) -> Result<usize> {
        let all = self.records.read().await;
        Ok(all.iter().filter(|r| !r.dequeued).count())
    }
}

/// Relay loop configuration.
#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    /// Polling interval between passes
    pub poll_interval: Duration,
    /// Maximum records relayed per pass
    pub batch_size: usize,
    /// Timeout for a single send
    pub send_timeout: Duration,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Default)]
pub struct RelayStats {
    records_relayed: AtomicU64,
    send_failures: AtomicU64,
    passes: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            records_relayed: self.records_relayed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of relay statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub records_relayed: u64,
    pub send_failures: u64,
    pub passes: u64,
}

/// Periodic relay draining unsent outbox records to a sender.
pub struct OutboxRelay {
    config: OutboxRelayConfig,
    store: SharedOutboxStore,
    sender: Arc<dyn EventSender>,
    stats: Arc<RelayStats>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl OutboxRelay {
    pub fn new(
        config: OutboxRelayConfig,
        store: SharedOutboxStore,
        sender: Arc<dyn EventSender>,
    ) -> Self {
        Self {
            config,
            store,
            sender,
            stats: Arc::new(RelayStats::default()),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Run the relay loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // already running
        }
        info!("outbox relay started");

        while self.running.load(Ordering::Relaxed) {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.relay_pass().await {
                        error!(error = %e, "outbox relay pass failed");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("outbox relay stopped");
    }

    /// Request the relay loop to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Relay one batch of pending records in enqueue order.
    ///
    /// Stops at the first send failure: skipping ahead would violate the
    /// per-instance ordering guarantee. The failed record and everything
    /// behind it are retried on the next pass.
    pub async fn relay_pass(&self) -> Result<usize> {
        self.stats.passes.fetch_add(1, Ordering::Relaxed);
        let pending = self.store.fetch_pending(self.config.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(count = pending.len(), "relaying pending outbox records");

        let mut relayed = 0usize;
        for record in pending {
            let sent = tokio::time::timeout(self.config.send_timeout, self.sender.send(&record))
                .await
                .map_err(|_| RelayError::timeout("outbox send"))
                .and_then(|r| r);

            match sent {
                Ok(()) => {
                    // Mark only after the sender confirmed; a crash in
                    // between redelivers, never drops.
                    self.store.mark_dequeued(&record.id).await?;
                    self.stats.records_relayed.fetch_add(1, Ordering::Relaxed);
                    relayed += 1;
                }
                Err(e) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(record = %record.id, error = %e, "send failed, will retry next pass");
                    break;
                }
            }
        }
        Ok(relayed)
    }
}
