//! Entity orchestrator
//!
//! Drives one execution cycle for a tracked entity:
//!
//! ```text
//! Idle -> Fetching -> Consolidating -> Mapping -> Formatting
//!      -> Publishing -> Completing -> Idle
//! ```
//!
//! An empty root set exits early from Fetching with a null batch. Any error
//! after Fetching aborts the cycle without completing the batch; the next
//! tick re-fetches the same range, so consolidation and formatting must be
//! idempotent over the same raw input. Delivery itself stays at-least-once.
//!
//! Cancellation is cooperative and honored only at stage boundaries: an
//! in-flight consolidation or relink always finishes or fails cleanly.

use crate::change::{MarkRange, OperationKind, RawBatch, SequenceMark};
use crate::config::{EntityConfig, ErrorPolicy};
use crate::dedup::ChangeDeduplicator;
use crate::envelope::{consolidate, ConsolidatedBatch};
use crate::error::{RelayError, Result};
use crate::event::EventData;
use crate::format::{self, FormatterConfig};
use crate::mapping::IdentifierMapper;
use crate::outbox::{EventSender, OutboxRecord, SharedOutboxStore};
use crate::registry::ConsumerRegistry;
use crate::schema::EntitySchema;
use crate::tracker::SharedTrackerStore;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Abstract batch source, implemented by the (excluded) data layer.
#[async_trait::async_trait]
pub trait BatchSource: Send + Sync {
    /// Fetch the next batch of change rows after the given mark.
    ///
    /// Returns `None` when nothing changed. A re-fetch after a failed cycle
    /// must return the same rows for the same range.
    async fn fetch(&self, after: Option<SequenceMark>) -> Result<Option<RawBatch>>;

    /// Batch-complete call taking the observed range.
    async fn complete(&self, range: MarkRange, correlation_id: &str) -> Result<()>;
}

/// Where formatted events go.
#[derive(Clone)]
pub enum PublishMode {
    /// Hand each event directly to a sender
    Direct(Arc<dyn EventSender>),
    /// Enqueue durable outbox records for the relay loop
    Outbox(SharedOutboxStore),
    /// Dispatch to registered in-process consumers, honoring the entity's
    /// missing-consumer policy
    Registry(Arc<ConsumerRegistry>),
}

/// Cooperative cancellation signal, checked at stage boundaries only.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RelayError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Pipeline stage, for logging and cancellation boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Idle,
    Fetching,
    Consolidating,
    Mapping,
    Formatting,
    Publishing,
    Completing,
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CycleStage::Idle => "idle",
            CycleStage::Fetching => "fetching",
            CycleStage::Consolidating => "consolidating",
            CycleStage::Mapping => "mapping",
            CycleStage::Formatting => "formatting",
            CycleStage::Publishing => "publishing",
            CycleStage::Completing => "completing",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one execution cycle. Errors are captured here rather than
/// raised to the scheduler.
#[derive(Debug, Default)]
pub struct CycleResult {
    /// Consolidated batch, `None` when the source had nothing
    pub batch: Option<ConsolidatedBatch>,
    /// Events handed to the sender or enqueued
    pub events_published: usize,
    /// Failure, if the cycle aborted or completed with an error
    pub error: Option<RelayError>,
}

impl CycleResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Composes the batch source, identifier mapper, formatter and publish sink
/// into one execution cycle per tick.
pub struct EntityOrchestrator {
    schema: EntitySchema,
    config: EntityConfig,
    source: Arc<dyn BatchSource>,
    mapper: IdentifierMapper,
    tracker: SharedTrackerStore,
    formatter: FormatterConfig,
    publish_mode: PublishMode,
    dedup: ChangeDeduplicator,
}

impl EntityOrchestrator {
    pub fn new(
        schema: EntitySchema,
        config: EntityConfig,
        source: Arc<dyn BatchSource>,
        mapper: IdentifierMapper,
        tracker: SharedTrackerStore,
        formatter: FormatterConfig,
        publish_mode: PublishMode,
    ) -> Self {
        Self {
            schema,
            config,
            source,
            mapper,
            tracker,
            formatter,
            publish_mode,
            dedup: ChangeDeduplicator::new(),
        }
    }

    /// Tracked-entity name.
    pub fn entity(&self) -> &str {
        &self.schema.name
    }

    /// Entity configuration, including the scheduling knobs the
    /// [`Scheduler`](crate::scheduler::Scheduler) reads.
    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    /// Run one cycle. Never panics and never returns an error: failures are
    /// captured in the result and the watermark stays untouched.
    pub async fn execute(&self, cancel: &CancelToken) -> CycleResult {
        match self.run_cycle(cancel).await {
            Ok(result) => result,
            Err(e) => {
                warn!(entity = %self.schema.name, error = %e, "cycle aborted");
                CycleResult {
                    batch: None,
                    events_published: 0,
                    error: Some(e),
                }
            }
        }
    }

    async fn run_cycle(&self, cancel: &CancelToken) -> Result<CycleResult> {
        let entity = self.schema.name.clone();

        // Fetching
        cancel.checkpoint()?;
        debug!(entity = %entity, stage = %CycleStage::Fetching, "cycle stage");
        let after = self
            .tracker
            .load(&entity)
            .await?
            .map(|e| e.last_max_mark);
        let Some(raw) = self.source.fetch(after).await? else {
            debug!(entity = %entity, "no changes");
            return Ok(CycleResult::default());
        };

        // Consolidating
        cancel.checkpoint()?;
        debug!(entity = %entity, stage = %CycleStage::Consolidating, "cycle stage");
        let Some(mut batch) = consolidate(&self.schema, raw, self.config.malformed_row_policy)? else {
            return Ok(CycleResult::default());
        };

        // Mapping
        cancel.checkpoint()?;
        debug!(entity = %entity, stage = %CycleStage::Mapping, "cycle stage");
        self.mapper.ensure_mapped(&self.schema, &mut batch).await?;

        // Formatting
        cancel.checkpoint()?;
        debug!(entity = %entity, stage = %CycleStage::Formatting, "cycle stage");
        let (events, delivered_hashes) = self.format_events(&batch).await;

        // Publishing
        cancel.checkpoint()?;
        debug!(entity = %entity, stage = %CycleStage::Publishing, count = events.len(), "cycle stage");
        self.publish(&events).await?;

        // Completing. The outbox writes above and this completion belong to
        // one unit of work: a transactional store binds them in a single
        // transaction, and the enqueue-first ordering means a crash in
        // between redelivers instead of losing events.
        cancel.checkpoint()?;
        debug!(entity = %entity, stage = %CycleStage::Completing, "cycle stage");
        self.source
            .complete(batch.range, &batch.correlation_id)
            .await?;
        self.tracker
            .complete(&entity, batch.range, &batch.correlation_id)
            .await?;

        // Only now may delivered content suppress future events; a failed
        // cycle above re-emits everything.
        for (key, hash) in delivered_hashes {
            self.dedup.record(&self.schema.root.table, &key, &hash).await;
        }
        // Physically deleted rows never reappear; keeping their
        // fingerprints would only grow the cache.
        for envelope in batch.envelopes.iter().filter(|e| e.row.is_physically_deleted) {
            self.dedup.forget(&self.schema.root.table, &envelope.key).await;
        }

        let mut result = CycleResult {
            events_published: events.len(),
            error: None,
            batch: Some(batch),
        };
        if let Some(batch) = &result.batch {
            if batch.malformed_rows > 0 && self.config.malformed_row_policy == ErrorPolicy::CompleteWithError {
                result.error = Some(RelayError::malformed_row(
                    self.schema.root.table.qualified(),
                    format!("{} malformed rows dropped", batch.malformed_rows),
                ));
            }
            info!(
                entity = %entity,
                range = %batch.range,
                envelopes = batch.len(),
                events = result.events_published,
                "cycle complete"
            );
        }
        Ok(result)
    }

    /// Format one event per envelope that should emit, returning the events
    /// and the `(key, hash)` pairs to record once the cycle completes.
    async fn format_events(
        &self,
        batch: &ConsolidatedBatch,
    ) -> (Vec<EventData>, Vec<(String, String)>) {
        let root_table = self.schema.root.table.qualified();
        let mut events = Vec::new();
        let mut delivered = Vec::new();

        for envelope in &batch.envelopes {
            let snapshot = envelope.snapshot();
            // Sources that compute no fingerprint get one from the
            // canonicalized snapshot.
            let hash = if envelope.row.tracking_hash.is_empty() {
                format::etag(&snapshot, &self.formatter.etag_excluded, &[])
            } else {
                envelope.row.tracking_hash.clone()
            };

            // Deletes always emit; there may be no later chance to diff.
            if envelope.row.op != OperationKind::Delete
                && self
                    .dedup
                    .is_unchanged(&self.schema.root.table, &envelope.key, &hash)
                    .await
            {
                continue;
            }

            let table_key = envelope.external_id.as_deref();
            let source_key = table_key.unwrap_or(&envelope.key);
            events.push(EventData {
                id: event_id(&self.schema.name, &envelope.key, &hash, batch.range),
                subject: format::subject(
                    self.formatter.subject_format,
                    &self.formatter.separator,
                    &root_table,
                    &envelope.key,
                    table_key,
                ),
                action: format::action(self.formatter.action_format, envelope.row.op),
                event_type: self.schema.name.clone(),
                source: format::source(
                    self.formatter.source_format,
                    &self.formatter.base_uri,
                    source_key,
                ),
                timestamp: Utc::now(),
                correlation_id: Some(batch.correlation_id.clone()),
                data: snapshot,
                primary_key: envelope.key.clone(),
            });
            delivered.push((envelope.key.clone(), hash));
        }
        (events, delivered)
    }

    async fn publish(&self, events: &[EventData]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        match &self.publish_mode {
            PublishMode::Direct(sender) => {
                for event in events {
                    let record = OutboxRecord::from_event(event)?;
                    sender
                        .send(&record)
                        .await
                        .map_err(|e| RelayError::publish(e.to_string()))?;
                }
            }
            PublishMode::Outbox(store) => {
                let records = events
                    .iter()
                    .map(OutboxRecord::from_event)
                    .collect::<Result<Vec<_>>>()?;
                store
                    .enqueue(records)
                    .await
                    .map_err(|e| RelayError::publish(e.to_string()))?;
            }
            PublishMode::Registry(registry) => {
                for event in events {
                    registry
                        .dispatch(event, self.config.missing_consumer_policy)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Deterministic event id over the cycle inputs.
///
/// A re-run of the same raw batch after a failed completion produces the
/// same ids, so consumers deduplicating by id treat the re-published
/// events as the relay re-sends they effectively are.
fn event_id(entity: &str, key: &str, tracking_hash: &str, range: MarkRange) -> String {
    let name = format!("{entity}:{key}:{tracking_hash}:{range}");
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeRow, ChildRowSet, TableRef, TableRowSet};
    use crate::format::{ActionFormat, SourceFormat, SubjectFormat};
    use crate::mapping::{IdGenerator, MemoryMappingStore, UuidGenerator};
    use crate::outbox::{MemoryOutboxStore, OutboxStore};
    use crate::schema::{ChildSchema, ReferenceBinding, TableSchema};
    use crate::tracker::{MemoryTrackerStore, TrackerStore};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::Mutex;

    /// Batch source fed from a script of canned batches.
    struct ScriptedSource {
        batches: Mutex<VecDeque<RawBatch>>,
        completed: Mutex<Vec<MarkRange>>,
        fetched_after: Mutex<Vec<Option<SequenceMark>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<RawBatch>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                completed: Mutex::new(Vec::new()),
                fetched_after: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl BatchSource for ScriptedSource {
        async fn fetch(&self, after: Option<SequenceMark>) -> Result<Option<RawBatch>> {
            self.fetched_after.lock().await.push(after);
            Ok(self.batches.lock().await.pop_front())
        }

        async fn complete(&self, range: MarkRange, _correlation_id: &str) -> Result<()> {
            self.completed.lock().await.push(range);
            Ok(())
        }
    }

    struct SeqGenerator(AtomicU64);

    #[async_trait::async_trait]
    impl IdGenerator for SeqGenerator {
        async fn generate(&self) -> Result<String> {
            Ok(format!("ext-{}", self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    fn contact_schema() -> EntitySchema {
        let root = TableSchema::new(TableRef::new("Legacy", "Contact"), "ContactId")
            .with_external_id("GlobalId")
            .with_reference(ReferenceBinding::new(
                "AlternateContactId",
                TableRef::new("Legacy", "Contact"),
            ));
        let child = ChildSchema::new(
            TableSchema::new(TableRef::new("Legacy", "ContactPhone"), "PhoneId"),
            "Phones",
            "ContactId",
        );
        EntitySchema::new("Contact", root).with_child(child)
    }

    fn formatter() -> FormatterConfig {
        FormatterConfig::default()
            .subject_format(SubjectFormat::NameOnly)
            .action_format(ActionFormat::PastTense)
            .source_format(SourceFormat::NameAndKey)
            .base_uri("https://api.example.com/contacts")
    }

    fn contact_row(key: &str, alt: Option<&str>, op: OperationKind, mark: u64) -> ChangeRow {
        ChangeRow::new(
            key,
            json!({
                "ContactId": key,
                "GlobalId": null,
                "AlternateContactId": alt,
                "Name": format!("contact-{key}"),
            }),
            op,
            format!("hash-{key}-{mark}"),
            mark,
        )
    }

    fn phone_row(key: &str, contact: &str, mark: u64) -> ChangeRow {
        ChangeRow::new(
            key,
            json!({"PhoneId": key, "ContactId": contact, "Number": "555-0100"}),
            OperationKind::Insert,
            format!("ph-{key}"),
            mark,
        )
    }

    fn raw_batch(roots: Vec<ChangeRow>, phones: Vec<ChangeRow>, range: MarkRange) -> RawBatch {
        RawBatch::new(
            TableRowSet::new(TableRef::new("Legacy", "Contact"), roots),
            vec![ChildRowSet::new(
                TableRef::new("Legacy", "ContactPhone"),
                "ContactId",
                phones,
            )],
            range,
            "corr-1",
        )
    }

    struct Fixture {
        orchestrator: EntityOrchestrator,
        source: Arc<ScriptedSource>,
        tracker: Arc<MemoryTrackerStore>,
        outbox: Arc<MemoryOutboxStore>,
    }

    fn fixture(batches: Vec<RawBatch>) -> Fixture {
        let source = Arc::new(ScriptedSource::new(batches));
        let tracker = Arc::new(MemoryTrackerStore::new());
        let outbox = Arc::new(MemoryOutboxStore::new());
        let mapper = IdentifierMapper::new(
            Arc::new(MemoryMappingStore::new()),
            Arc::new(SeqGenerator(AtomicU64::new(0))),
        );
        let orchestrator = EntityOrchestrator::new(
            contact_schema(),
            EntityConfig::new("Contact"),
            source.clone(),
            mapper,
            tracker.clone(),
            formatter(),
            PublishMode::Outbox(outbox.clone()),
        );
        Fixture {
            orchestrator,
            source,
            tracker,
            outbox,
        }
    }

    #[tokio::test]
    async fn test_scenario_a_insert_with_child() {
        // One inserted root joined to one child row -> exactly one event.
        let fx = fixture(vec![raw_batch(
            vec![contact_row("42", None, OperationKind::Insert, 1)],
            vec![phone_row("p1", "42", 2)],
            MarkRange::new(1, 2),
        )]);

        let result = fx.orchestrator.execute(&CancelToken::new()).await;
        assert!(result.is_success());
        assert_eq!(result.events_published, 1);

        let records = fx.outbox.all().await;
        assert_eq!(records.len(), 1);
        let envelope: serde_json::Value = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(envelope["subject"], "legacy.contact");
        assert_eq!(envelope["action"], "created");
        // Source path contains the table key (the generated external id)
        assert_eq!(
            envelope["source"],
            "https://api.example.com/contacts/ext-0"
        );
        assert_eq!(envelope["data"]["Phones"][0]["Number"], "555-0100");

        // Watermark advanced and the source batch-completed
        let entry = fx.tracker.load("Contact").await.unwrap().unwrap();
        assert_eq!(entry.last_max_mark, 2);
        assert_eq!(*fx.source.completed.lock().await, vec![MarkRange::new(1, 2)]);
    }

    #[tokio::test]
    async fn test_scenario_b_rerun_without_changes() {
        let fx = fixture(vec![raw_batch(
            vec![contact_row("42", None, OperationKind::Insert, 1)],
            vec![],
            MarkRange::new(1, 1),
        )]);

        let first = fx.orchestrator.execute(&CancelToken::new()).await;
        assert_eq!(first.events_published, 1);

        // Source script is exhausted: nothing changed since.
        let second = fx.orchestrator.execute(&CancelToken::new()).await;
        assert!(second.is_success());
        assert!(second.batch.is_none());
        assert_eq!(second.events_published, 0);

        // The second fetch resumed after the advanced watermark.
        assert_eq!(*fx.source.fetched_after.lock().await, vec![None, Some(1)]);
    }

    #[tokio::test]
    async fn test_scenario_c_forward_reference() {
        let fx = fixture(vec![raw_batch(
            vec![
                contact_row("A", Some("B"), OperationKind::Insert, 1),
                contact_row("B", None, OperationKind::Insert, 2),
            ],
            vec![],
            MarkRange::new(1, 2),
        )]);

        let result = fx.orchestrator.execute(&CancelToken::new()).await;
        assert!(result.is_success());

        let batch = result.batch.unwrap();
        let b_external = batch.envelopes[1].external_id.clone().unwrap();
        assert_eq!(
            batch.envelopes[0].row.columns["AlternateContactId"],
            serde_json::Value::String(b_external)
        );
    }

    #[tokio::test]
    async fn test_unchanged_hash_suppresses_event() {
        // The same row (same tracking hash) is re-captured in a second range.
        let row = contact_row("42", None, OperationKind::Update, 1);
        let mut re_captured = row.clone();
        re_captured.sequence_mark = 5;
        let fx = fixture(vec![
            raw_batch(vec![row], vec![], MarkRange::new(1, 1)),
            raw_batch(vec![re_captured], vec![], MarkRange::new(2, 5)),
        ]);

        let first = fx.orchestrator.execute(&CancelToken::new()).await;
        assert_eq!(first.events_published, 1);

        let second = fx.orchestrator.execute(&CancelToken::new()).await;
        assert!(second.is_success());
        assert_eq!(second.events_published, 0);
        // Batch consolidated, but content dedup suppressed the event; the
        // watermark still advanced.
        assert!(second.batch.is_some());
        assert_eq!(
            fx.tracker.load("Contact").await.unwrap().unwrap().last_max_mark,
            5
        );
    }

    #[tokio::test]
    async fn test_delete_always_emits() {
        let row = contact_row("42", None, OperationKind::Delete, 1);
        let mut again = row.clone();
        again.sequence_mark = 2;
        let fx = fixture(vec![
            raw_batch(vec![row], vec![], MarkRange::new(1, 1)),
            raw_batch(vec![again], vec![], MarkRange::new(2, 2)),
        ]);

        assert_eq!(fx.orchestrator.execute(&CancelToken::new()).await.events_published, 1);
        // Identical hash, but deletes are never suppressed.
        assert_eq!(fx.orchestrator.execute(&CancelToken::new()).await.events_published, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_watermark() {
        struct FailingSender;

        #[async_trait::async_trait]
        impl EventSender for FailingSender {
            async fn send(&self, _record: &OutboxRecord) -> Result<()> {
                Err(RelayError::publish("broker down"))
            }
        }

        let source = Arc::new(ScriptedSource::new(vec![raw_batch(
            vec![contact_row("42", None, OperationKind::Insert, 1)],
            vec![],
            MarkRange::new(1, 1),
        )]));
        let tracker = Arc::new(MemoryTrackerStore::new());
        let mapper =
            IdentifierMapper::new(Arc::new(MemoryMappingStore::new()), Arc::new(UuidGenerator));
        let orchestrator = EntityOrchestrator::new(
            contact_schema(),
            EntityConfig::new("Contact"),
            source.clone(),
            mapper,
            tracker.clone(),
            formatter(),
            PublishMode::Direct(Arc::new(FailingSender)),
        );

        let result = orchestrator.execute(&CancelToken::new()).await;
        assert!(matches!(result.error, Some(RelayError::Publish(_))));
        assert_eq!(result.events_published, 0);

        // Batch was neither completed nor tracked; next tick re-fetches.
        assert!(source.completed.lock().await.is_empty());
        assert!(tracker.load("Contact").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_at_stage_boundary() {
        let fx = fixture(vec![raw_batch(
            vec![contact_row("42", None, OperationKind::Insert, 1)],
            vec![],
            MarkRange::new(1, 1),
        )]);

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = fx.orchestrator.execute(&cancel).await;
        assert!(matches!(result.error, Some(RelayError::Cancelled)));
        // Nothing fetched, nothing completed.
        assert!(fx.source.fetched_after.lock().await.is_empty());
        assert_eq!(fx.outbox.pending_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_complete_with_error_policy() {
        // Child row without its join key, policy CompleteWithError: the
        // batch completes, the cycle result carries the error.
        let bad_phone = ChangeRow::new(
            "p9",
            json!({"PhoneId": "p9"}),
            OperationKind::Insert,
            "x",
            2,
        );
        let source = Arc::new(ScriptedSource::new(vec![raw_batch(
            vec![contact_row("42", None, OperationKind::Insert, 1)],
            vec![bad_phone],
            MarkRange::new(1, 2),
        )]));
        let tracker = Arc::new(MemoryTrackerStore::new());
        let outbox = Arc::new(MemoryOutboxStore::new());
        let mapper =
            IdentifierMapper::new(Arc::new(MemoryMappingStore::new()), Arc::new(UuidGenerator));
        let orchestrator = EntityOrchestrator::new(
            contact_schema(),
            EntityConfig::new("Contact").malformed_row_policy(ErrorPolicy::CompleteWithError),
            source.clone(),
            mapper,
            tracker.clone(),
            formatter(),
            PublishMode::Outbox(outbox.clone()),
        );

        let result = orchestrator.execute(&CancelToken::new()).await;
        assert!(matches!(result.error, Some(RelayError::MalformedRow { .. })));
        assert_eq!(result.events_published, 1);
        // Completed despite the error
        assert_eq!(tracker.load("Contact").await.unwrap().unwrap().last_max_mark, 2);
    }

    /// Source whose batch-complete call fails a configured number of times
    /// before succeeding; the batch stays fetchable until completed.
    struct FlakyCompleteSource {
        batch: RawBatch,
        failures_left: Mutex<u32>,
        completed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl BatchSource for FlakyCompleteSource {
        async fn fetch(&self, _after: Option<SequenceMark>) -> Result<Option<RawBatch>> {
            if self.completed.load(Ordering::SeqCst) {
                Ok(None)
            } else {
                Ok(Some(self.batch.clone()))
            }
        }

        async fn complete(&self, _range: MarkRange, _correlation_id: &str) -> Result<()> {
            let mut left = self.failures_left.lock().await;
            if *left > 0 {
                *left -= 1;
                return Err(RelayError::transient("deadlock victim"));
            }
            self.completed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retried_cycle_reuses_event_ids() {
        // complete() fails once, so the same raw range is re-fetched and
        // re-enqueued. Consumers deduplicate by event id, which therefore
        // must be stable across the retry.
        let source = Arc::new(FlakyCompleteSource {
            batch: raw_batch(
                vec![contact_row("42", None, OperationKind::Insert, 1)],
                vec![],
                MarkRange::new(1, 1),
            ),
            failures_left: Mutex::new(1),
            completed: AtomicBool::new(false),
        });
        let tracker = Arc::new(MemoryTrackerStore::new());
        let outbox = Arc::new(MemoryOutboxStore::new());
        let mapper = IdentifierMapper::new(
            Arc::new(MemoryMappingStore::new()),
            Arc::new(SeqGenerator(AtomicU64::new(0))),
        );
        let orchestrator = EntityOrchestrator::new(
            contact_schema(),
            EntityConfig::new("Contact"),
            source.clone(),
            mapper,
            tracker.clone(),
            formatter(),
            PublishMode::Outbox(outbox.clone()),
        );

        let first = orchestrator.execute(&CancelToken::new()).await;
        assert!(matches!(first.error, Some(RelayError::TransientData(_))));
        assert!(tracker.load("Contact").await.unwrap().is_none());

        let second = orchestrator.execute(&CancelToken::new()).await;
        assert!(second.is_success());

        // Two records in the outbox, one id: the retry is indistinguishable
        // from a relay re-send downstream.
        let records = outbox.all().await;
        assert_eq!(records.len(), 2);
        let a: serde_json::Value = serde_json::from_slice(&records[0].payload).unwrap();
        let b: serde_json::Value = serde_json::from_slice(&records[1].payload).unwrap();
        assert_eq!(a["id"], b["id"]);
        assert_eq!(a["data"], b["data"]);
    }

    #[tokio::test]
    async fn test_event_id_deterministic_per_inputs() {
        let id = event_id("Contact", "42", "h1", MarkRange::new(1, 3));
        assert_eq!(id, event_id("Contact", "42", "h1", MarkRange::new(1, 3)));
        assert_ne!(id, event_id("Contact", "42", "h2", MarkRange::new(1, 3)));
        assert_ne!(id, event_id("Contact", "43", "h1", MarkRange::new(1, 3)));
        assert_ne!(id, event_id("Contact", "42", "h1", MarkRange::new(1, 4)));
    }

    #[tokio::test]
    async fn test_registry_mode_honors_missing_consumer_policy() {
        use crate::registry::EventConsumer;
        use std::sync::atomic::AtomicUsize;

        struct CountingConsumer(AtomicUsize);

        #[async_trait::async_trait]
        impl EventConsumer for CountingConsumer {
            async fn handle(&self, _event: &EventData) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let build = |policy: ErrorPolicy, registry: Arc<ConsumerRegistry>| {
            let source = Arc::new(ScriptedSource::new(vec![raw_batch(
                vec![contact_row("42", None, OperationKind::Insert, 1)],
                vec![],
                MarkRange::new(1, 1),
            )]));
            EntityOrchestrator::new(
                contact_schema(),
                EntityConfig::new("Contact").missing_consumer_policy(policy),
                source,
                IdentifierMapper::new(
                    Arc::new(MemoryMappingStore::new()),
                    Arc::new(UuidGenerator),
                ),
                Arc::new(MemoryTrackerStore::new()),
                formatter(),
                PublishMode::Registry(registry),
            )
        };

        // Handle: an unregistered (subject, action) fails the cycle.
        let empty = Arc::new(ConsumerRegistry::new());
        let result = build(ErrorPolicy::Handle, empty).execute(&CancelToken::new()).await;
        assert!(matches!(result.error, Some(RelayError::NoConsumer { .. })));

        // Silent: the event is skipped and the cycle completes.
        let silent = Arc::new(ConsumerRegistry::new());
        let result = build(ErrorPolicy::Silent, silent).execute(&CancelToken::new()).await;
        assert!(result.is_success());

        // A registered consumer receives the event.
        let registry = Arc::new(ConsumerRegistry::new());
        let consumer = Arc::new(CountingConsumer(AtomicUsize::new(0)));
        registry
            .register("legacy.contact", "created", consumer.clone())
            .await;
        let result = build(ErrorPolicy::Handle, registry).execute(&CancelToken::new()).await;
        assert!(result.is_success());
        assert_eq!(consumer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_physical_delete_drops_fingerprint() {
        let mut gone = contact_row("42", None, OperationKind::Delete, 2);
        gone.is_physically_deleted = true;
        let fx = fixture(vec![
            raw_batch(
                vec![contact_row("42", None, OperationKind::Insert, 1)],
                vec![],
                MarkRange::new(1, 1),
            ),
            raw_batch(vec![gone], vec![], MarkRange::new(2, 2)),
        ]);

        fx.orchestrator.execute(&CancelToken::new()).await;
        assert_eq!(fx.orchestrator.dedup.len().await, 1);

        fx.orchestrator.execute(&CancelToken::new()).await;
        // The row is gone for good; nothing left to compare against.
        assert!(fx.orchestrator.dedup.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_fetch_is_null_result() {
        let fx = fixture(vec![]);
        let result = fx.orchestrator.execute(&CancelToken::new()).await;
        assert!(result.is_success());
        assert!(result.batch.is_none());
        assert_eq!(result.events_published, 0);
    }
}
