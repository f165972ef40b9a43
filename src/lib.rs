//! # changerelay - Change consolidation and reliable publish
//!
//! Turns table-level change captures from a legacy database into
//! entity-level events and delivers them at-least-once through a durable
//! outbox.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────────┐   ┌────────────┐   ┌───────────┐
//! │  Batch    │──▶│ Consolidation │──▶│ Identifier │──▶│  Event    │
//! │  Source   │   │  (root+child) │   │  Mapping   │   │ Formatting│
//! └───────────┘   └───────────────┘   └────────────┘   └─────┬─────┘
//!                                                            │
//!       ┌──────────────┐   ┌────────────┐                    │
//!       │   Consumers  │◀──│   Outbox   │◀───────────────────┘
//!       │  / Senders   │   │   Relay    │
//!       └──────────────┘   └────────────┘
//! ```
//!
//! The [`Scheduler`] drives one [`EntityOrchestrator`] loop per tracked
//! entity, guarded by a [`LockProvider`] so concurrent instances never run
//! the same entity's cycle twice. Completed ranges advance a monotonic
//! watermark in the [`TrackerStore`]; content-identical re-captures are
//! suppressed by the [`ChangeDeduplicator`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use changerelay::{
//!     EntityConfig, EntityOrchestrator, FormatterConfig, IdentifierMapper,
//!     MemoryLockProvider, MemoryMappingStore, MemoryOutboxStore,
//!     MemoryTrackerStore, PublishMode, Scheduler, UuidGenerator,
//! };
//! use std::sync::Arc;
//!
//! let outbox = Arc::new(MemoryOutboxStore::new());
//! let mapper = IdentifierMapper::new(
//!     Arc::new(MemoryMappingStore::new()),
//!     Arc::new(UuidGenerator),
//! );
//! let orchestrator = EntityOrchestrator::new(
//!     schema,
//!     EntityConfig::new("Contact"),
//!     source,
//!     mapper,
//!     Arc::new(MemoryTrackerStore::new()),
//!     FormatterConfig::default(),
//!     PublishMode::Outbox(outbox),
//! );
//!
//! let mut scheduler = Scheduler::new(Arc::new(MemoryLockProvider::new()));
//! scheduler.add_entity(orchestrator);
//! scheduler.start();
//! ```

pub mod change;
pub mod config;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod event;
pub mod format;
pub mod mapping;
pub mod orchestrator;
pub mod outbox;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod tracker;

pub use change::{
    ChangeRow, ChildRowSet, MarkRange, OperationKind, RawBatch, SequenceMark, TableRef,
    TableRowSet,
};
pub use config::{EntityConfig, ErrorPolicy, RelayConfig, RelayConfigBuilder};
pub use dedup::ChangeDeduplicator;
pub use envelope::{consolidate, ConsolidatedBatch, EntityEnvelope};
pub use error::{ErrorCategory, RelayError, Result};
pub use event::{EventData, PublishedEvent};
pub use format::{ActionFormat, FormatterConfig, SourceFormat, SubjectFormat};
pub use mapping::{
    FileMappingStore, IdGenerator, IdentifierMapper, IdentifierMapping, MemoryMappingStore,
    SharedMappingStore, UuidGenerator,
};
pub use orchestrator::{
    BatchSource, CancelToken, CycleResult, CycleStage, EntityOrchestrator, PublishMode,
};
pub use outbox::{
    EventSender, MemoryOutboxStore, OutboxRecord, OutboxRelay, OutboxRelayConfig, OutboxStore,
    RelayStatsSnapshot, SharedOutboxStore,
};
pub use registry::{ConsumerRegistry, EventConsumer};
pub use scheduler::{
    LockGuard, LockProvider, MemoryLockProvider, Scheduler, SchedulerStatsSnapshot,
    SharedLockProvider,
};
pub use schema::{ChildSchema, EntitySchema, ReferenceBinding, TableSchema};
pub use tracker::{
    FileTrackerStore, MemoryTrackerStore, SharedTrackerStore, TrackerEntry, TrackerStore,
};
