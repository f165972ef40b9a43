//! Identifier mapping
//!
//! Generates and persists stable external identifiers for internal database
//! keys, then relinks a consolidated batch so that every primary identity and
//! every foreign/alternate reference carries the external id.
//!
//! ## Two phases
//!
//! 1. **Collect** walks every root and child row, registering a pending
//!    mapping request per distinct `(schema, table, internal_key)` that has
//!    no external id yet. Reference columns register their *target* key.
//! 2. **Generate & relink** resolves every pending key (read from the store
//!    when already mapped, generated exactly once otherwise) and only then
//!    makes a second pass rewriting the batch.
//!
//! Relinking must not begin until generation has finished for all keys: a
//! batch may contain forward references to rows changing in the same batch.

use crate::change::TableRef;
use crate::envelope::ConsolidatedBatch;
use crate::error::{RelayError, Result};
use crate::schema::{EntitySchema, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// One persisted mapping: `(schema, table, internal_key) -> external_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMapping {
    pub table: TableRef,
    pub internal_key: String,
    pub external_id: String,
}

/// Pluggable external-id generator.
#[async_trait::async_trait]
pub trait IdGenerator: Send + Sync {
    async fn generate(&self) -> Result<String>;
}

/// Default generator: random UUID v4.
#[derive(Debug, Default)]
pub struct UuidGenerator;

#[async_trait::async_trait]
impl IdGenerator for UuidGenerator {
    async fn generate(&self) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

/// Trait for mapping storage backends.
#[async_trait::async_trait]
pub trait MappingStore: Send + Sync {
    /// Look up an existing mapping.
    async fn get(&self, table: &TableRef, internal_key: &str) -> Result<Option<String>>;

    /// Persist a new mapping. Inserting the same triple twice with different
    /// external ids is an invariant violation.
    async fn insert(&self, mapping: IdentifierMapping) -> Result<()>;

    /// Total number of persisted mappings.
    async fn len(&self) -> Result<usize>;
}

/// Shared mapping store handle.
pub type SharedMappingStore = Arc<dyn MappingStore>;

fn triple_key(table: &TableRef, internal_key: &str) -> String {
    format!("{}:{}", table.qualified(), internal_key)
}

/// In-memory mapping store.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    mappings: RwLock<HashMap<String, String>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MappingStore for MemoryMappingStore {
    async fn get(&self, table: &TableRef, internal_key: &str) -> Result<Option<String>> {
        let mappings = self.mappings.read().await;
        Ok(mappings.get(&triple_key(table, internal_key)).cloned())
    }

    async fn insert(&self, mapping: IdentifierMapping) -> Result<()> {
        let mut mappings = self.mappings.write().await;
        let key = triple_key(&mapping.table, &mapping.internal_key);
        if let Some(existing) = mappings.get(&key) {
            if existing != &mapping.external_id {
                return Err(RelayError::InvalidState(format!(
                    "conflicting external id for {key}"
                )));
            }
            return Ok(());
        }
        mappings.insert(key, mapping.external_id);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.mappings.read().await.len())
    }
}

/// Persistent mapping store.
///
/// One JSON file per table (`Schema.Table.json`) holding the
/// `internal_key -> external_id` map, written atomically via temp file and
/// rename, fronted by an in-memory cache.
pub struct FileMappingStore {
    base_dir: PathBuf,
    // table qualified name -> (internal key -> external id)
    cache: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl FileMappingStore {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await.map_err(RelayError::Io)?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
        };
        store.load_all().await?;
        Ok(store)
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await.map_err(RelayError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(RelayError::Io)? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    let contents = fs::read_to_string(&path).await.map_err(RelayError::Io)?;
                    let map: HashMap<String, String> = serde_json::from_str(&contents)?;
                    self.cache.write().await.insert(stem.to_string(), map);
                }
            }
        }
        Ok(())
    }

    async fn persist(&self, table: &str, map: &HashMap<String, String>) -> Result<()> {
        let file_path = self.base_dir.join(format!("{table}.json"));
        let temp_path = file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(map)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(RelayError::Io)?;
        file.write_all(json.as_bytes()).await.map_err(RelayError::Io)?;
        file.sync_all().await.map_err(RelayError::Io)?;
        fs::rename(&temp_path, &file_path)
            .await
            .map_err(RelayError::Io)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MappingStore for FileMappingStore {
    async fn get(&self, table: &TableRef, internal_key: &str) -> Result<Option<String>> {
        let cache = self.cache.read().await;
        Ok(cache
            .get(&table.qualified())
            .and_then(|m| m.get(internal_key))
            .cloned())
    }

    async fn insert(&self, mapping: IdentifierMapping) -> Result<()> {
        let mut cache = self.cache.write().await;
        let table = mapping.table.qualified();
        let map = cache.entry(table.clone()).or_default();
        if let Some(existing) = map.get(&mapping.internal_key) {
            if existing != &mapping.external_id {
                return Err(RelayError::InvalidState(format!(
                    "conflicting external id for {}:{}",
                    table, mapping.internal_key
                )));
            }
            return Ok(());
        }
        map.insert(mapping.internal_key.clone(), mapping.external_id.clone());
        let snapshot = map.clone();
        drop(cache);
        self.persist(&table, &snapshot).await
    }

    async fn len(&self) -> Result<usize> {
        let cache = self.cache.read().await;
        Ok(cache.values().map(|m| m.len()).sum())
    }
}

/// Composes a [`MappingStore`] and an [`IdGenerator`] into the batch-level
/// `ensure_mapped` operation.
pub struct IdentifierMapper {
    store: SharedMappingStore,
    generator: Arc<dyn IdGenerator>,
}

impl IdentifierMapper {
    pub fn new(store: SharedMappingStore, generator: Arc<dyn IdGenerator>) -> Self {
        Self { store, generator }
    }

    /// Ensure every row and reference in the batch carries its external id.
    ///
    /// Returns the number of newly generated ids. Generation is strictly
    /// create-if-absent; a generator failure aborts before any relinking.
    pub async fn ensure_mapped(
        &self,
        schema: &EntitySchema,
        batch: &mut ConsolidatedBatch,
    ) -> Result<usize> {
        // Phase 1: collect distinct pending keys across the whole batch.
        let mut pending: HashMap<String, (TableRef, String)> = HashMap::new();

        for envelope in &batch.envelopes {
            collect_for_table(
                &schema.root,
                &envelope.row.columns,
                &envelope.key,
                &mut pending,
            );
            for child_schema in &schema.children {
                if let Some(rows) = envelope.children.get(&child_schema.collection) {
                    for row in rows {
                        collect_for_table(&child_schema.table, &row.columns, &row.key, &mut pending);
                    }
                }
            }
        }

        // Resolve: read existing mappings, generate the rest exactly once.
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut generated = 0usize;
        for (key, (table, internal_key)) in &pending {
            let external = match self.store.get(table, internal_key).await? {
                Some(existing) => existing,
                None => {
                    let id = self.generator.generate().await?;
                    self.store
                        .insert(IdentifierMapping {
                            table: table.clone(),
                            internal_key: internal_key.clone(),
                            external_id: id.clone(),
                        })
                        .await?;
                    generated += 1;
                    id
                }
            };
            resolved.insert(key.clone(), external);
        }

        // Phase 2: relink. All generation is done; forward references inside
        // the batch now resolve regardless of row order.
        for envelope in &mut batch.envelopes {
            if let Some(external_col) = &schema.root.external_id_column {
                envelope.external_id = resolved
                    .get(&triple_key(&schema.root.table, &envelope.key))
                    .cloned()
                    .or_else(|| column_str(&envelope.row.columns, external_col));
            }
            relink_table(&schema.root, &mut envelope.row.columns, &resolved);
            for child_schema in &schema.children {
                if let Some(rows) = envelope.children.get_mut(&child_schema.collection) {
                    for row in rows {
                        relink_table(&child_schema.table, &mut row.columns, &resolved);
                    }
                }
            }
        }

        if generated > 0 {
            debug!(
                entity = %batch.entity,
                generated,
                resolved = resolved.len(),
                "identifier mapping complete"
            );
        }
        Ok(generated)
    }
}

/// Register pending keys for one row of one table: its own identity (when
/// the table exposes an external id and the row does not already carry one)
/// and the target of every reference column.
fn collect_for_table(
    table: &TableSchema,
    columns: &serde_json::Value,
    row_key: &str,
    pending: &mut HashMap<String, (TableRef, String)>,
) {
    if let Some(external_col) = &table.external_id_column {
        let already = columns
            .get(external_col)
            .is_some_and(|v| !v.is_null() && v.as_str().map(|s| !s.is_empty()).unwrap_or(true));
        if !already {
            pending
                .entry(triple_key(&table.table, row_key))
                .or_insert_with(|| (table.table.clone(), row_key.to_string()));
        }
    }
    for binding in &table.references {
        if let Some(target_key) = column_str(columns, &binding.column) {
            pending
                .entry(triple_key(&binding.target, &target_key))
                .or_insert_with(|| (binding.target.clone(), target_key));
        }
    }
}

/// Rewrite one row: its external-id column and every reference column whose
/// target key resolved. Last write wins on conflicting targets.
fn relink_table(
    table: &TableSchema,
    columns: &mut serde_json::Value,
    resolved: &HashMap<String, String>,
) {
    let row_key = column_str(columns, &table.key_column);

    if let (Some(external_col), Some(key)) = (&table.external_id_column, row_key) {
        if let Some(id) = resolved.get(&triple_key(&table.table, &key)) {
            set_column(columns, external_col, id);
        }
    }
    for binding in &table.references {
        if let Some(target_key) = column_str(columns, &binding.column) {
            if let Some(id) = resolved.get(&triple_key(&binding.target, &target_key)) {
                set_column(columns, &binding.column, id);
            }
        }
    }
}

fn column_str(columns: &serde_json::Value, column: &str) -> Option<String> {
    match columns.get(column) {
        Some(serde_json::Value::Null) | None => None,
        Some(serde_json::Value::String(s)) if s.is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn set_column(columns: &mut serde_json::Value, column: &str, value: &str) {
    if let Some(obj) = columns.as_object_mut() {
        obj.insert(
            column.to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }
}
