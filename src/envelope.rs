//! Batch consolidation
//!
//! Joins per-table change rows into one hierarchical entity snapshot per
//! root row. Child rows are grouped by their foreign-key value and attached
//! to the matching root; a declared child table with no matching rows yields
//! an empty collection, never an absent one.
//!
//! An empty root set short-circuits before any child work: a null batch is
//! the common case on a quiet table and must cost nothing.

use crate::change::{ChangeRow, MarkRange, RawBatch};
use crate::config::ErrorPolicy;
use crate::error::{RelayError, Result};
use crate::schema::EntitySchema;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// One consolidated root entity plus its owned child collections.
#[derive(Debug, Clone)]
pub struct EntityEnvelope {
    /// Internal primary key of the root row
    pub key: String,
    /// The root change row; relinking rewrites its columns in place
    pub row: ChangeRow,
    /// Stable external id, set by the identifier mapper
    pub external_id: Option<String>,
    /// Owned collections keyed by collection name; every declared child
    /// collection is present, possibly empty
    pub children: BTreeMap<String, Vec<ChangeRow>>,
}

impl EntityEnvelope {
    /// JSON snapshot of the entity: root columns plus child collections.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut obj = match &self.row.columns {
            serde_json::Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        for (collection, rows) in &self.children {
            let items: Vec<serde_json::Value> = rows.iter().map(|r| r.columns.clone()).collect();
            obj.insert(collection.clone(), serde_json::Value::Array(items));
        }
        serde_json::Value::Object(obj)
    }
}

/// A fully consolidated batch for one tracked entity.
#[derive(Debug, Clone)]
pub struct ConsolidatedBatch {
    pub entity: String,
    pub envelopes: Vec<EntityEnvelope>,
    pub range: MarkRange,
    pub correlation_id: String,
    /// Rows dropped under a row-skipping error policy
    pub malformed_rows: usize,
}

impl ConsolidatedBatch {
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

/// Consolidate a raw multi-table batch into entity envelopes.
///
/// Returns `Ok(None)` when the root set is empty. Under
/// [`ErrorPolicy::Handle`] a malformed child row aborts the batch; under any
/// row-skipping policy the row is dropped and counted.
pub fn consolidate(
    schema: &EntitySchema,
    raw: RawBatch,
    malformed_policy: ErrorPolicy,
) -> Result<Option<ConsolidatedBatch>> {
    if raw.root.is_empty() {
        debug!(entity = %schema.name, "empty root set, skipping consolidation");
        return Ok(None);
    }

    let mut malformed = 0usize;

    // Group every child set by its foreign-key value before touching roots.
    // collection name -> fk value -> rows
    let mut grouped: HashMap<String, HashMap<String, Vec<ChangeRow>>> = HashMap::new();
    for child_set in raw.children {
        let Some(child_schema) = schema.child_for(&child_set.table) else {
            return Err(RelayError::config(format!(
                "batch source returned rows for undeclared child table {}",
                child_set.table
            )));
        };
        let groups = grouped.entry(child_schema.collection.clone()).or_default();
        for row in child_set.rows {
            match row.column_str(&child_set.foreign_key_column) {
                Some(fk) => groups.entry(fk).or_default().push(row),
                None => {
                    if !malformed_policy.skips_row() {
                        return Err(RelayError::malformed_row(
                            child_set.table.qualified(),
                            format!("missing join key column '{}'", child_set.foreign_key_column),
                        ));
                    }
                    if malformed_policy != ErrorPolicy::Silent {
                        warn!(
                            table = %child_set.table,
                            column = %child_set.foreign_key_column,
                            "dropping child row without join key"
                        );
                    }
                    malformed += 1;
                }
            }
        }
    }

    let mut envelopes = Vec::with_capacity(raw.root.rows.len());
    for row in raw.root.rows {
        let key = row.key.clone();
        let mut children = BTreeMap::new();
        // Every declared collection is present on every root, even when no
        // child rows matched.
        for child_schema in &schema.children {
            let rows = grouped
                .get_mut(&child_schema.collection)
                .and_then(|g| g.remove(&key))
                .unwrap_or_default();
            children.insert(child_schema.collection.clone(), rows);
        }
        envelopes.push(EntityEnvelope {
            key,
            row,
            external_id: None,
            children,
        });
    }

    Ok(Some(ConsolidatedBatch {
        entity: schema.name.clone(),
        envelopes,
        range: raw.range,
        correlation_id: raw.correlation_id,
        malformed_rows: malformed,
    }))
}
