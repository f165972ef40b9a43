//! Change-capture data model
//!
//! Raw material for one pipeline run: the rows the batch source returns for
//! every participating table, tagged with operation kind, content fingerprint
//! and sequence order.
//!
//! ## Sequence marks
//!
//! A [`SequenceMark`] is a monotonic change-order token from the capture
//! source (an LSN, a rowversion, a log offset). The pipeline never interprets
//! it beyond ordering and range arithmetic.

use serde::{Deserialize, Serialize};

/// Monotonic change-order token (LSN, rowversion, log offset).
pub type SequenceMark = u64;

/// Operation kind for a captured row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// No effective change (re-capture of identical content)
    None,
}

impl OperationKind {
    /// Verb form used by event formatting ("create", "update", "delete").
    pub fn verb(&self) -> &'static str {
        match self {
            OperationKind::Insert => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::None => "none",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Insert => write!(f, "INSERT"),
            OperationKind::Update => write!(f, "UPDATE"),
            OperationKind::Delete => write!(f, "DELETE"),
            OperationKind::None => write!(f, "NONE"),
        }
    }
}

/// A schema-qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Qualified name, e.g. `Legacy.Contact`.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One row returned by the batch source for a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRow {
    /// Internal primary key value, stringified
    pub key: String,
    /// Raw column values as a JSON object
    pub columns: serde_json::Value,
    /// Operation kind
    pub op: OperationKind,
    /// Content fingerprint; identical content re-captures carry the same hash
    pub tracking_hash: String,
    /// Monotonic change-order token
    pub sequence_mark: SequenceMark,
    /// Whether the row was physically removed from the table
    pub is_physically_deleted: bool,
}

impl ChangeRow {
    /// Create a row with explicit metadata.
    pub fn new(
        key: impl Into<String>,
        columns: serde_json::Value,
        op: OperationKind,
        tracking_hash: impl Into<String>,
        sequence_mark: SequenceMark,
    ) -> Self {
        Self {
            key: key.into(),
            columns,
            op,
            tracking_hash: tracking_hash.into(),
            sequence_mark,
            is_physically_deleted: false,
        }
    }

    /// Mark as physically deleted.
    pub fn physically_deleted(mut self) -> Self {
        self.is_physically_deleted = true;
        self
    }

    /// Get a column value as a string, if present and non-null.
    pub fn column_str(&self, column: &str) -> Option<String> {
        match self.columns.get(column) {
            Some(serde_json::Value::Null) | None => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Ordered result set for the root table of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRowSet {
    pub table: TableRef,
    pub rows: Vec<ChangeRow>,
}

impl TableRowSet {
    pub fn new(table: TableRef, rows: Vec<ChangeRow>) -> Self {
        Self { table, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Ordered result set for a joined child table, tagged with its join column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRowSet {
    pub table: TableRef,
    /// Column in the child rows holding the root's internal key
    pub foreign_key_column: String,
    pub rows: Vec<ChangeRow>,
}

impl ChildRowSet {
    pub fn new(
        table: TableRef,
        foreign_key_column: impl Into<String>,
        rows: Vec<ChangeRow>,
    ) -> Self {
        Self {
            table,
            foreign_key_column: foreign_key_column.into(),
            rows,
        }
    }
}

/// Inclusive watermark range observed by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRange {
    pub min: SequenceMark,
    pub max: SequenceMark,
}

impl MarkRange {
    pub fn new(min: SequenceMark, max: SequenceMark) -> Self {
        Self { min, max }
    }
}

impl std::fmt::Display for MarkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Everything the batch source returns for one watermark range.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// Root table rows
    pub root: TableRowSet,
    /// One result set per joined child table
    pub children: Vec<ChildRowSet>,
    /// Observed watermark range
    pub range: MarkRange,
    /// Correlation id propagated into events and the tracker
    pub correlation_id: String,
}

impl RawBatch {
    pub fn new(
        root: TableRowSet,
        children: Vec<ChildRowSet>,
        range: MarkRange,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            root,
            children,
            range,
            correlation_id: correlation_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_verbs() {
        assert_eq!(OperationKind::Insert.verb(), "create");
        assert_eq!(OperationKind::Update.verb(), "update");
        assert_eq!(OperationKind::Delete.verb(), "delete");
    }

    #[test]
    fn test_table_ref_qualified() {
        let t = TableRef::new("Legacy", "Contact");
        assert_eq!(t.qualified(), "Legacy.Contact");
        assert_eq!(t.to_string(), "Legacy.Contact");
    }

    #[test]
    fn test_change_row_column_access() {
        let row = ChangeRow::new(
            "42",
            json!({"Name": "Alice", "Age": 30, "Nick": null}),
            OperationKind::Insert,
            "h1",
            100,
        );

        assert_eq!(row.column_str("Name"), Some("Alice".to_string()));
        assert_eq!(row.column_str("Age"), Some("30".to_string()));
        assert_eq!(row.column_str("Nick"), None);
        assert_eq!(row.column_str("Missing"), None);
    }

    #[test]
    fn test_physically_deleted() {
        let row = ChangeRow::new("1", json!({}), OperationKind::Delete, "h", 5).physically_deleted();
        assert!(row.is_physically_deleted);
    }

    #[test]
    fn test_mark_range_display() {
        let range = MarkRange::new(10, 20);
        assert_eq!(range.to_string(), "[10, 20]");
    }
}
