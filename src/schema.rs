//! Entity table descriptors
//!
//! Plain configuration values describing how an entity's tables are joined,
//! keyed and mapped. Code-generation tooling (out of scope here) would emit
//! these; handwritten behavior is supplied as strategies instead of
//! inheritance extension points.

use crate::change::TableRef;
use serde::{Deserialize, Serialize};

/// A reference column pointing at another table's internal key.
///
/// During relinking the column value is rewritten to the target table's
/// external id once generation has completed for the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceBinding {
    /// Column carrying the referenced internal key
    pub column: String,
    /// Table whose key the column points at
    pub target: TableRef,
}

impl ReferenceBinding {
    pub fn new(column: impl Into<String>, target: TableRef) -> Self {
        Self {
            column: column.into(),
            target,
        }
    }
}

/// Descriptor for one participating table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableRef,
    /// Primary key column
    pub key_column: String,
    /// Column receiving the stable external id; `None` when the table does
    /// not expose one
    pub external_id_column: Option<String>,
    /// Foreign/alternate reference columns subject to relinking
    pub references: Vec<ReferenceBinding>,
}

impl TableSchema {
    pub fn new(table: TableRef, key_column: impl Into<String>) -> Self {
        Self {
            table,
            key_column: key_column.into(),
            external_id_column: None,
            references: Vec::new(),
        }
    }

    /// Declare the external id column for this table.
    pub fn with_external_id(mut self, column: impl Into<String>) -> Self {
        self.external_id_column = Some(column.into());
        self
    }

    /// Declare a reference column to relink.
    pub fn with_reference(mut self, binding: ReferenceBinding) -> Self {
        self.references.push(binding);
        self
    }

    /// Whether rows of this table need an external id at all.
    pub fn needs_external_id(&self) -> bool {
        self.external_id_column.is_some()
    }
}

/// Descriptor for a joined child table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSchema {
    pub table: TableSchema,
    /// Name of the owned collection on the root entity
    pub collection: String,
    /// Column in child rows holding the root's internal key
    pub foreign_key_column: String,
}

impl ChildSchema {
    pub fn new(
        table: TableSchema,
        collection: impl Into<String>,
        foreign_key_column: impl Into<String>,
    ) -> Self {
        Self {
            table,
            collection: collection.into(),
            foreign_key_column: foreign_key_column.into(),
        }
    }
}

/// Full descriptor for one tracked entity: root table plus owned children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Tracked-entity name used for locks, tracker rows and logging
    pub name: String,
    pub root: TableSchema,
    pub children: Vec<ChildSchema>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>, root: TableSchema) -> Self {
        Self {
            name: name.into(),
            root,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: ChildSchema) -> Self {
        self.children.push(child);
        self
    }

    /// Find the child descriptor for a table, if any.
    pub fn child_for(&self, table: &TableRef) -> Option<&ChildSchema> {
        self.children.iter().find(|c| &c.table.table == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
        EntitySchema::new("contact", root).with_child(child)
    }

    #[test]
    fn test_needs_external_id() {
        let schema = contact_schema();
        assert!(schema.root.needs_external_id());
        assert!(!schema.children[0].table.needs_external_id());
    }

    #[test]
    fn test_child_lookup() {
        let schema = contact_schema();
        let phones = TableRef::new("Legacy", "ContactPhone");
        assert_eq!(
            schema.child_for(&phones).map(|c| c.collection.as_str()),
            Some("Phones")
        );
        assert!(schema.child_for(&TableRef::new("Legacy", "Nope")).is_none());
    }

    #[test]
    fn test_reference_binding() {
        let schema = contact_schema();
        assert_eq!(schema.root.references.len(), 1);
        assert_eq!(schema.root.references[0].column, "AlternateContactId");
    }
}
