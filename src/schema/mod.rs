//! # Schema handle
//!
//! An immutable descriptor of a column family: names, key and column types,
//! compaction-strategy choice, and a stable identifier. Handed around as
//! `Arc<Schema>`; a schema change installs a new handle, it never mutates
//! an existing one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::consts::DEFAULT_GC_GRACE_SECONDS;

pub type SchemaHandle = Arc<Schema>;

/// Types a clustering component or a regular column may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    BigInt,
    Text,
    Bytes,
}

/// Compaction strategy chosen for a column family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionStrategyKind {
    SizeTiered,
    Null,
}

/// Immutable column family descriptor.
#[derive(Clone, Debug)]
pub struct Schema {
    /// Keyspace the column family belongs to
    pub keyspace: String,

    /// Column family name
    pub name: String,

    /// Stable identifier, survives renames
    pub id: Uuid,

    /// Type of the partition key
    pub partition_key_type: ColumnType,

    /// Types of the clustering components, outermost first
    pub clustering_types: Vec<ColumnType>,

    /// Regular columns by name
    pub regular_columns: BTreeMap<String, ColumnType>,

    /// Strategy driving background compaction for this column family
    pub compaction_strategy: CompactionStrategyKind,

    /// Seconds a tombstone must survive before compaction may purge it
    pub gc_grace_seconds: u32,

    /// Free-form options, as configured
    pub options: BTreeMap<String, String>,
}

impl Schema {
    pub fn builder(keyspace: impl Into<String>, name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            keyspace: keyspace.into(),
            name: name.into(),
            id: None,
            partition_key_type: ColumnType::Bytes,
            clustering_types: Vec::new(),
            regular_columns: BTreeMap::new(),
            compaction_strategy: CompactionStrategyKind::SizeTiered,
            gc_grace_seconds: DEFAULT_GC_GRACE_SECONDS,
            options: BTreeMap::new(),
        }
    }

    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        self.regular_columns.get(column).copied()
    }
}

pub struct SchemaBuilder {
    keyspace: String,
    name: String,
    id: Option<Uuid>,
    partition_key_type: ColumnType,
    clustering_types: Vec<ColumnType>,
    regular_columns: BTreeMap<String, ColumnType>,
    compaction_strategy: CompactionStrategyKind,
    gc_grace_seconds: u32,
    options: BTreeMap<String, String>,
}

impl SchemaBuilder {
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn partition_key(mut self, t: ColumnType) -> Self {
        self.partition_key_type = t;
        self
    }

    pub fn clustering(mut self, types: Vec<ColumnType>) -> Self {
        self.clustering_types = types;
        self
    }

    pub fn column(mut self, name: impl Into<String>, t: ColumnType) -> Self {
        self.regular_columns.insert(name.into(), t);
        self
    }

    pub fn compaction_strategy(mut self, kind: CompactionStrategyKind) -> Self {
        self.compaction_strategy = kind;
        self
    }

    pub fn gc_grace_seconds(mut self, seconds: u32) -> Self {
        self.gc_grace_seconds = seconds;
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> SchemaHandle {
        Arc::new(Schema {
            keyspace: self.keyspace,
            name: self.name,
            id: self.id.unwrap_or_else(Uuid::new_v4),
            partition_key_type: self.partition_key_type,
            clustering_types: self.clustering_types,
            regular_columns: self.regular_columns,
            compaction_strategy: self.compaction_strategy,
            gc_grace_seconds: self.gc_grace_seconds,
            options: self.options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let schema = Schema::builder("apps", "events").build();
        assert_eq!(schema.keyspace, "apps");
        assert_eq!(schema.name, "events");
        assert_eq!(schema.compaction_strategy, CompactionStrategyKind::SizeTiered);
        assert!(schema.clustering_types.is_empty());
    }

    #[test]
    fn explicit_id_is_kept() {
        let id = Uuid::new_v4();
        let schema = Schema::builder("apps", "events").with_id(id).build();
        assert_eq!(schema.id, id);
    }

    #[test]
    fn columns_are_typed() {
        let schema = Schema::builder("apps", "events")
            .clustering(vec![ColumnType::BigInt, ColumnType::Text])
            .column("status", ColumnType::Text)
            .build();
        assert_eq!(schema.column_type("status"), Some(ColumnType::Text));
        assert_eq!(schema.column_type("missing"), None);
        assert_eq!(schema.clustering_types.len(), 2);
    }
}
