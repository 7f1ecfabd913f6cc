// Table schema.
//
// `CfMetaData` is an immutable snapshot of one table's definition. Schema
// changes build a new snapshot and publish it through `Schema`; a read holds
// the `Arc` it started with until it is done, so it never observes a
// half-applied change.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    composites::{CellName, CellNameType},
    error::{Error, Result},
    marshal::DataType,
};

pub const DEFAULT_GC_GRACE_SECONDS: i32 = 864_000;
pub const DEFAULT_COLUMN_INDEX_SIZE: usize = 64 * 1024;
pub const DEFAULT_TOMBSTONE_WARN_THRESHOLD: usize = 1000;
pub const DEFAULT_TOMBSTONE_FAILURE_THRESHOLD: usize = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    PartitionKey,
    ClusteringColumn,
    Regular,
    CompactValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    Keys,
    Composites,
    Custom,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub validator: DataType,
    pub kind: ColumnKind,
    /// Position within the partition key or the clustering columns. `None`
    /// means the column spans every component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_type: Option<IndexType>,
}

impl ColumnDefinition {
    pub fn regular(name: &str, validator: DataType) -> Self {
        ColumnDefinition {
            name: name.to_owned(),
            validator,
            kind: ColumnKind::Regular,
            component_index: None,
            index_name: None,
            index_type: None,
        }
    }

    pub fn is_on_all_components(&self) -> bool {
        self.component_index.is_none()
    }

    /// Component position; 0 when the column is on all components, so check
    /// `is_on_all_components` first when that matters.
    pub fn position(&self) -> usize {
        self.component_index.unwrap_or(0)
    }

    pub fn is_indexed(&self) -> bool {
        self.index_type.is_some()
    }

    /// Applies an update of this column's definition. While the column is
    /// indexed its validator may only change to an order-compatible type and
    /// the index keeps its name.
    pub fn apply(&self, update: &ColumnDefinition) -> Result<ColumnDefinition> {
        if self.kind != update.kind || self.component_index != update.component_index {
            return Err(Error::configuration(format!(
                "cannot change the kind or position of column {}",
                self.name
            )));
        }
        if self.is_indexed() && update.is_indexed() {
            if !update.validator.is_compatible_with(&self.validator) {
                return Err(Error::configuration(format!(
                    "cannot modify validator to a non-order-compatible one for column {} since an index is set",
                    self.name
                )));
            }
            if self.index_name != update.index_name {
                return Err(Error::configuration("cannot modify index name"));
            }
        }
        Ok(ColumnDefinition {
            name: self.name.clone(),
            validator: update.validator.clone(),
            kind: self.kind,
            component_index: self.component_index,
            index_name: update.index_name.clone(),
            index_type: update.index_type,
        })
    }
}

fn default_bytes_type() -> DataType {
    DataType::Bytes
}

fn default_gc_grace_seconds() -> i32 {
    DEFAULT_GC_GRACE_SECONDS
}

fn default_column_index_size() -> usize {
    DEFAULT_COLUMN_INDEX_SIZE
}

fn default_tombstone_warn_threshold() -> usize {
    DEFAULT_TOMBSTONE_WARN_THRESHOLD
}

fn default_tombstone_failure_threshold() -> usize {
    DEFAULT_TOMBSTONE_FAILURE_THRESHOLD
}

/// Serialized table definition, as loaded from JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableOptions {
    pub keyspace: String,
    pub name: String,
    #[serde(default = "default_bytes_type")]
    pub key_validator: DataType,
    pub comparator: DataType,
    #[serde(default)]
    pub dense: bool,
    #[serde(default = "default_bytes_type")]
    pub default_validator: DataType,
    #[serde(default)]
    pub columns: Vec<ColumnDefinition>,
    #[serde(default = "default_gc_grace_seconds")]
    pub gc_grace_seconds: i32,
    #[serde(default = "default_column_index_size")]
    pub column_index_size: usize,
    #[serde(default = "default_tombstone_warn_threshold")]
    pub tombstone_warn_threshold: usize,
    #[serde(default = "default_tombstone_failure_threshold")]
    pub tombstone_failure_threshold: usize,
}

impl TableOptions {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[derive(Clone, Debug)]
pub struct CfMetaData {
    pub keyspace: String,
    pub name: String,
    pub key_validator: DataType,
    pub comparator: CellNameType,
    pub default_validator: DataType,
    columns: BTreeMap<String, ColumnDefinition>,
    pub gc_grace_seconds: i32,
    pub column_index_size: usize,
    pub tombstone_warn_threshold: usize,
    pub tombstone_failure_threshold: usize,
}

impl CfMetaData {
    pub fn new(options: TableOptions) -> Result<Self> {
        let comparator = CellNameType::from_data_type(&options.comparator, options.dense)?;
        if options.gc_grace_seconds < 0 {
            return Err(Error::configuration("gc_grace_seconds must not be negative"));
        }
        if options.tombstone_warn_threshold > options.tombstone_failure_threshold {
            return Err(Error::configuration(
                "tombstone_warn_threshold must not exceed tombstone_failure_threshold",
            ));
        }
        let mut md = CfMetaData {
            keyspace: options.keyspace,
            name: options.name,
            key_validator: options.key_validator,
            comparator,
            default_validator: options.default_validator,
            columns: BTreeMap::new(),
            gc_grace_seconds: options.gc_grace_seconds,
            column_index_size: options.column_index_size,
            tombstone_warn_threshold: options.tombstone_warn_threshold,
            tombstone_failure_threshold: options.tombstone_failure_threshold,
        };
        for def in options.columns {
            md = md.add_column_definition(def)?;
        }
        Ok(md)
    }

    pub fn options(&self) -> TableOptions {
        TableOptions {
            keyspace: self.keyspace.clone(),
            name: self.name.clone(),
            key_validator: self.key_validator.clone(),
            comparator: self.comparator.as_data_type(),
            dense: self.comparator.is_dense(),
            default_validator: self.default_validator.clone(),
            columns: self.columns.values().cloned().collect(),
            gc_grace_seconds: self.gc_grace_seconds,
            column_index_size: self.column_index_size,
            tombstone_warn_threshold: self.tombstone_warn_threshold,
            tombstone_failure_threshold: self.tombstone_failure_threshold,
        }
    }

    /// Tombstones whose local deletion time is at or before this may be
    /// purged.
    pub fn gc_before(&self, now_seconds: i32) -> i32 {
        now_seconds.saturating_sub(self.gc_grace_seconds)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.get(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.values()
    }

    /// Type that the value of a cell with this name must have.
    pub fn value_validator(&self, name: &CellName) -> &DataType {
        let column = name
            .cql3_column_name()
            .and_then(|c| std::str::from_utf8(c).ok())
            .and_then(|c| self.columns.get(c));
        match column {
            Some(def) if name.is_collection_cell() => {
                def.validator.value_comparator().unwrap_or(&def.validator)
            }
            Some(def) => &def.validator,
            None => &self.default_validator,
        }
    }

    /// Returns a new snapshot with the column added, or updated if it already
    /// exists. Regular columns of sparse tables get their names interned.
    pub fn add_column_definition(&self, def: ColumnDefinition) -> Result<CfMetaData> {
        let mut md = self.clone();
        let def = match md.columns.get(&def.name) {
            Some(existing) => existing.apply(&def)?,
            None => def,
        };
        if def.kind == ColumnKind::Regular && !md.comparator.is_dense() {
            md.comparator
                .add_cql3_column(Bytes::copy_from_slice(def.name.as_bytes()));
        }
        md.columns.insert(def.name.clone(), def);
        Ok(md)
    }

    pub fn drop_column(&self, name: &str) -> Result<CfMetaData> {
        let mut md = self.clone();
        let def = md
            .columns
            .remove(name)
            .ok_or_else(|| Error::configuration(format!("no column named {}", name)))?;
        if def.kind != ColumnKind::Regular {
            return Err(Error::configuration(format!(
                "cannot drop primary key column {}",
                name
            )));
        }
        md.comparator.remove_cql3_column(name.as_bytes());
        debug!("dropped column {} from {}.{}", name, md.keyspace, md.name);
        Ok(md)
    }
}

/// Holds the current schema snapshot of a table.
#[derive(Debug)]
pub struct Schema {
    current: RwLock<Arc<CfMetaData>>,
}

impl Schema {
    pub fn new(md: CfMetaData) -> Self {
        Schema {
            current: RwLock::new(Arc::new(md)),
        }
    }

    pub fn snapshot(&self) -> Arc<CfMetaData> {
        // A panic while holding the lock cannot leave a torn snapshot: the
        // slot only ever holds complete ones.
        match self.current.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Builds and publishes a new snapshot. Nothing is published if `f`
    /// fails.
    pub fn update<F>(&self, f: F) -> Result<Arc<CfMetaData>>
    where
        F: FnOnce(&CfMetaData) -> Result<CfMetaData>,
    {
        let mut slot = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Arc::new(f(&slot)?);
        *slot = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{CfMetaData, ColumnDefinition, IndexType, Schema, TableOptions};
    use crate::{composites::Composite, error::Error, marshal::DataType};

    /// A table keyed by an `Int32Type` clustering column with regular columns
    /// `a`, `b` and a list column `l`.
    pub(crate) fn sparse_table() -> CfMetaData {
        CfMetaData::new(
            TableOptions::from_json(
                r#"{
                    "keyspace": "ks",
                    "name": "t",
                    "comparator": "CompositeType(Int32Type,UTF8Type,ColumnToCollectionType(6c:ListType(Int32Type)))",
                    "columns": [
                        {"name": "a", "validator": "Int32Type", "kind": "regular"},
                        {"name": "b", "validator": "UTF8Type", "kind": "regular"},
                        {"name": "l", "validator": "ListType(Int32Type)", "kind": "regular"}
                    ]
                }"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let md = sparse_table();
        assert_eq!(md.gc_grace_seconds, 864_000);
        assert_eq!(md.column_index_size, 64 * 1024);
        assert_eq!(md.tombstone_warn_threshold, 1000);
        assert_eq!(md.tombstone_failure_threshold, 100_000);
        assert_eq!(md.key_validator, DataType::Bytes);
        assert_eq!(md.gc_before(1_000_000), 136_000);
        assert_eq!(md.gc_before(i32::MIN + 5), i32::MIN);
        assert_eq!(md.comparator.interned_count(), 3);

        let round_trip = CfMetaData::new(md.options()).unwrap();
        assert_eq!(round_trip.options(), md.options());
    }

    #[test]
    fn test_value_validator() {
        let md = sparse_table();
        let p = Composite::new([DataType::Int32.from_string("1").unwrap()]);
        let a = md.comparator.create(&p, b"a").unwrap();
        assert_eq!(md.value_validator(&a), &DataType::Int32);
        let l = md
            .comparator
            .create_collection_cell(&p, b"l", bytes::Bytes::from_static(b"id"))
            .unwrap();
        assert_eq!(md.value_validator(&l), &DataType::Int32);
        let z = md.comparator.create(&p, b"zzz").unwrap();
        assert_eq!(md.value_validator(&z), &DataType::Bytes);
    }

    #[test]
    fn test_indexed_column_updates() {
        let mut def = ColumnDefinition::regular("a", DataType::Ascii);
        def.index_name = Some("a_idx".into());
        def.index_type = Some(IndexType::Keys);

        let mut widened = def.clone();
        widened.validator = DataType::Utf8;
        assert_eq!(def.apply(&widened).unwrap().validator, DataType::Utf8);

        let mut narrowed = def.clone();
        narrowed.validator = DataType::Int32;
        assert!(matches!(def.apply(&narrowed), Err(Error::Configuration(_))));

        let mut renamed = def.clone();
        renamed.index_name = Some("other".into());
        assert!(matches!(def.apply(&renamed), Err(Error::Configuration(_))));

        // Dropping the index at the same time lifts the restriction.
        let mut unindexed = narrowed.clone();
        unindexed.index_type = None;
        unindexed.index_name = None;
        assert!(def.apply(&unindexed).is_ok());
    }

    #[test]
    fn test_schema_snapshots() {
        let schema = Schema::new(sparse_table());
        let before = schema.snapshot();
        let a = before.comparator.create(&Composite::empty(), b"a");
        // Clustering prefix of the wrong size.
        assert!(a.is_err());

        schema.update(|md| md.drop_column("a")).unwrap();
        let after = schema.snapshot();
        assert!(after.column("a").is_none());
        assert_eq!(after.comparator.interned_count(), 2);
        assert!(before.column("a").is_some());
        assert_eq!(before.comparator.interned_count(), 3);

        let err = schema.update(|md| md.drop_column("nope"));
        assert!(matches!(err, Err(Error::Configuration(_))));
        assert!(schema.snapshot().column("b").is_some());
    }
}
