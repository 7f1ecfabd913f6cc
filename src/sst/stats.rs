use std::cmp::Ordering;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::{
    composites::{CellNameType, Composite, Prefix},
    db::{cell::OnDiskAtom, decorated_key::DecoratedKey, deletion::DeletionTime},
    encoding::{from_hex, to_hex},
};

/// What a reader needs to know about a segment without opening its data
/// file.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentStats {
    pub partitions: u64,
    pub min_key: Option<DecoratedKey>,
    pub max_key: Option<DecoratedKey>,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub max_local_deletion_time: i32,
    pub min_cell_name: Option<Composite>,
    pub max_cell_name: Option<Composite>,
    /// Any partition deletion or range tombstone.
    pub has_tombstones: bool,
}

impl Default for SegmentStats {
    fn default() -> Self {
        SegmentStats {
            partitions: 0,
            min_key: None,
            max_key: None,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            max_local_deletion_time: i32::MIN,
            min_cell_name: None,
            max_cell_name: None,
            has_tombstones: false,
        }
    }
}

fn to_composite<P: Prefix + ?Sized>(p: &P) -> Composite {
    Composite::new(p.components().iter().cloned()).with_eoc(p.eoc())
}

impl SegmentStats {
    /// Keys must be observed in order.
    pub fn observe_key(&mut self, key: &DecoratedKey) {
        if self.min_key.is_none() {
            self.min_key = Some(key.clone());
        }
        self.max_key = Some(key.clone());
        self.partitions += 1;
    }

    pub fn observe_deletion(&mut self, dt: &DeletionTime) {
        if dt.is_live() {
            return;
        }
        self.has_tombstones = true;
        self.observe_timestamp(dt.marked_for_delete_at);
        self.max_local_deletion_time = self.max_local_deletion_time.max(dt.local_deletion_time);
    }

    fn observe_timestamp(&mut self, ts: i64) {
        self.min_timestamp = self.min_timestamp.min(ts);
        self.max_timestamp = self.max_timestamp.max(ts);
    }

    fn observe_name<P: Prefix + ?Sized>(&mut self, comparator: &CellNameType, low: &P, high: &P) {
        match &self.min_cell_name {
            Some(min) if comparator.compare(min, low) != Ordering::Greater => {}
            _ => self.min_cell_name = Some(to_composite(low)),
        }
        match &self.max_cell_name {
            Some(max) if comparator.compare(max, high) != Ordering::Less => {}
            _ => self.max_cell_name = Some(to_composite(high)),
        }
    }

    pub fn observe_atom(&mut self, comparator: &CellNameType, atom: &OnDiskAtom) {
        match atom {
            OnDiskAtom::Cell(cell) => {
                self.observe_timestamp(cell.timestamp);
                if cell.local_deletion_time() != i32::MAX {
                    self.max_local_deletion_time =
                        self.max_local_deletion_time.max(cell.local_deletion_time());
                }
                self.observe_name(comparator, &cell.name, &cell.name);
            }
            OnDiskAtom::RangeTombstone(rt) => {
                self.observe_deletion(&rt.data);
                self.observe_name(comparator, &rt.min, &rt.max);
            }
        }
    }

    pub fn to_json(&self, comparator: &CellNameType) -> anyhow::Result<String> {
        let name = |n: &Option<Composite>| -> anyhow::Result<Option<String>> {
            n.as_ref()
                .map(|c| Ok(to_hex(&comparator.to_bytes(c)?)))
                .transpose()
        };
        let file = StatsFile {
            partitions: self.partitions,
            min_key: self.min_key.as_ref().map(|k| to_hex(k.key())),
            max_key: self.max_key.as_ref().map(|k| to_hex(k.key())),
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            max_local_deletion_time: self.max_local_deletion_time,
            min_cell_name: name(&self.min_cell_name)?,
            max_cell_name: name(&self.max_cell_name)?,
            has_tombstones: self.has_tombstones,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn from_json(s: &str, comparator: &CellNameType) -> anyhow::Result<Self> {
        let file: StatsFile = serde_json::from_str(s)?;
        let hex = |s: &str| from_hex(s).ok_or_else(|| anyhow!("invalid hex {:?} in statistics", s));
        let key = |k: &Option<String>| -> anyhow::Result<Option<DecoratedKey>> {
            k.as_deref().map(|k| Ok(DecoratedKey::new(hex(k)?))).transpose()
        };
        let name = |n: &Option<String>| -> anyhow::Result<Option<Composite>> {
            n.as_deref()
                .map(|n| Ok(comparator.composite_from_bytes(&hex(n)?)?))
                .transpose()
        };
        Ok(SegmentStats {
            partitions: file.partitions,
            min_key: key(&file.min_key)?,
            max_key: key(&file.max_key)?,
            min_timestamp: file.min_timestamp,
            max_timestamp: file.max_timestamp,
            max_local_deletion_time: file.max_local_deletion_time,
            min_cell_name: name(&file.min_cell_name)?,
            max_cell_name: name(&file.max_cell_name)?,
            has_tombstones: file.has_tombstones,
        })
    }
}

// Keys and names are stored as hex so the file stays readable JSON.
#[derive(Serialize, Deserialize, Debug)]
struct StatsFile {
    partitions: u64,
    min_key: Option<String>,
    max_key: Option<String>,
    min_timestamp: i64,
    max_timestamp: i64,
    max_local_deletion_time: i32,
    min_cell_name: Option<String>,
    max_cell_name: Option<String>,
    has_tombstones: bool,
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::SegmentStats;
    use crate::{
        composites::Composite,
        config::test::sparse_table,
        db::{
            cell::{Cell, OnDiskAtom},
            decorated_key::DecoratedKey,
            deletion::{DeletionTime, RangeTombstone},
        },
        marshal::DataType,
    };

    #[test]
    fn test_stats() {
        let md = sparse_table();
        let t = &md.comparator;
        let row = |i: &str| Composite::new([DataType::Int32.from_string(i).unwrap()]);

        let mut stats = SegmentStats::default();
        stats.observe_key(&DecoratedKey::new("a"));
        stats.observe_deletion(&DeletionTime::LIVE);
        stats.observe_atom(
            t,
            &OnDiskAtom::Cell(Cell::new(t.create(&row("5"), b"a").unwrap(), Bytes::new(), 3)),
        );
        assert!(!stats.has_tombstones);
        stats.observe_key(&DecoratedKey::new("b"));
        stats.observe_atom(
            t,
            &OnDiskAtom::RangeTombstone(RangeTombstone::new(
                row("2").start(),
                row("3").end(),
                DeletionTime::new(9, 100),
            )),
        );

        assert_eq!(stats.partitions, 2);
        assert_eq!(stats.max_key, Some(DecoratedKey::new("b")));
        assert_eq!((stats.min_timestamp, stats.max_timestamp), (3, 9));
        assert_eq!(stats.max_local_deletion_time, 100);
        assert_eq!(stats.min_cell_name, Some(row("2").start()));
        assert!(stats.has_tombstones);

        let json = stats.to_json(t).unwrap();
        assert_eq!(SegmentStats::from_json(&json, t).unwrap(), stats);
        assert!(SegmentStats::from_json("{}", t).is_err());
    }
}
