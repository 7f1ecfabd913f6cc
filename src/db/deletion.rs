use std::{
    cmp::Ordering,
    io::{Read, Write},
};

use crate::{
    composites::{CellName, CellNameType, Composite, Prefix},
    encoding::{DataInput, DataOutput, Decode, Encode},
    error::Result,
};

/// When something was deleted: the write timestamp of the deletion and the
/// local wall-clock second at which it happened. Anything written at or before
/// `marked_for_delete_at` is shadowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeletionTime {
    pub marked_for_delete_at: i64,
    pub local_deletion_time: i32,
}

impl DeletionTime {
    pub const LIVE: DeletionTime = DeletionTime {
        marked_for_delete_at: i64::MIN,
        local_deletion_time: i32::MAX,
    };

    pub fn new(marked_for_delete_at: i64, local_deletion_time: i32) -> Self {
        DeletionTime {
            marked_for_delete_at,
            local_deletion_time,
        }
    }

    pub fn is_live(&self) -> bool {
        *self == DeletionTime::LIVE
    }

    pub fn deletes(&self, timestamp: i64) -> bool {
        timestamp <= self.marked_for_delete_at
    }

    /// Old enough that every replica has seen it.
    pub fn is_purgeable(&self, gc_before: i32) -> bool {
        self.local_deletion_time <= gc_before
    }
}

impl Default for DeletionTime {
    fn default() -> Self {
        DeletionTime::LIVE
    }
}

impl PartialOrd for DeletionTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeletionTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.marked_for_delete_at
            .cmp(&other.marked_for_delete_at)
            .then(self.local_deletion_time.cmp(&other.local_deletion_time))
    }
}

impl Encode for DeletionTime {
    fn encode<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        out.write_i32(self.local_deletion_time)?;
        out.write_i64(self.marked_for_delete_at)
    }

    fn serialized_size(&self) -> usize {
        12
    }
}

impl Decode for DeletionTime {
    fn decode<R: Read + ?Sized>(input: &mut R) -> Result<Self> {
        let local_deletion_time = input.read_i32()?;
        let marked_for_delete_at = input.read_i64()?;
        Ok(DeletionTime {
            marked_for_delete_at,
            local_deletion_time,
        })
    }
}

/// Deletion of every cell whose name falls between `min` and `max`
/// inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeTombstone {
    pub min: Composite,
    pub max: Composite,
    pub data: DeletionTime,
}

impl RangeTombstone {
    pub fn new(min: Composite, max: Composite, data: DeletionTime) -> Self {
        RangeTombstone { min, max, data }
    }

    pub fn includes(&self, comparator: &CellNameType, name: &CellName) -> bool {
        comparator.compare(&self.min, name) != Ordering::Greater
            && comparator.compare(&self.max, name) != Ordering::Less
    }
}

/// Row-level deletion plus any range tombstones of one partition.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DeletionInfo {
    top_level: DeletionTime,
    // Sorted by `min`.
    ranges: Vec<RangeTombstone>,
}

impl DeletionInfo {
    pub fn live() -> Self {
        DeletionInfo::default()
    }

    pub fn new(top_level: DeletionTime) -> Self {
        DeletionInfo {
            top_level,
            ranges: Vec::new(),
        }
    }

    pub fn top_level(&self) -> DeletionTime {
        self.top_level
    }

    pub fn ranges(&self) -> &[RangeTombstone] {
        &self.ranges
    }

    pub fn is_live(&self) -> bool {
        self.top_level.is_live() && self.ranges.is_empty()
    }

    pub fn has_ranges(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Merges a partition-level deletion, keeping the most recent.
    pub fn delete(&mut self, dt: DeletionTime) {
        if dt.marked_for_delete_at > self.top_level.marked_for_delete_at {
            self.top_level = dt;
        }
    }

    pub fn add_range(&mut self, comparator: &CellNameType, rt: RangeTombstone) {
        let idx = self
            .ranges
            .partition_point(|r| comparator.compare(&r.min, &rt.min) != Ordering::Greater);
        self.ranges.insert(idx, rt);
    }

    pub fn add(&mut self, comparator: &CellNameType, other: &DeletionInfo) {
        self.delete(other.top_level);
        for rt in &other.ranges {
            if !self.ranges.contains(rt) {
                self.add_range(comparator, rt.clone());
            }
        }
    }

    /// The most recent deletion covering `name`, if any.
    pub fn deletion_for(&self, comparator: &CellNameType, name: &CellName) -> Option<DeletionTime> {
        let mut best = if self.top_level.is_live() {
            None
        } else {
            Some(self.top_level)
        };
        for rt in &self.ranges {
            if comparator.compare(&rt.min, name) == Ordering::Greater {
                break;
            }
            if rt.includes(comparator, name) && best.map_or(true, |b| rt.data > b) {
                best = Some(rt.data);
            }
        }
        best
    }

    pub fn is_deleted(&self, comparator: &CellNameType, name: &CellName, timestamp: i64) -> bool {
        self.deletion_for(comparator, name)
            .map_or(false, |dt| dt.deletes(timestamp))
    }

    /// Drops every deletion that no replica can still need.
    pub fn purge(&mut self, gc_before: i32) {
        if self.top_level.is_purgeable(gc_before) {
            self.top_level = DeletionTime::LIVE;
        }
        self.ranges.retain(|rt| !rt.data.is_purgeable(gc_before));
    }

    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<DeletionInfo>()
            + self
                .ranges
                .iter()
                .map(|r| {
                    std::mem::size_of::<RangeTombstone>()
                        + r.min.components().iter().map(|c| c.len()).sum::<usize>()
                        + r.max.components().iter().map(|c| c.len()).sum::<usize>()
                })
                .sum::<usize>()
    }
}
