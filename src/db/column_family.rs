use std::{cmp::Ordering, fmt, mem, sync::Arc};

use super::{
    cell::{Cell, OnDiskAtom},
    deletion::{DeletionInfo, DeletionTime, RangeTombstone},
};
use crate::{
    composites::{CellName, CellNameType},
    config::CfMetaData,
};

/// The cells of one partition, sorted by the table's comparator, plus its
/// deletion info.
#[derive(Clone)]
pub struct ColumnFamily {
    metadata: Arc<CfMetaData>,
    deletion_info: DeletionInfo,
    cells: Vec<Cell>,
}

impl ColumnFamily {
    pub fn new(metadata: Arc<CfMetaData>) -> Self {
        ColumnFamily {
            metadata,
            deletion_info: DeletionInfo::live(),
            cells: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &Arc<CfMetaData> {
        &self.metadata
    }

    pub fn comparator(&self) -> &CellNameType {
        &self.metadata.comparator
    }

    pub fn deletion_info(&self) -> &DeletionInfo {
        &self.deletion_info
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// No cells. The partition may still carry deletions.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn is_marked_for_delete(&self) -> bool {
        !self.deletion_info.is_live()
    }

    /// Merges another partition's deletions into this one.
    pub fn delete(&mut self, info: &DeletionInfo) {
        self.deletion_info.add(&self.metadata.comparator, info);
    }

    pub fn delete_partition(&mut self, dt: DeletionTime) {
        self.deletion_info.delete(dt);
    }

    pub fn add_range_tombstone(&mut self, rt: RangeTombstone) {
        self.deletion_info.add_range(&self.metadata.comparator, rt);
    }

    pub fn add_atom(&mut self, atom: OnDiskAtom) {
        match atom {
            OnDiskAtom::Cell(cell) => self.add_cell(cell),
            OnDiskAtom::RangeTombstone(rt) => self.add_range_tombstone(rt),
        }
    }

    fn search(&self, name: &CellName) -> Result<usize, usize> {
        let comparator = &self.metadata.comparator;
        // Cells mostly arrive in order.
        match self.cells.last() {
            None => return Err(0),
            Some(last) => {
                if comparator.compare(&last.name, name) == Ordering::Less {
                    return Err(self.cells.len());
                }
            }
        }
        self.cells
            .binary_search_by(|c| comparator.compare(&c.name, name))
    }

    /// Adds a cell, reconciling it with any existing cell of the same name.
    pub fn add_cell(&mut self, cell: Cell) {
        match self.search(&cell.name) {
            Ok(idx) => {
                let existing = self.cells[idx].clone();
                self.cells[idx] = existing.reconcile(cell);
            }
            Err(idx) => self.cells.insert(idx, cell),
        }
    }

    /// Adds a cell unless it is shadowed by this partition's deletions or is
    /// a tombstone old enough to be purged.
    pub fn add_if_relevant(&mut self, cell: Cell, gc_before: i32) -> bool {
        if cell.local_deletion_time() <= gc_before {
            return false;
        }
        if self
            .deletion_info
            .is_deleted(&self.metadata.comparator, &cell.name, cell.timestamp)
        {
            return false;
        }
        self.add_cell(cell);
        true
    }

    /// Adds every cell and deletion of `other`.
    pub fn resolve(&mut self, other: &ColumnFamily) {
        self.delete(&other.deletion_info);
        for cell in &other.cells {
            self.add_cell(cell.clone());
        }
    }

    pub fn get_cell(&self, name: &CellName) -> Option<&Cell> {
        self.search(name).ok().map(|idx| &self.cells[idx])
    }

    /// Drops deletions that are old enough to be purged.
    pub fn purge_deletion_info(&mut self, gc_before: i32) {
        self.deletion_info.purge(gc_before);
    }

    /// Range tombstones and cells interleaved in comparator order, the way
    /// they are written to a segment.
    pub fn atoms(&self) -> Vec<OnDiskAtom> {
        let comparator = &self.metadata.comparator;
        let mut out = Vec::with_capacity(self.cells.len() + self.deletion_info.ranges().len());
        let mut ranges = self.deletion_info.ranges().iter().peekable();
        for cell in &self.cells {
            while let Some(rt) = ranges.next_if(|rt| comparator.compare(&rt.min, &cell.name) != Ordering::Greater) {
                out.push(OnDiskAtom::RangeTombstone(rt.clone()));
            }
            out.push(OnDiskAtom::Cell(cell.clone()));
        }
        out.extend(ranges.cloned().map(OnDiskAtom::RangeTombstone));
        out
    }

    pub fn max_timestamp(&self) -> i64 {
        let cells = self.cells.iter().map(|c| c.timestamp);
        let ranges = self
            .deletion_info
            .ranges()
            .iter()
            .map(|r| r.data.marked_for_delete_at);
        cells
            .chain(ranges)
            .fold(self.deletion_info.top_level().marked_for_delete_at, i64::max)
    }

    pub fn memory_size(&self) -> usize {
        mem::size_of::<ColumnFamily>()
            + self.deletion_info.memory_size()
            + self.cells.iter().map(Cell::memory_size).sum::<usize>()
    }
}

impl PartialEq for ColumnFamily {
    fn eq(&self, other: &Self) -> bool {
        self.deletion_info == other.deletion_info && self.cells == other.cells
    }
}

impl fmt::Debug for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnFamily")
            .field("table", &format_args!("{}.{}", self.metadata.keyspace, self.metadata.name))
            .field("deletion_info", &self.deletion_info)
            .field("cells", &self.cells)
            .finish()
    }
}
