// Column selection for reads.
//
// A `DiskAtomFilter` decides which cells of a partition a query wants, in
// which order, and how many. The same filter drives every source of a read:
// it picks cells out of in-memory partitions, picks the promoted index blocks
// of a segment partition worth reading, and finally folds the reconciled
// cells of all sources into the result row, dropping purgeable tombstones and
// stopping once its limit is reached.

use std::{
    cmp::Ordering,
    io::{Read, Write},
};

use log::warn;

mod counter;
mod names;
mod slice;

pub use counter::ColumnCounter;
pub use names::NamesQueryFilter;
pub use slice::{ColumnSlice, SliceQueryFilter};

use crate::{
    composites::{CellNameType, Composite, Prefix},
    db::{
        cell::{Cell, OnDiskAtom},
        column_family::ColumnFamily,
        merging_iter::MergingIter,
        row_index_entry::{index_for, IndexInfo},
    },
    encoding::{DataInput, DataOutput},
    error::{Error, Result},
    sst::stats::SegmentStats,
};

const SLICE_FILTER: u8 = 0;
const NAMES_FILTER: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskAtomFilter {
    Slice(SliceQueryFilter),
    Names(NamesQueryFilter),
}

impl DiskAtomFilter {
    pub fn is_reversed(&self) -> bool {
        match self {
            DiskAtomFilter::Slice(f) => f.reversed,
            DiskAtomFilter::Names(_) => false,
        }
    }

    /// Order in which this filter returns cells.
    pub fn compare_names<A, B>(&self, comparator: &CellNameType, a: &A, b: &B) -> Ordering
    where
        A: Prefix + ?Sized,
        B: Prefix + ?Sized,
    {
        if self.is_reversed() {
            comparator.reverse_compare(a, b)
        } else {
            comparator.compare(a, b)
        }
    }

    /// Order of atoms read for this filter. A range tombstone sorts by the end
    /// it is first reached from, so it always precedes the cells it covers.
    pub fn compare_atoms(&self, comparator: &CellNameType, a: &OnDiskAtom, b: &OnDiskAtom) -> Ordering {
        let reversed = self.is_reversed();
        self.compare_names(comparator, sort_key(reversed, a), sort_key(reversed, b))
    }

    pub fn update_columns_limit(&mut self, limit: usize) {
        if let DiskAtomFilter::Slice(f) = self {
            f.count = limit;
        }
    }

    pub fn column_counter(&self, comparator: &CellNameType, now: i32) -> ColumnCounter {
        match self {
            DiskAtomFilter::Slice(f) => ColumnCounter::new(f.composites_to_group, now),
            DiskAtomFilter::Names(f) if f.count_cql3_rows => {
                ColumnCounter::new(Some(comparator.clustering_size()), now)
            }
            DiskAtomFilter::Names(_) => ColumnCounter::new(None, now),
        }
    }

    /// Number of results this filter would return from `cf`.
    pub fn get_live_count(&self, cf: &ColumnFamily, now: i32) -> usize {
        let comparator = cf.comparator();
        match self {
            DiskAtomFilter::Slice(f) => {
                let counter = self.column_counter(comparator, now).count_all(
                    cf.cells(),
                    cf.deletion_info(),
                    comparator,
                );
                counter.live().min(f.count)
            }
            DiskAtomFilter::Names(f) if f.count_cql3_rows => {
                let any_live = cf.cells().iter().any(|c| {
                    c.is_live(now) && !cf.deletion_info().is_deleted(comparator, &c.name, c.timestamp)
                });
                usize::from(any_live)
            }
            DiskAtomFilter::Names(_) => self
                .column_counter(comparator, now)
                .count_all(cf.cells(), cf.deletion_info(), comparator)
                .live(),
        }
    }

    pub fn includes(&self, comparator: &CellNameType, atom: &OnDiskAtom) -> bool {
        match (self, atom) {
            (DiskAtomFilter::Slice(f), OnDiskAtom::Cell(c)) => f.includes(comparator, &c.name),
            (DiskAtomFilter::Names(f), OnDiskAtom::Cell(c)) => f.includes(comparator, &c.name),
            (DiskAtomFilter::Slice(f), OnDiskAtom::RangeTombstone(rt)) => {
                f.intersects(comparator, &rt.min, &rt.max)
            }
            (DiskAtomFilter::Names(f), OnDiskAtom::RangeTombstone(rt)) => {
                f.intersects(comparator, &rt.min, &rt.max)
            }
        }
    }

    /// False only if no cell under `prefix` can be selected.
    pub fn may_select_prefix(&self, comparator: &CellNameType, prefix: &Composite) -> bool {
        match self {
            DiskAtomFilter::Slice(f) => {
                f.intersects(comparator, &prefix.clone().start(), &prefix.clone().end())
            }
            DiskAtomFilter::Names(f) => f
                .columns()
                .iter()
                .any(|name| comparator.is_prefix_of(prefix, name)),
        }
    }

    /// False when a segment's statistics prove it holds nothing this filter
    /// selects. Segments with any tombstone are always read since they may
    /// shadow data elsewhere.
    pub fn should_include(&self, comparator: &CellNameType, stats: &SegmentStats) -> bool {
        if stats.has_tombstones {
            return true;
        }
        let (min, max) = match (&stats.min_cell_name, &stats.max_cell_name) {
            (Some(min), Some(max)) => (min, max),
            _ => return false,
        };
        match self {
            DiskAtomFilter::Slice(f) => f.intersects(comparator, min, max),
            DiskAtomFilter::Names(f) => f.intersects(comparator, min, max),
        }
    }

    /// The selected cells of an in-memory partition, in filter order.
    pub fn select_cells(&self, cf: &ColumnFamily) -> Vec<Cell> {
        let comparator = cf.comparator();
        let cells = cf.cells();
        let mut out = Vec::new();
        match self {
            DiskAtomFilter::Slice(f) => {
                for s in &f.slices {
                    let (low, high) = if f.reversed {
                        (&s.finish, &s.start)
                    } else {
                        (&s.start, &s.finish)
                    };
                    let lo = cells.partition_point(|c| {
                        !low.is_empty() && comparator.compare(low, &c.name) == Ordering::Greater
                    });
                    let hi = cells.partition_point(|c| {
                        high.is_empty() || comparator.compare(&c.name, high) != Ordering::Greater
                    });
                    if lo >= hi {
                        continue;
                    }
                    if f.reversed {
                        out.extend(cells[lo..hi].iter().rev().cloned());
                    } else {
                        out.extend(cells[lo..hi].iter().cloned());
                    }
                }
            }
            DiskAtomFilter::Names(f) => {
                out.extend(f.columns().iter().filter_map(|n| cf.get_cell(n)).cloned());
            }
        }
        out
    }

    /// Indexes of the promoted index blocks worth reading, in read order.
    pub fn selected_blocks(&self, comparator: &CellNameType, blocks: &[IndexInfo]) -> Vec<usize> {
        let reversed = self.is_reversed();
        let mut out: Vec<usize> = Vec::new();
        let mut push = |i: usize, out: &mut Vec<usize>| {
            let beyond = match out.last() {
                None => true,
                Some(&last) if reversed => i < last,
                Some(&last) => i > last,
            };
            let block = &blocks[i];
            if beyond
                && self.may_select_prefix(
                    comparator,
                    &common_prefix(&block.first_name, &block.last_name),
                )
            {
                out.push(i);
            }
        };
        match self {
            DiskAtomFilter::Slice(f) => {
                for s in &f.slices {
                    if s.is_wrapping(comparator, reversed) {
                        continue;
                    }
                    let mut i = match index_for(comparator, &s.start, blocks, reversed) {
                        Some(i) => i,
                        None => continue,
                    };
                    loop {
                        let block = &blocks[i];
                        let past_finish = !s.finish.is_empty()
                            && if reversed {
                                comparator.compare(&block.last_name, &s.finish) == Ordering::Less
                            } else {
                                comparator.compare(&block.first_name, &s.finish) == Ordering::Greater
                            };
                        if past_finish {
                            break;
                        }
                        push(i, &mut out);
                        if reversed {
                            if i == 0 {
                                break;
                            }
                            i -= 1;
                        } else {
                            i += 1;
                            if i == blocks.len() {
                                break;
                            }
                        }
                    }
                }
            }
            DiskAtomFilter::Names(f) => {
                // A block reaches up to the end of any range tombstone it
                // holds, so blocks can overlap: every block from the first
                // one reaching `name` up to the last one starting at or
                // before it may hold the cell.
                for name in f.columns() {
                    let mut i = match index_for(comparator, name, blocks, false) {
                        Some(i) => i,
                        None => continue,
                    };
                    while i < blocks.len()
                        && comparator.compare(&blocks[i].first_name, name) != Ordering::Greater
                    {
                        push(i, &mut out);
                        i += 1;
                    }
                }
            }
        }
        out
    }

    /// Merges the atoms of several sources, each in this filter's order, and
    /// collects the result into `container`. Range tombstones are added to
    /// the container's deletion info as they are met; cells with the same
    /// name are reconciled before being collected.
    pub fn collate_on_disk_atom<I>(
        &self,
        container: &mut ColumnFamily,
        sources: Vec<I>,
        gc_before: i32,
        now: i32,
    ) -> Result<()>
    where
        I: Iterator<Item = Result<OnDiskAtom>>,
    {
        let comparator = container.comparator().clone();
        let merged = MergingIter::new(sources, |a: &OnDiskAtom, b: &OnDiskAtom| {
            self.compare_atoms(&comparator, a, b)
        });
        let mut collector = Collector::new(self, container, now);
        for group in merged {
            let mut reduced: Option<Cell> = None;
            for atom in group? {
                match atom {
                    OnDiskAtom::RangeTombstone(rt) => container.add_range_tombstone(rt),
                    OnDiskAtom::Cell(c) => {
                        reduced = Some(match reduced {
                            None => c,
                            Some(prev) => prev.reconcile(c),
                        })
                    }
                }
            }
            if let Some(cell) = reduced {
                if !collector.collect(container, cell, gc_before)? {
                    break;
                }
            }
        }
        collector.finish(container, gc_before);
        Ok(())
    }

    /// Folds already reconciled cells, in filter order, into `container`.
    pub fn collect_reduced_columns<I>(
        &self,
        container: &mut ColumnFamily,
        reduced: I,
        gc_before: i32,
        now: i32,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Result<Cell>>,
    {
        let mut collector = Collector::new(self, container, now);
        for cell in reduced {
            if !collector.collect(container, cell?, gc_before)? {
                break;
            }
        }
        collector.finish(container, gc_before);
        Ok(())
    }

    /// Applies the filter to a partition that is already fully merged, such
    /// as a cached one.
    pub fn filter_column_family(&self, cf: &ColumnFamily, gc_before: i32, now: i32) -> Result<ColumnFamily> {
        let mut out = ColumnFamily::new(cf.metadata().clone());
        out.delete(cf.deletion_info());
        self.collect_reduced_columns(
            &mut out,
            self.select_cells(cf).into_iter().map(Ok),
            gc_before,
            now,
        )?;
        Ok(out)
    }

    /// The filter for the first partition of a paged read, resuming at
    /// `start`.
    pub fn with_start(&self, comparator: &CellNameType, start: Composite) -> Result<DiskAtomFilter> {
        match self {
            DiskAtomFilter::Slice(f) => Ok(DiskAtomFilter::Slice(f.with_start(comparator, start))),
            DiskAtomFilter::Names(_) => Err(Error::Unsupported("names filters cannot be paged")),
        }
    }

    pub fn serialize<W: Write + ?Sized>(&self, comparator: &CellNameType, out: &mut W) -> Result<()> {
        match self {
            DiskAtomFilter::Slice(f) => {
                out.write_byte(SLICE_FILTER)?;
                f.serialize(comparator, out)
            }
            DiskAtomFilter::Names(f) => {
                out.write_byte(NAMES_FILTER)?;
                f.serialize(comparator, out)
            }
        }
    }

    pub fn deserialize<R: Read + ?Sized>(comparator: &CellNameType, input: &mut R) -> Result<Self> {
        match input.read_byte()? {
            SLICE_FILTER => Ok(DiskAtomFilter::Slice(SliceQueryFilter::deserialize(
                comparator, input,
            )?)),
            NAMES_FILTER => Ok(DiskAtomFilter::Names(NamesQueryFilter::deserialize(
                comparator, input,
            )?)),
            b => Err(Error::decoding(format!("unknown filter type {}", b))),
        }
    }

    pub fn serialized_size(&self, comparator: &CellNameType) -> Result<usize> {
        Ok(1 + match self {
            DiskAtomFilter::Slice(f) => f.serialized_size(comparator)?,
            DiskAtomFilter::Names(f) => f.serialized_size(comparator)?,
        })
    }
}

fn sort_key(reversed: bool, atom: &OnDiskAtom) -> &dyn Prefix {
    match atom {
        OnDiskAtom::RangeTombstone(rt) if reversed => &rt.max,
        _ => atom.name(),
    }
}

fn common_prefix(a: &Composite, b: &Composite) -> Composite {
    Composite::new(
        a.components()
            .iter()
            .zip(b.components())
            .take_while(|(x, y)| x == y)
            .map(|(x, _)| x.clone()),
    )
}

// Applies the limit, the purge rule and the tombstone thresholds while a
// result row is being filled.
struct Collector {
    counter: ColumnCounter,
    limit: usize,
    warn_threshold: usize,
    failure_threshold: usize,
}

impl Collector {
    fn new(filter: &DiskAtomFilter, container: &ColumnFamily, now: i32) -> Self {
        let md = container.metadata();
        Collector {
            counter: filter.column_counter(&md.comparator, now),
            limit: match filter {
                DiskAtomFilter::Slice(f) => f.count,
                DiskAtomFilter::Names(_) => usize::MAX,
            },
            warn_threshold: md.tombstone_warn_threshold,
            failure_threshold: md.tombstone_failure_threshold,
        }
    }

    // Returns false once the limit is reached.
    fn collect(&mut self, container: &mut ColumnFamily, cell: Cell, gc_before: i32) -> Result<bool> {
        self.counter
            .count(&cell, container.deletion_info(), container.comparator());
        if self.counter.live() > self.limit {
            return Ok(false);
        }
        if self.counter.ignored() > self.failure_threshold {
            return Err(Error::TombstoneOverwhelming {
                scanned: self.counter.ignored(),
            });
        }
        container.add_if_relevant(cell, gc_before);
        Ok(true)
    }

    fn finish(&self, container: &mut ColumnFamily, gc_before: i32) {
        if self.counter.ignored() > self.warn_threshold {
            let md = container.metadata();
            warn!(
                "read {} live and {} tombstoned cells in {}.{}",
                self.counter.live(),
                self.counter.ignored(),
                md.keyspace,
                md.name
            );
        }
        container.purge_deletion_info(gc_before);
    }
}
