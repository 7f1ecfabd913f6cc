use std::{
    cmp::Ordering,
    io::{Read, Seek},
    sync::Arc,
};

use log::trace;

use super::{
    cell::OnDiskAtom, column_family::ColumnFamily, data_range::DataRange,
    decorated_key::DecoratedKey, merging_iter::MergingIter,
};
use crate::{
    cache::RowCache,
    config::CfMetaData,
    error::Result,
    filter::DiskAtomFilter,
    sst::scanner::SegmentCursor,
};

/// One source's view of a partition, not yet read.
pub enum RowCursor<F: Read + Seek> {
    Memtable(Arc<ColumnFamily>),
    Segment(SegmentCursor<F>),
}

type Atoms = Box<dyn Iterator<Item = Result<OnDiskAtom>>>;

impl<F: Read + Seek + 'static> RowCursor<F> {
    /// Applies the partition's deletions to `container` and returns its
    /// atoms selected by `filter`, in filter order.
    fn materialize(&self, filter: &DiskAtomFilter, container: &mut ColumnFamily) -> Result<Atoms> {
        match self {
            RowCursor::Memtable(cf) => {
                container.delete(cf.deletion_info());
                Ok(Box::new(
                    filter
                        .select_cells(cf)
                        .into_iter()
                        .map(|c| Ok(OnDiskAtom::Cell(c))),
                ))
            }
            RowCursor::Segment(cursor) => {
                let (deletion_time, atoms) = cursor.materialize(filter)?;
                container.delete_partition(deletion_time);
                Ok(Box::new(atoms))
            }
        }
    }
}

/// Reads and merges one partition from `cursors`. Returns the row and
/// whether any source deleted the partition as a whole.
pub(crate) fn merge_row<F: Read + Seek + 'static>(
    metadata: &Arc<CfMetaData>,
    cursors: &[RowCursor<F>],
    filter: &DiskAtomFilter,
    gc_before: i32,
    now: i32,
) -> Result<(ColumnFamily, bool)> {
    let mut cf = ColumnFamily::new(metadata.clone());
    let mut sources = Vec::with_capacity(cursors.len());
    for cursor in cursors {
        sources.push(cursor.materialize(filter, &mut cf)?);
    }
    let deleted = !cf.deletion_info().top_level().is_live();
    filter.collate_on_disk_atom(&mut cf, sources, gc_before, now)?;
    Ok((cf, deleted))
}

pub type RowSource<F> = Box<dyn Iterator<Item = Result<(DecoratedKey, RowCursor<F>)>>>;

type Entry<F> = (DecoratedKey, RowCursor<F>);

fn ascending<F: Read + Seek>(a: &Entry<F>, b: &Entry<F>) -> Ordering {
    a.0.cmp(&b.0)
}

fn descending<F: Read + Seek>(a: &Entry<F>, b: &Entry<F>) -> Ordering {
    b.0.cmp(&a.0)
}

/// Merges key-ordered sources into one `(key, row)` per distinct key.
///
/// Sources must be ordered the way the range reads: descending keys for a
/// reversed filter. Partitions are read only when their key comes up, with
/// the data range as it is at that moment, so paging and limits may be
/// changed through `data_range_mut` between rows.
///
/// Any error ends the iteration; no later row is returned.
pub struct RowIterator<F: Read + Seek + 'static> {
    merged: MergingIter<RowSource<F>, Entry<F>, fn(&Entry<F>, &Entry<F>) -> Ordering>,
    range: DataRange,
    metadata: Arc<CfMetaData>,
    row_cache: Option<Arc<dyn RowCache>>,
    now: i32,
    failed: bool,
}

impl<F: Read + Seek + 'static> RowIterator<F> {
    pub fn new(
        sources: Vec<RowSource<F>>,
        range: DataRange,
        metadata: Arc<CfMetaData>,
        row_cache: Option<Arc<dyn RowCache>>,
        now: i32,
    ) -> Self {
        let cmp: fn(&Entry<F>, &Entry<F>) -> Ordering = if range.is_reversed() {
            descending
        } else {
            ascending
        };
        RowIterator {
            merged: MergingIter::new(sources, cmp),
            range,
            metadata,
            row_cache,
            now,
            failed: false,
        }
    }

    pub fn data_range(&self) -> &DataRange {
        &self.range
    }

    pub fn data_range_mut(&mut self) -> &mut DataRange {
        &mut self.range
    }

    fn reduce_group(&self, group: Vec<Entry<F>>) -> Result<Option<(DecoratedKey, ColumnFamily)>> {
        let key = group[0].0.clone();
        let filter = self.range.column_filter(&self.metadata.comparator, &key)?;
        let gc_before = self.metadata.gc_before(self.now);

        let cached = self.row_cache.as_ref().and_then(|c| c.get(&key));
        let (row, deleted) = match cached {
            Some(cached) => {
                trace!("row cache hit for {:?}", key);
                (
                    filter.filter_column_family(&cached, gc_before, self.now)?,
                    !cached.deletion_info().top_level().is_live(),
                )
            }
            None => {
                let cursors: Vec<_> = group.into_iter().map(|(_, c)| c).collect();
                merge_row(&self.metadata, &cursors, &filter, gc_before, self.now)?
            }
        };
        if row.is_empty() && !deleted {
            return Ok(None);
        }
        Ok(Some((key, row)))
    }
}

impl<F: Read + Seek + 'static> Iterator for RowIterator<F> {
    type Item = Result<(DecoratedKey, ColumnFamily)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed {
            let row = self.merged.next()?.and_then(|group| self.reduce_group(group));
            match row {
                Ok(Some(row)) => return Some(Ok(row)),
                Ok(None) => {}
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
