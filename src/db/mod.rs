// The store of one table: a memtable in front of flushed segments, the
// manifest listing those segments, and the read caches.
//
// Reads go through `RowIterator`, which merges the memtable snapshot taken
// when the read starts with a scanner per segment that may hold something
// the read wants.

use std::{iter, mem, sync::Arc};

use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

use crate::{
    cache::{KeyCache, MapRowCache, RowCache},
    config::CfMetaData,
    filter::{DiskAtomFilter, SliceQueryFilter},
    fs::DbDir,
    memtable::Memtable,
    root::Root,
    sst::{reader::SegmentReader, writer::SegmentWriter},
};

use self::{
    column_family::ColumnFamily,
    data_range::DataRange,
    decorated_key::{DecoratedKey, KeyRange},
    row_iterator::{merge_row, RowCursor, RowIterator, RowSource},
};

pub mod cell;
pub mod column_family;
pub mod data_range;
pub mod decorated_key;
pub mod deletion;
pub mod merging_iter;
pub mod row_index_entry;
pub mod row_iterator;

#[cfg(test)]
mod trace_test;

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
struct DiskLayout {
    segments: Vec<String>,
    generation: u64,
}

/// Sizes of the read caches. Zero disables a cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub row_cache_rows: usize,
    pub key_cache_bytes: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            row_cache_rows: 0,
            key_cache_bytes: 1 << 20,
        }
    }
}

pub struct ColumnFamilyStore<D: DbDir> {
    metadata: Arc<CfMetaData>,
    root: Root<DiskLayout, D>,
    dir: D,
    memtable: Memtable,
    segments: Vec<SegmentReader<D>>,
    row_cache: Option<Arc<dyn RowCache>>,
    key_cache: Option<Arc<KeyCache>>,
}

impl<D> ColumnFamilyStore<D>
where
    D: DbDir + 'static,
    D::DbFile: 'static,
{
    pub fn open(dir: D, metadata: Arc<CfMetaData>, caches: CacheOptions) -> anyhow::Result<Self> {
        let root: Root<DiskLayout, D> = Root::load(dir.clone())?;
        let segments = root
            .data()
            .segments
            .iter()
            .map(|name| SegmentReader::open(&dir, name, metadata.clone()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        info!(
            "opened {}.{} with {} segments",
            metadata.keyspace,
            metadata.name,
            segments.len()
        );

        let row_cache: Option<Arc<dyn RowCache>> = (caches.row_cache_rows > 0)
            .then(|| Arc::new(MapRowCache::new(caches.row_cache_rows)) as Arc<dyn RowCache>);
        let key_cache = (caches.key_cache_bytes > 0).then(|| Arc::new(KeyCache::new(caches.key_cache_bytes)));
        Ok(ColumnFamilyStore {
            metadata,
            root,
            dir,
            memtable: Memtable::new(),
            segments,
            row_cache,
            key_cache,
        })
    }

    pub fn metadata(&self) -> &Arc<CfMetaData> {
        &self.metadata
    }

    pub fn memtable(&self) -> &Memtable {
        &self.memtable
    }

    pub fn segments(&self) -> &[SegmentReader<D>] {
        &self.segments
    }

    /// Buffers an update and drops any cached copy of the partition.
    pub fn apply(&self, key: DecoratedKey, update: ColumnFamily) {
        if let Some(cache) = &self.row_cache {
            cache.invalidate(&key);
        }
        self.memtable.apply(key, update);
    }

    /// Writes the memtable out as a new segment. Returns its name, or `None`
    /// if there was nothing to flush.
    pub fn flush_memtable(&mut self) -> anyhow::Result<Option<String>> {
        let snapshot = self.memtable.snapshot();
        if snapshot.is_empty() {
            return Ok(None);
        }
        let generation = self.root.data().generation + 1;
        let name = format!(
            "{}-{}-{}",
            self.metadata.keyspace, self.metadata.name, generation
        );

        let mut writer = SegmentWriter::create(&self.dir, &name, self.metadata.clone())?;
        for entry in snapshot.entries(&KeyRange::all(), false) {
            let (key, cf) = entry?;
            writer.append(&key, &cf)?;
        }
        writer.finish()?;

        let segment = name.clone();
        self.root.transform(move |mut layout| {
            layout.segments.push(segment);
            layout.generation = generation;
            layout
        })?;
        self.segments
            .push(SegmentReader::open(&self.dir, &name, self.metadata.clone())?);
        let flushed = mem::take(&mut self.memtable);
        info!(
            "flushed {} operations of {}.{} into {}",
            flushed.operations(),
            self.metadata.keyspace,
            self.metadata.name,
            name
        );
        Ok(Some(name))
    }

    /// The rows of `range`, merged from the memtable and every segment that
    /// may contribute. `now` is in seconds and decides what has expired and
    /// which tombstones may be purged.
    pub fn get_range_slice(&self, range: DataRange, now: i32) -> anyhow::Result<RowIterator<D::DbFile>> {
        let reversed = range.is_reversed();
        let mut sources: Vec<RowSource<D::DbFile>> = Vec::with_capacity(self.segments.len() + 1);
        sources.push(Box::new(
            self.memtable
                .snapshot()
                .entries(range.keys(), reversed)
                .map(|r| r.map(|(key, cf)| (key, RowCursor::Memtable(cf)))),
        ));
        for segment in &self.segments {
            if !segment.may_contain(range.keys()) {
                debug!("skipping segment {}: no key in range", segment.name());
                continue;
            }
            if !range
                .filter()
                .should_include(&self.metadata.comparator, segment.stats())
            {
                debug!("skipping segment {}: no selected cell", segment.name());
                continue;
            }
            sources.push(Box::new(
                segment
                    .scanner(range.keys(), reversed)?
                    .map(|r| r.map(|(key, cursor)| (key, RowCursor::Segment(cursor)))),
            ));
        }
        Ok(RowIterator::new(
            sources,
            range,
            self.metadata.clone(),
            self.row_cache.clone(),
            now,
        ))
    }

    // Cursors of `key` in every segment holding it.
    fn segment_cursors(
        &self,
        key: &DecoratedKey,
        filter: &DiskAtomFilter,
    ) -> anyhow::Result<Vec<RowCursor<D::DbFile>>> {
        let mut cursors = Vec::new();
        for segment in &self.segments {
            if !filter.should_include(&self.metadata.comparator, segment.stats()) {
                continue;
            }
            if let Some(cursor) = segment.cursor(key, self.key_cache.as_deref())? {
                cursors.push(RowCursor::Segment(cursor));
            }
        }
        Ok(cursors)
    }

    /// One partition, from the row cache when it holds the key. Index entries
    /// are looked up through the key cache.
    pub fn get_column_family(
        &self,
        key: &DecoratedKey,
        filter: DiskAtomFilter,
        now: i32,
    ) -> anyhow::Result<Option<ColumnFamily>> {
        let cursors = match self.row_cache.as_ref().and_then(|c| c.get(key)) {
            // The cached copy is already merged from every source.
            Some(cached) => {
                trace!("serving {:?} from the row cache", key);
                vec![RowCursor::Memtable(cached)]
            }
            None => {
                let mut cursors = Vec::new();
                if let Some(cf) = self.memtable.snapshot().get(key) {
                    cursors.push(RowCursor::Memtable(cf));
                }
                cursors.extend(self.segment_cursors(key, &filter)?);
                cursors
            }
        };
        let sources = cursors
            .into_iter()
            .map(|c| Box::new(iter::once(Ok((key.clone(), c)))) as RowSource<D::DbFile>)
            .collect();
        let range = DataRange::new(KeyRange::single(key.clone()), filter);
        let mut rows = RowIterator::new(
            sources,
            range,
            self.metadata.clone(),
            self.row_cache.clone(),
            now,
        );
        Ok(rows.next().transpose()?.map(|(_, cf)| cf))
    }

    /// Loads partition `key` into the row cache. Only flushed state is ever
    /// cached: nothing is cached while the memtable holds the key.
    pub fn cache_row(&self, key: &DecoratedKey, now: i32) -> anyhow::Result<bool> {
        let cache = match &self.row_cache {
            Some(cache) => cache,
            None => return Ok(false),
        };
        if self.memtable.snapshot().contains_key(key) {
            return Ok(false);
        }
        let filter = DiskAtomFilter::Slice(SliceQueryFilter::all());
        let cursors = self.segment_cursors(key, &filter)?;
        if cursors.is_empty() {
            return Ok(false);
        }
        // Tombstones are kept: the cached copy is filtered again on every
        // read.
        let (cf, _) = merge_row(&self.metadata, &cursors, &filter, i32::MIN, now)?;
        cache.put(key.clone(), Arc::new(cf));
        // A write may have landed since the check above.
        if self.memtable.snapshot().contains_key(key) {
            cache.invalidate(key);
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use std::{ops::Bound, sync::Arc};

    use bytes::Bytes;

    use super::{CacheOptions, ColumnFamilyStore};
    use crate::{
        composites::CellName,
        config::{test::sparse_table, CfMetaData},
        db::{
            cell::Cell,
            column_family::ColumnFamily,
            data_range::DataRange,
            decorated_key::{DecoratedKey, KeyRange},
            deletion::DeletionTime,
        },
        filter::{DiskAtomFilter, NamesQueryFilter, SliceQueryFilter},
        fs::{DbDir, MockDir, OsDir},
        sst::test::row,
    };

    fn name(md: &CfMetaData, r: i32, c: &str) -> CellName {
        md.comparator.create(&row(r), c.as_bytes()).unwrap()
    }

    fn update(md: &Arc<CfMetaData>, cells: &[(i32, &str, &'static str, i64)]) -> ColumnFamily {
        let mut cf = ColumnFamily::new(md.clone());
        for (r, c, v, ts) in cells {
            cf.add_cell(Cell::new(name(md, *r, c), Bytes::from_static(v.as_bytes()), *ts));
        }
        cf
    }

    fn scan<D>(store: &ColumnFamilyStore<D>, range: DataRange, now: i32) -> Vec<(DecoratedKey, ColumnFamily)>
    where
        D: DbDir + 'static,
        D::DbFile: 'static,
    {
        store
            .get_range_slice(range, now)
            .unwrap()
            .collect::<crate::error::Result<_>>()
            .unwrap()
    }

    fn full() -> DataRange {
        DataRange::all(DiskAtomFilter::Slice(SliceQueryFilter::all()))
    }

    #[test]
    fn test_buffer_wins_over_segment() {
        let md = Arc::new(sparse_table());
        let mut store = ColumnFamilyStore::open(MockDir::new(), md.clone(), CacheOptions::default()).unwrap();
        let k1 = DecoratedKey::new("K1");
        store.apply(k1.clone(), update(&md, &[(1, "a", "stale", 5), (1, "b", "b", 7)]));
        assert_eq!(store.flush_memtable().unwrap(), Some("ks-t-1".to_owned()));
        assert_eq!(store.flush_memtable().unwrap(), None);
        store.apply(k1.clone(), update(&md, &[(1, "a", "fresh", 10)]));

        let rows = scan(&store, full(), 0);
        assert_eq!(rows.len(), 1);
        let (key, cf) = &rows[0];
        assert_eq!(key, &k1);
        let values: Vec<_> = cf.cells().iter().map(|c| (c.value.clone(), c.timestamp)).collect();
        assert_eq!(
            values,
            vec![
                (Bytes::from_static(b"fresh"), 10),
                (Bytes::from_static(b"b"), 7)
            ]
        );
    }

    #[test]
    fn test_reopen_and_point_reads() {
        let md = Arc::new(sparse_table());
        let tmp = tempfile::tempdir().unwrap();
        let dir = OsDir::new(tmp.path()).unwrap();
        let mut store = ColumnFamilyStore::open(dir.clone(), md.clone(), CacheOptions::default()).unwrap();
        for i in 0..10 {
            let key = DecoratedKey::new(format!("k{}", i));
            store.apply(key, update(&md, &[(i, "a", "v", 1)]));
        }
        store.flush_memtable().unwrap();
        let mut deletion = ColumnFamily::new(md.clone());
        deletion.delete_partition(DeletionTime::new(2, 100));
        store.apply(DecoratedKey::new("k3"), deletion);
        store.flush_memtable().unwrap();

        let store = ColumnFamilyStore::open(dir, md.clone(), CacheOptions::default()).unwrap();
        assert_eq!(store.segments().len(), 2);

        let names = DiskAtomFilter::Names(NamesQueryFilter::new(&md.comparator, [name(&md, 4, "a")]));
        let cf = store
            .get_column_family(&DecoratedKey::new("k4"), names.clone(), 0)
            .unwrap()
            .unwrap();
        assert_eq!(cf.cell_count(), 1);
        assert!(store
            .get_column_family(&DecoratedKey::new("k5"), names, 0)
            .unwrap()
            .is_none());

        let k3 = store
            .get_column_family(&DecoratedKey::new("k3"), DiskAtomFilter::Slice(SliceQueryFilter::all()), 0)
            .unwrap()
            .unwrap();
        assert!(k3.is_empty());
        assert!(k3.is_marked_for_delete());

        let range = DataRange::new(
            KeyRange::new(Bound::Included(DecoratedKey::new("k2")), Bound::Excluded(DecoratedKey::new("k6"))),
            DiskAtomFilter::Slice(SliceQueryFilter::all()),
        );
        let keys: Vec<_> = scan(&store, range, 0).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["k2", "k3", "k4", "k5"].map(DecoratedKey::new).to_vec());
    }

    #[test]
    fn test_row_cache() {
        let md = Arc::new(sparse_table());
        let caches = CacheOptions {
            row_cache_rows: 16,
            key_cache_bytes: 0,
        };
        let mut store = ColumnFamilyStore::open(MockDir::new(), md.clone(), caches).unwrap();
        let k = DecoratedKey::new("k");
        store.apply(k.clone(), update(&md, &[(1, "a", "v1", 1)]));
        assert!(!store.cache_row(&k, 0).unwrap());
        store.flush_memtable().unwrap();
        assert!(store.cache_row(&k, 0).unwrap());
        assert!(!store.cache_row(&DecoratedKey::new("missing"), 0).unwrap());

        let slice = DiskAtomFilter::Slice(SliceQueryFilter::single(
            row(1).start(),
            row(1).end(),
            false,
            usize::MAX,
        ));
        let cf = store.get_column_family(&k, slice.clone(), 0).unwrap().unwrap();
        assert_eq!(cf.cells()[0].value, Bytes::from_static(b"v1"));

        // A write invalidates the cached row.
        store.apply(k.clone(), update(&md, &[(1, "a", "v2", 2)]));
        let cf = store.get_column_family(&k, slice, 0).unwrap().unwrap();
        assert_eq!(cf.cells()[0].value, Bytes::from_static(b"v2"));
    }

    #[test]
    fn test_paged_scan() {
        let md = Arc::new(sparse_table());
        let mut store = ColumnFamilyStore::open(MockDir::new(), md.clone(), CacheOptions::default()).unwrap();
        for k in ["a", "b"] {
            store.apply(
                DecoratedKey::new(k),
                update(&md, &[(1, "a", "1", 1), (2, "a", "2", 1), (3, "a", "3", 1)]),
            );
        }
        store.flush_memtable().unwrap();
        let range = full()
            .paged(DecoratedKey::new("a"), row(2).start())
            .unwrap();
        let rows = scan(&store, range, 0);
        assert_eq!(rows[0].1.cell_count(), 2);
        assert_eq!(rows[1].1.cell_count(), 3);
    }
}
