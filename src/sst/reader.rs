use std::{
    io::{BufRead, BufReader, Read, Seek, SeekFrom},
    ops::Bound,
    sync::Arc,
};

use anyhow::{anyhow, bail};
use log::{info, trace};

use super::{
    data_file, index_file,
    scanner::{Entries, IndexEntries, ReversedIndexEntries, SegmentCursor, SegmentScanner, Summary},
    stats::SegmentStats,
    stats_file,
};
use crate::{
    cache::KeyCache,
    config::CfMetaData,
    db::{
        decorated_key::{DecoratedKey, KeyRange},
        row_index_entry::RowIndexEntry,
    },
    encoding::DataInput,
    error::Result,
    fs::{read_to_end, DbDir},
};

/// Every this many index entries, the key and its offset in the index file
/// are kept in memory.
pub const SUMMARY_INTERVAL: usize = 128;

/// An open, finished segment.
#[derive(Debug)]
pub struct SegmentReader<D: DbDir> {
    dir: D,
    name: String,
    metadata: Arc<CfMetaData>,
    stats: SegmentStats,
    summary: Summary,
}

impl<D: DbDir> SegmentReader<D> {
    pub fn open(dir: &D, name: &str, metadata: Arc<CfMetaData>) -> anyhow::Result<Self> {
        let mut dir = dir.clone();
        let mut stats = dir
            .open(&stats_file(name))?
            .ok_or_else(|| anyhow!("segment {} has no statistics", name))?;
        let stats = SegmentStats::from_json(
            std::str::from_utf8(&read_to_end(&mut stats)?)?,
            &metadata.comparator,
        )?;

        let index = dir
            .open(&index_file(name))?
            .ok_or_else(|| anyhow!("segment {} has no index", name))?;
        let mut index = BufReader::new(index);
        let mut summary = Vec::new();
        let mut partitions = 0_u64;
        while !index.fill_buf()?.is_empty() {
            let position = index.stream_position()?;
            let key = index.read_with_short_length()?;
            if partitions % SUMMARY_INTERVAL as u64 == 0 {
                summary.push((DecoratedKey::new(key), position));
            }
            RowIndexEntry::skip(&mut index)?;
            partitions += 1;
        }
        if partitions != stats.partitions {
            bail!(
                "segment {} indexes {} partitions but its statistics count {}",
                name,
                partitions,
                stats.partitions
            );
        }

        info!("opened segment {} with {} partitions", name, partitions);
        Ok(SegmentReader {
            dir,
            name: name.to_owned(),
            metadata,
            stats,
            summary: Arc::new(summary),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &SegmentStats {
        &self.stats
    }

    /// Whether the segment holds any key in `range`.
    pub fn may_contain(&self, range: &KeyRange) -> bool {
        match (&self.stats.min_key, &self.stats.max_key) {
            (Some(min), Some(max)) => range.intersects(min, max),
            _ => false,
        }
    }

    // Offset in the index file to start scanning from to find `key`.
    fn summary_position(&self, key: &DecoratedKey) -> u64 {
        let idx = self.summary.partition_point(|(k, _)| k <= key);
        match idx.checked_sub(1) {
            Some(i) => self.summary[i].1,
            None => 0,
        }
    }

    fn index_at(&self, position: u64) -> anyhow::Result<BufReader<D::DbFile>> {
        let mut dir = self.dir.clone();
        let mut index = dir
            .open(&index_file(&self.name))?
            .ok_or_else(|| anyhow!("index of segment {} disappeared", self.name))?;
        index.seek(SeekFrom::Start(position))?;
        Ok(BufReader::new(index))
    }

    fn entries(&self, range: &KeyRange) -> anyhow::Result<IndexEntries<D::DbFile>> {
        let start = match &range.start {
            Bound::Unbounded => 0,
            Bound::Included(k) | Bound::Excluded(k) => self.summary_position(k),
        };
        Ok(IndexEntries::new(
            self.index_at(start)?,
            self.metadata.clone(),
            range.clone(),
        ))
    }

    /// The index entry of `key`, going through `key_cache` when given.
    pub fn get_position(
        &self,
        key: &DecoratedKey,
        key_cache: Option<&KeyCache>,
    ) -> anyhow::Result<Option<RowIndexEntry>> {
        let range = KeyRange::single(key.clone());
        if !self.may_contain(&range) {
            return Ok(None);
        }
        if let Some(entry) = key_cache.and_then(|c| c.get(&self.name, key)) {
            trace!("key cache hit for {:?} in {}", key, self.name);
            return Ok(Some(entry));
        }
        let found = self.entries(&range)?.next().transpose()?;
        Ok(found.map(|(_, entry)| {
            if let Some(cache) = key_cache {
                cache.put(&self.name, key.clone(), entry.clone());
            }
            entry
        }))
    }

    /// A cursor over partition `key`, if the segment holds it.
    pub fn cursor(
        &self,
        key: &DecoratedKey,
        key_cache: Option<&KeyCache>,
    ) -> anyhow::Result<Option<SegmentCursor<D::DbFile>>> {
        let entry = match self.get_position(key, key_cache)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let mut dir = self.dir.clone();
        let data = dir
            .open(&data_file(&self.name))?
            .ok_or_else(|| anyhow!("data of segment {} disappeared", self.name))?;
        Ok(Some(SegmentCursor::new(
            data,
            self.metadata.clone(),
            key.clone(),
            entry,
        )))
    }

    /// The partitions in `range`, descending when `reversed`. Opens a data
    /// file handle owned by the scanner.
    pub fn scanner(&self, range: &KeyRange, reversed: bool) -> anyhow::Result<SegmentScanner<D::DbFile>> {
        let mut dir = self.dir.clone();
        let data = dir
            .open(&data_file(&self.name))?
            .ok_or_else(|| anyhow!("data of segment {} disappeared", self.name))?;
        let entries = if reversed {
            Entries::Reversed(ReversedIndexEntries::new(
                self.index_at(0)?,
                self.metadata.clone(),
                range.clone(),
                self.summary.clone(),
            ))
        } else {
            Entries::Forward(self.entries(range)?)
        };
        Ok(SegmentScanner::new(data, entries, self.metadata.clone()))
    }

    /// Every key of the segment, in order, without reading index blocks.
    pub fn key_iterator(&self) -> anyhow::Result<KeyIterator<D::DbFile>> {
        Ok(KeyIterator {
            index: self.index_at(0)?,
            done: false,
        })
    }
}

pub struct KeyIterator<F: Read> {
    index: BufReader<F>,
    done: bool,
}

impl<F: Read> KeyIterator<F> {
    fn read_next(&mut self) -> Result<Option<DecoratedKey>> {
        if self.index.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let key = self.index.read_with_short_length()?;
        RowIndexEntry::skip(&mut self.index)?;
        Ok(Some(DecoratedKey::new(key)))
    }
}

impl<F: Read> Iterator for KeyIterator<F> {
    type Item = Result<DecoratedKey>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.read_next().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}

#[cfg(test)]
mod test {
    use std::{ops::Bound, sync::Arc};

    use bytes::Bytes;

    use super::SegmentReader;
    use crate::{
        cache::KeyCache,
        composites::Composite,
        config::{test::sparse_table, CfMetaData},
        db::{
            cell::Cell,
            column_family::ColumnFamily,
            decorated_key::{DecoratedKey, KeyRange},
            row_index_entry::RowIndexEntry,
        },
        error::Error,
        filter::{DiskAtomFilter, NamesQueryFilter, SliceQueryFilter},
        fs::{DbDir, DbFile, MockDir},
        sst::{
            data_file,
            scanner::SegmentCursor,
            test::{row, wide_partition},
            writer::SegmentWriter,
        },
    };

    fn table(column_index_size: usize) -> Arc<CfMetaData> {
        let mut md = sparse_table();
        md.column_index_size = column_index_size;
        Arc::new(md)
    }

    fn key(i: usize) -> DecoratedKey {
        DecoratedKey::new(format!("key{:04}", i))
    }

    fn narrow(md: &Arc<CfMetaData>, i: usize) -> ColumnFamily {
        let mut cf = ColumnFamily::new(md.clone());
        cf.add_cell(Cell::new(
            md.comparator.create(&row(0), b"a").unwrap(),
            Bytes::from(i.to_string()),
            1,
        ));
        cf
    }

    fn read(
        reader: &SegmentReader<MockDir>,
        md: &Arc<CfMetaData>,
        key: &DecoratedKey,
        filter: &DiskAtomFilter,
    ) -> ColumnFamily {
        let (_, cursor) = reader
            .scanner(&KeyRange::single(key.clone()), filter.is_reversed())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let (dt, atoms) = cursor.materialize(filter).unwrap();
        let mut cf = ColumnFamily::new(md.clone());
        cf.delete_partition(dt);
        filter
            .collate_on_disk_atom(&mut cf, vec![atoms], i32::MIN, 0)
            .unwrap();
        cf
    }

    #[test]
    fn test_summary_and_lookup() {
        let md = table(1 << 16);
        let dir = MockDir::new();
        let mut writer = SegmentWriter::create(&dir, "cf-1", md.clone()).unwrap();
        for i in 0..300 {
            writer.append(&key(i * 2), &narrow(&md, i)).unwrap();
        }
        writer.finish().unwrap();

        let reader = SegmentReader::open(&dir, "cf-1", md.clone()).unwrap();
        assert_eq!(reader.summary.len(), 3);
        assert_eq!(reader.stats().partitions, 300);

        let cache = KeyCache::new(1 << 20);
        for i in [0, 255, 256, 257, 598] {
            let entry = reader.get_position(&key(i), Some(&cache)).unwrap();
            assert_eq!(entry.is_some(), i % 2 == 0, "key {}", i);
        }
        assert!(cache.get("cf-1", &key(256)).is_some());
        assert!(cache.get("cf-1", &key(257)).is_none());
        assert!(reader.get_position(&key(1000), None).unwrap().is_none());

        let keys: Vec<_> = reader
            .key_iterator()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(keys, (0..300).map(|i| key(i * 2)).collect::<Vec<_>>());

        let range = KeyRange::new(Bound::Excluded(key(256)), Bound::Included(key(270)));
        let scanned: Vec<_> = reader
            .scanner(&range, false)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(scanned, (129..=135).map(|i| key(i * 2)).collect::<Vec<_>>());

        let reversed: Vec<_> = reader
            .scanner(&range, true)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(reversed, (129..=135).rev().map(|i| key(i * 2)).collect::<Vec<_>>());

        assert!(reader.may_contain(&range));
        assert!(!reader.may_contain(&KeyRange::new(
            Bound::Excluded(key(598)),
            Bound::Unbounded
        )));
    }

    #[test]
    fn test_reversed_scan_across_summary_windows() {
        let md = table(1 << 16);
        let dir = MockDir::new();
        let mut writer = SegmentWriter::create(&dir, "cf-1", md.clone()).unwrap();
        for i in 0..300 {
            writer.append(&key(i * 2), &narrow(&md, i)).unwrap();
        }
        writer.finish().unwrap();
        let reader = SegmentReader::open(&dir, "cf-1", md.clone()).unwrap();
        assert_eq!(reader.summary.len(), 3);

        // Windows start at keys 0, 256 and 512.
        let ranges = [
            KeyRange::all(),
            KeyRange::new(Bound::Included(key(100)), Bound::Included(key(500))),
            KeyRange::new(Bound::Excluded(key(256)), Bound::Excluded(key(512))),
            KeyRange::new(Bound::Included(key(256)), Bound::Included(key(512))),
            KeyRange::new(Bound::Unbounded, Bound::Excluded(key(256))),
            KeyRange::new(Bound::Excluded(key(510)), Bound::Unbounded),
            KeyRange::new(Bound::Included(key(257)), Bound::Included(key(257))),
            KeyRange::new(Bound::Excluded(key(598)), Bound::Unbounded),
        ];
        for range in ranges {
            let mut expected: Vec<_> = reader
                .scanner(&range, false)
                .unwrap()
                .map(|r| r.unwrap().0)
                .collect();
            expected.reverse();
            let reversed: Vec<_> = reader
                .scanner(&range, true)
                .unwrap()
                .map(|r| r.unwrap().0)
                .collect();
            assert_eq!(reversed, expected, "{:?}", range);
        }
    }

    #[test]
    fn test_promoted_reads() {
        let md = table(200);
        let dir = MockDir::new();
        let cf = wide_partition(&md, 50, Some((20, 24)));
        let mut writer = SegmentWriter::create(&dir, "cf-1", md.clone()).unwrap();
        let entry = writer.append(&key(0), &cf).unwrap();
        writer.finish().unwrap();
        assert!(entry.is_indexed());
        assert!(entry.columns_index().len() > 10);

        let reader = SegmentReader::open(&dir, "cf-1", md.clone()).unwrap();
        let filters = [
            SliceQueryFilter::single(row(10).start(), row(30).end(), false, usize::MAX),
            SliceQueryFilter::single(row(30).end(), row(10).start(), true, usize::MAX),
            SliceQueryFilter::single(row(22).start(), Composite::empty(), false, 5),
            SliceQueryFilter::single(row(22).end(), Composite::empty(), true, 5),
            SliceQueryFilter::all(),
        ];
        for f in filters {
            let filter = DiskAtomFilter::Slice(f);
            let got = read(&reader, &md, &key(0), &filter);
            let expected = filter.filter_column_family(&cf, i32::MIN, 0).unwrap();
            assert_eq!(got.cells(), expected.cells(), "{:?}", filter);
        }

        let t = &md.comparator;
        let names = DiskAtomFilter::Names(NamesQueryFilter::new(
            t,
            [3, 21, 40].map(|i| t.create(&row(i), b"b").unwrap()),
        ));
        let got = read(&reader, &md, &key(0), &names);
        // Row 21 is deleted.
        assert_eq!(got.cell_count(), 2);
        assert!(got.deletion_info().has_ranges());
    }

    #[test]
    fn test_names_read_inside_range_tombstone() {
        let md = table(200);
        let dir = MockDir::new();
        let t = &md.comparator;
        let mut cf = wide_partition(&md, 50, Some((20, 24)));
        // Written after the range delete, so it survives it.
        cf.add_cell(Cell::new(
            t.create(&row(23), b"b").unwrap(),
            Bytes::from_static(b"late"),
            30,
        ));
        let mut writer = SegmentWriter::create(&dir, "cf-1", md.clone()).unwrap();
        let entry = writer.append(&key(0), &cf).unwrap();
        writer.finish().unwrap();
        assert!(entry.is_indexed());

        let reader = SegmentReader::open(&dir, "cf-1", md.clone()).unwrap();
        for rows in [vec![23], vec![21, 23], vec![19, 23, 25]] {
            let names = DiskAtomFilter::Names(NamesQueryFilter::new(
                t,
                rows.iter().map(|i| t.create(&row(*i), b"b").unwrap()),
            ));
            let got = read(&reader, &md, &key(0), &names);
            let expected = names.filter_column_family(&cf, i32::MIN, 0).unwrap();
            assert_eq!(got.cells(), expected.cells(), "{:?}", rows);
            let late = got.get_cell(&t.create(&row(23), b"b").unwrap()).unwrap();
            assert_eq!((late.value.as_ref(), late.timestamp), (&b"late"[..], 30));
        }
    }

    #[test]
    fn test_block_past_end_of_data() {
        let md = table(200);
        let mut dir = MockDir::new();
        let mut writer = SegmentWriter::create(&dir, "cf-1", md.clone()).unwrap();
        let entry = writer
            .append(&key(0), &wide_partition(&md, 50, None))
            .unwrap();
        writer.finish().unwrap();

        let entry = match entry {
            RowIndexEntry::Indexed {
                position,
                deletion_time,
                mut columns_index,
            } => {
                columns_index.last_mut().unwrap().width = 1 << 40;
                RowIndexEntry::Indexed {
                    position,
                    deletion_time,
                    columns_index,
                }
            }
            plain => panic!("expected a promoted entry, got {:?}", plain),
        };
        let data = dir.open(&data_file("cf-1")).unwrap().unwrap();
        let cursor = SegmentCursor::new(data, md.clone(), key(0), entry);
        let (_, atoms) = cursor
            .materialize(&DiskAtomFilter::Slice(SliceQueryFilter::all()))
            .unwrap();
        let atoms: Vec<_> = atoms.collect();
        assert!(atoms.len() > 1);
        assert!(atoms[..atoms.len() - 1].iter().all(|a| a.is_ok()));
        assert!(matches!(atoms.last(), Some(Err(Error::Decoding(_)))));
    }

    #[test]
    fn test_corrupt_data() {
        let md = table(1 << 16);
        let mut dir = MockDir::new();
        let mut writer = SegmentWriter::create(&dir, "cf-1", md.clone()).unwrap();
        writer.append(&key(0), &narrow(&md, 0)).unwrap();
        writer.finish().unwrap();

        // Overwrite the key in the data file.
        let mut data = dir.open(&data_file("cf-1")).unwrap().unwrap();
        data.write(&[0, 7, b'o', b't', b'h', b'e', b'r', b'0', b'0']).unwrap();

        let reader = SegmentReader::open(&dir, "cf-1", md.clone()).unwrap();
        let (_, cursor) = reader
            .scanner(&KeyRange::all(), false)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert!(matches!(
            cursor.materialize(&DiskAtomFilter::Slice(SliceQueryFilter::all())),
            Err(Error::Decoding(_))
        ));
        assert!(SegmentReader::open(&dir, "cf-2", md).is_err());
    }
}
