use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{BufRead, BufReader, Read, Seek, SeekFrom},
    ops::Bound,
    rc::Rc,
    sync::Arc,
};

use crate::{
    config::CfMetaData,
    db::{
        cell::OnDiskAtom,
        decorated_key::{DecoratedKey, KeyRange},
        deletion::{DeletionTime, RangeTombstone},
        row_index_entry::RowIndexEntry,
    },
    encoding::{short_length_size, DataInput, Decode, Encode},
    error::{Error, Result},
    filter::DiskAtomFilter,
};

type SharedReader<F> = Rc<RefCell<BufReader<F>>>;

/// Every `SUMMARY_INTERVAL`th key of an index file with its offset there.
pub(crate) type Summary = Arc<Vec<(DecoratedKey, u64)>>;

/// Reads `(key, entry)` pairs from an index file, starting wherever the
/// reader is positioned, restricted to a key range.
pub(crate) struct IndexEntries<F: Read> {
    index: BufReader<F>,
    metadata: Arc<CfMetaData>,
    range: KeyRange,
    done: bool,
}

impl<F: Read> IndexEntries<F> {
    pub(crate) fn new(index: BufReader<F>, metadata: Arc<CfMetaData>, range: KeyRange) -> Self {
        IndexEntries {
            index,
            metadata,
            range,
            done: false,
        }
    }

    fn read_next(&mut self) -> Result<Option<(DecoratedKey, RowIndexEntry)>> {
        loop {
            if self.index.fill_buf()?.is_empty() {
                return Ok(None);
            }
            let key = DecoratedKey::new(self.index.read_with_short_length()?);
            let before_start = match &self.range.start {
                Bound::Unbounded => false,
                Bound::Included(s) => &key < s,
                Bound::Excluded(s) => &key <= s,
            };
            if before_start {
                RowIndexEntry::skip(&mut self.index)?;
                continue;
            }
            let past_end = match &self.range.end {
                Bound::Unbounded => false,
                Bound::Included(e) => &key > e,
                Bound::Excluded(e) => &key >= e,
            };
            if past_end {
                return Ok(None);
            }
            let entry = RowIndexEntry::deserialize(&self.metadata.comparator, &mut self.index)?;
            return Ok(Some((key, entry)));
        }
    }

    fn into_inner(self) -> BufReader<F> {
        self.index
    }
}

impl<F: Read> Iterator for IndexEntries<F> {
    type Item = Result<(DecoratedKey, RowIndexEntry)>;

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

/// The index entries of a key range in descending key order.
///
/// The index file can only be read forwards, so it is read one summary
/// window at a time, starting from the last window that may hold the end of
/// the range, and each window is returned backwards.
pub(crate) struct ReversedIndexEntries<F: Read + Seek> {
    index: Option<BufReader<F>>,
    metadata: Arc<CfMetaData>,
    range: KeyRange,
    summary: Summary,
    // Windows from this one on may hold keys in range.
    windows: usize,
    next_window: usize,
    current: std::vec::IntoIter<(DecoratedKey, RowIndexEntry)>,
    done: bool,
}

impl<F: Read + Seek> ReversedIndexEntries<F> {
    pub(crate) fn new(index: BufReader<F>, metadata: Arc<CfMetaData>, range: KeyRange, summary: Summary) -> Self {
        let windows = match &range.end {
            Bound::Unbounded => summary.len(),
            Bound::Included(e) => summary.partition_point(|(k, _)| k <= e),
            Bound::Excluded(e) => summary.partition_point(|(k, _)| k < e),
        };
        ReversedIndexEntries {
            index: Some(index),
            metadata,
            range,
            summary,
            windows,
            next_window: windows,
            current: Vec::new().into_iter(),
            done: false,
        }
    }

    fn read_window(&mut self, i: usize) -> Result<()> {
        let (first_key, position) = &self.summary[i];
        // Windows after the first one read end where the following window,
        // already returned, starts.
        let end = match self.summary.get(i + 1) {
            Some((next, _)) if i + 1 < self.windows => Bound::Excluded(next.clone()),
            _ => self.range.end.clone(),
        };
        let mut index = self
            .index
            .take()
            .ok_or_else(|| Error::decoding("index reader lost after an earlier error"))?;
        index.seek(SeekFrom::Start(*position))?;
        let mut entries = IndexEntries::new(
            index,
            self.metadata.clone(),
            KeyRange::new(self.range.start.clone(), end),
        );
        let mut window = entries.by_ref().collect::<Result<Vec<_>>>()?;
        self.index = Some(entries.into_inner());
        window.reverse();
        self.current = window.into_iter();

        let before_start = match &self.range.start {
            Bound::Unbounded => false,
            Bound::Included(s) | Bound::Excluded(s) => first_key <= s,
        };
        if before_start {
            self.done = true;
        }
        Ok(())
    }
}

impl<F: Read + Seek> Iterator for ReversedIndexEntries<F> {
    type Item = Result<(DecoratedKey, RowIndexEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.current.next() {
                return Some(Ok(entry));
            }
            if self.done || self.next_window == 0 {
                return None;
            }
            self.next_window -= 1;
            if let Err(e) = self.read_window(self.next_window) {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

pub(crate) enum Entries<F: Read + Seek> {
    Forward(IndexEntries<F>),
    Reversed(ReversedIndexEntries<F>),
}

/// The partitions of one segment within a key range, in key order.
///
/// Nothing is read from the data file until a cursor is materialized. The
/// data file handle is shared by the scanner and its cursors and is closed
/// when the last of them is dropped.
pub struct SegmentScanner<F: Read + Seek> {
    data: SharedReader<F>,
    metadata: Arc<CfMetaData>,
    entries: Entries<F>,
}

impl<F: Read + Seek> SegmentScanner<F> {
    pub(crate) fn new(data: F, entries: Entries<F>, metadata: Arc<CfMetaData>) -> Self {
        SegmentScanner {
            data: Rc::new(RefCell::new(BufReader::new(data))),
            metadata,
            entries,
        }
    }
}

impl<F: Read + Seek> Iterator for SegmentScanner<F> {
    type Item = Result<(DecoratedKey, SegmentCursor<F>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match &mut self.entries {
            Entries::Forward(it) => it.next()?,
            Entries::Reversed(it) => it.next()?,
        };
        Some(next.map(|(key, entry)| {
            let cursor = SegmentCursor {
                data: self.data.clone(),
                metadata: self.metadata.clone(),
                key: key.clone(),
                entry,
            };
            (key, cursor)
        }))
    }
}

/// Where one partition lives in a segment. Cheap to hold; reading happens in
/// `materialize`.
pub struct SegmentCursor<F: Read + Seek> {
    data: SharedReader<F>,
    metadata: Arc<CfMetaData>,
    key: DecoratedKey,
    entry: RowIndexEntry,
}

impl<F: Read + Seek> SegmentCursor<F> {
    /// A cursor with a data file handle of its own.
    pub(crate) fn new(data: F, metadata: Arc<CfMetaData>, key: DecoratedKey, entry: RowIndexEntry) -> Self {
        SegmentCursor {
            data: Rc::new(RefCell::new(BufReader::new(data))),
            metadata,
            key,
            entry,
        }
    }

    pub fn key(&self) -> &DecoratedKey {
        &self.key
    }

    pub fn entry(&self) -> &RowIndexEntry {
        &self.entry
    }

    /// Returns the partition deletion and an iterator over the atoms `filter`
    /// selects, in the filter's order.
    ///
    /// Promoted entries already carry the partition deletion, so only the
    /// selected blocks are read. Otherwise the partition header is read and
    /// the whole partition scanned.
    pub fn materialize(&self, filter: &DiskAtomFilter) -> Result<(DeletionTime, SegmentAtoms<F>)> {
        let atoms_start = self.entry.position()
            + short_length_size(self.key.key().len()) as u64
            + DeletionTime::LIVE.serialized_size() as u64;
        let (deletion_time, chunks) = match &self.entry {
            RowIndexEntry::Indexed {
                deletion_time,
                columns_index,
                ..
            } => {
                let chunks = filter
                    .selected_blocks(&self.metadata.comparator, columns_index)
                    .into_iter()
                    .map(|i| Chunk {
                        start: atoms_start + columns_index[i].offset,
                        width: Some(columns_index[i].width),
                    })
                    .collect::<VecDeque<_>>();
                (*deletion_time, chunks)
            }
            RowIndexEntry::Plain { position } => {
                let dt = self.read_header(*position)?;
                (
                    dt,
                    VecDeque::from([Chunk {
                        start: atoms_start,
                        width: None,
                    }]),
                )
            }
        };
        Ok((
            deletion_time,
            SegmentAtoms {
                data: self.data.clone(),
                metadata: self.metadata.clone(),
                filter: filter.clone(),
                chunks,
                current: VecDeque::new(),
                emitted_tombstones: Vec::new(),
                failed: false,
            },
        ))
    }

    fn read_header(&self, position: u64) -> Result<DeletionTime> {
        let mut data = self.data.borrow_mut();
        data.seek(SeekFrom::Start(position))?;
        let key = data.read_with_short_length()?;
        if &key != self.key.key() {
            return Err(Error::decoding(format!(
                "index points at {:?} but the data file holds {:?} at {}",
                self.key,
                DecoratedKey::new(key),
                position
            )));
        }
        DeletionTime::decode(&mut *data)
    }
}

// A run of atoms to read. Without a width the run ends at the end-of-row
// marker.
struct Chunk {
    start: u64,
    width: Option<u64>,
}

/// The selected atoms of one partition, read one chunk at a time.
pub struct SegmentAtoms<F: Read + Seek> {
    data: SharedReader<F>,
    metadata: Arc<CfMetaData>,
    filter: DiskAtomFilter,
    chunks: VecDeque<Chunk>,
    current: VecDeque<OnDiskAtom>,
    // Open range tombstones are repeated at the head of every block.
    emitted_tombstones: Vec<RangeTombstone>,
    failed: bool,
}

impl<F: Read + Seek> SegmentAtoms<F> {
    fn read_chunk(&mut self, chunk: Chunk) -> Result<()> {
        let comparator = &self.metadata.comparator;
        let mut data = self.data.borrow_mut();
        if let Some(width) = chunk.width {
            let len = data.seek(SeekFrom::End(0))?;
            if chunk.start.checked_add(width).map_or(true, |end| end > len) {
                return Err(Error::decoding(format!(
                    "block of {} bytes at {} runs past the end of a {} byte data file",
                    width, chunk.start, len
                )));
            }
        }
        data.seek(SeekFrom::Start(chunk.start))?;
        let mut atoms = Vec::new();
        match chunk.width {
            Some(width) => {
                let buf = data.read_bytes(width as usize)?;
                let mut input = &buf[..];
                while !input.is_empty() {
                    match OnDiskAtom::deserialize(comparator, &mut input)? {
                        Some(atom) => atoms.push(atom),
                        None => break,
                    }
                }
            }
            None => {
                while let Some(atom) = OnDiskAtom::deserialize(comparator, &mut *data)? {
                    atoms.push(atom);
                }
            }
        }
        atoms.retain(|a| self.filter.includes(comparator, a));
        if self.filter.is_reversed() {
            atoms.reverse();
            atoms.sort_by(|a, b| self.filter.compare_atoms(comparator, a, b));
        }
        self.current.extend(atoms);
        Ok(())
    }
}

impl<F: Read + Seek> Iterator for SegmentAtoms<F> {
    type Item = Result<OnDiskAtom>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.current.pop_front() {
                Some(OnDiskAtom::RangeTombstone(rt)) => {
                    if self.emitted_tombstones.contains(&rt) {
                        continue;
                    }
                    self.emitted_tombstones.push(rt.clone());
                    return Some(Ok(OnDiskAtom::RangeTombstone(rt)));
                }
                Some(atom) => return Some(Ok(atom)),
                None => {
                    let chunk = self.chunks.pop_front()?;
                    if let Err(e) = self.read_chunk(chunk) {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}
