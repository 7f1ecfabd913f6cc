// Partition index entries.
//
// Every partition of a segment has an entry in the index file giving the
// position of the partition in the data file. Wide partitions additionally
// carry a "promoted" column index: the partition's deletion time plus a list
// of blocks, each covering a contiguous range of cell names. A reader can then
// binary-search the blocks and seek straight to the one it needs instead of
// deserializing the partition from its start.
//
// Layout:
//
//   position: i64
//   promoted_size: i32          0 for a plain entry
//   deletion_time: DeletionTime \
//   block_count: i32             } only when promoted_size > 0
//   blocks: IndexInfo * count   /
//
//   IndexInfo := first_name: short-length bytes, last_name: short-length
//                bytes, offset: i64, width: i64

use std::{
    cmp::Ordering,
    io::{Read, Write},
    mem,
};

use super::deletion::DeletionTime;
use crate::{
    composites::{CellNameType, Composite, Prefix},
    encoding::{short_length_size, DataInput, DataOutput, Decode, Encode, INT_SIZE, LONG_SIZE},
    error::{Error, Result},
};

/// One block of a promoted column index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexInfo {
    pub first_name: Composite,
    pub last_name: Composite,
    /// Offset of the block from the start of the partition's cells.
    pub offset: u64,
    pub width: u64,
}

impl IndexInfo {
    pub fn serialize<W: Write + ?Sized>(&self, comparator: &CellNameType, out: &mut W) -> Result<()> {
        out.write_with_short_length(&comparator.to_bytes(&self.first_name)?)?;
        out.write_with_short_length(&comparator.to_bytes(&self.last_name)?)?;
        out.write_i64(self.offset as i64)?;
        out.write_i64(self.width as i64)
    }

    pub fn deserialize<R: Read + ?Sized>(comparator: &CellNameType, input: &mut R) -> Result<Self> {
        let first_name = comparator.composite_from_bytes(&input.read_with_short_length()?)?;
        let last_name = comparator.composite_from_bytes(&input.read_with_short_length()?)?;
        let offset = input.read_i64()?;
        let width = input.read_i64()?;
        if offset < 0 || width < 0 {
            return Err(Error::decoding(format!(
                "negative index block offset {} or width {}",
                offset, width
            )));
        }
        Ok(IndexInfo {
            first_name,
            last_name,
            offset: offset as u64,
            width: width as u64,
        })
    }

    pub fn serialized_size(&self, comparator: &CellNameType) -> Result<usize> {
        Ok(short_length_size(comparator.to_bytes(&self.first_name)?.len())
            + short_length_size(comparator.to_bytes(&self.last_name)?.len())
            + 2 * LONG_SIZE)
    }

    pub fn memory_size(&self) -> usize {
        let name_size = |c: &Composite| c.components().iter().map(|b| b.len()).sum::<usize>();
        mem::size_of::<IndexInfo>() + name_size(&self.first_name) + name_size(&self.last_name)
    }
}

/// The column index built while writing one partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnIndex {
    pub columns_index: Vec<IndexInfo>,
}

impl ColumnIndex {
    pub fn new(columns_index: Vec<IndexInfo>) -> Self {
        ColumnIndex { columns_index }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowIndexEntry {
    /// Position only. Deletion time and cells must be read from the
    /// partition header in the data file.
    Plain { position: u64 },
    Indexed {
        position: u64,
        deletion_time: DeletionTime,
        columns_index: Vec<IndexInfo>,
    },
}

impl RowIndexEntry {
    /// Promotes the column index only when it has more than one block: with
    /// a single block the reader seeks to the partition start anyway and can
    /// read the deletion time there.
    pub fn create(position: u64, deletion_time: DeletionTime, index: ColumnIndex) -> Self {
        if index.columns_index.len() > 1 {
            RowIndexEntry::Indexed {
                position,
                deletion_time,
                columns_index: index.columns_index,
            }
        } else {
            RowIndexEntry::Plain { position }
        }
    }

    pub fn position(&self) -> u64 {
        match self {
            RowIndexEntry::Plain { position } | RowIndexEntry::Indexed { position, .. } => *position,
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, RowIndexEntry::Indexed { .. })
    }

    /// The partition deletion, available only on promoted entries.
    pub fn deletion_time(&self) -> Result<DeletionTime> {
        match self {
            RowIndexEntry::Indexed { deletion_time, .. } => Ok(*deletion_time),
            RowIndexEntry::Plain { .. } => Err(Error::Unsupported(
                "plain index entries carry no deletion time",
            )),
        }
    }

    pub fn columns_index(&self) -> &[IndexInfo] {
        match self {
            RowIndexEntry::Plain { .. } => &[],
            RowIndexEntry::Indexed { columns_index, .. } => columns_index,
        }
    }

    pub fn promoted_size(&self, comparator: &CellNameType) -> Result<usize> {
        match self {
            RowIndexEntry::Plain { .. } => Ok(0),
            RowIndexEntry::Indexed {
                deletion_time,
                columns_index,
                ..
            } => {
                let mut size = deletion_time.serialized_size() + INT_SIZE;
                for info in columns_index {
                    size += info.serialized_size(comparator)?;
                }
                Ok(size)
            }
        }
    }

    /// The position plus the promoted index. The promoted size header is not
    /// counted.
    pub fn serialized_size(&self, comparator: &CellNameType) -> Result<usize> {
        Ok(LONG_SIZE + self.promoted_size(comparator)?)
    }

    pub fn serialize<W: Write + ?Sized>(&self, comparator: &CellNameType, out: &mut W) -> Result<()> {
        out.write_i64(self.position() as i64)?;
        let promoted = i32::try_from(self.promoted_size(comparator)?)
            .map_err(|_| Error::marshal("promoted index larger than 2GiB"))?;
        out.write_i32(promoted)?;
        if let RowIndexEntry::Indexed {
            deletion_time,
            columns_index,
            ..
        } = self
        {
            deletion_time.encode(out)?;
            out.write_i32(columns_index.len() as i32)?;
            for info in columns_index {
                info.serialize(comparator, out)?;
            }
        }
        Ok(())
    }

    pub fn deserialize<R: Read + ?Sized>(comparator: &CellNameType, input: &mut R) -> Result<Self> {
        let position = read_position(input)?;
        let size = input.read_i32()?;
        if size <= 0 {
            return Ok(RowIndexEntry::Plain { position });
        }
        let deletion_time = DeletionTime::decode(input)?;
        let entries = input.read_i32()?;
        if entries < 0 {
            return Err(Error::decoding(format!("negative index block count {}", entries)));
        }
        let mut columns_index = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            columns_index.push(IndexInfo::deserialize(comparator, input)?);
        }
        Ok(RowIndexEntry::Indexed {
            position,
            deletion_time,
            columns_index,
        })
    }

    /// Consumes a serialized entry without materializing its blocks.
    pub fn skip<R: Read + ?Sized>(input: &mut R) -> Result<()> {
        input.read_i64()?;
        Self::skip_promoted_index(input)
    }

    pub fn skip_promoted_index<R: Read + ?Sized>(input: &mut R) -> Result<()> {
        let size = input.read_i32()?;
        if size <= 0 {
            return Ok(());
        }
        input.skip_bytes_fully(size as u64)
    }

    pub fn memory_size(&self) -> usize {
        mem::size_of::<RowIndexEntry>()
            + self
                .columns_index()
                .iter()
                .map(IndexInfo::memory_size)
                .sum::<usize>()
    }
}

fn read_position<R: Read + ?Sized>(input: &mut R) -> Result<u64> {
    let position = input.read_i64()?;
    u64::try_from(position)
        .map_err(|_| Error::decoding(format!("negative partition position {}", position)))
}

/// Index of the first block that may contain `name` when reading in the
/// given direction, or `None` if every block lies before it. Blocks are in
/// forward comparator order.
pub fn index_for<P: Prefix + ?Sized>(
    comparator: &CellNameType,
    name: &P,
    blocks: &[IndexInfo],
    reversed: bool,
) -> Option<usize> {
    if name.is_empty() {
        return if blocks.is_empty() {
            None
        } else if reversed {
            Some(blocks.len() - 1)
        } else {
            Some(0)
        };
    }
    if reversed {
        // Last block whose first name is at or before `name`.
        let idx = blocks.partition_point(|b| comparator.compare(&b.first_name, name) != Ordering::Greater);
        idx.checked_sub(1)
    } else {
        // First block whose last name is at or after `name`.
        let idx = blocks.partition_point(|b| comparator.compare(&b.last_name, name) == Ordering::Less);
        (idx < blocks.len()).then_some(idx)
    }
}
