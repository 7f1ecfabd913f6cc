pub mod column_index;
pub mod reader;
pub mod scanner;
pub mod stats;
pub mod writer;

// This package provides facilities to both read and write segments.
//
// A segment is an immutable, durable set of partitions, ordered by decorated
// key. Segments are constructed by flushing a memtable to disk.
//
// Physically, a segment `name` is three files:
//
// * `name-Data.db` holds the partitions back to back. Each partition is its
//   key (short length), its partition deletion time, its atoms in comparator
//   order and an end-of-row marker (a zero short length).
// * `name-Index.db` holds, for every partition in order, its key and its
//   `RowIndexEntry`. The entry points at the partition in the data file and,
//   for wide partitions, carries the promoted column index: blocks of roughly
//   `column_index_size` bytes of atoms, each with its first and last name and
//   its offset relative to the first atom of the partition.
// * `name-Statistics.json` holds the segment's key bounds, timestamp bounds,
//   cell name bounds and whether it contains tombstones. It is written last,
//   so a segment without statistics was never finished.
//
// Reads never load a whole segment. A sparse summary of every
// `SUMMARY_INTERVAL`th key is kept in memory to find where in the index file
// to start scanning, and a scanner only reads the promoted blocks a filter
// selects.

pub fn data_file(name: &str) -> String {
    format!("{}-Data.db", name)
}

pub fn index_file(name: &str) -> String {
    format!("{}-Index.db", name)
}

pub fn stats_file(name: &str) -> String {
    format!("{}-Statistics.json", name)
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::{
        composites::Composite,
        config::CfMetaData,
        db::{
            cell::Cell,
            column_family::ColumnFamily,
            deletion::{DeletionTime, RangeTombstone},
        },
        marshal::DataType,
    };

    pub(crate) fn row(i: i32) -> Composite {
        Composite::new([DataType::Int32.from_string(&i.to_string()).unwrap()])
    }

    /// A partition with `rows` rows of one 40 byte cell each, `b` of every row
    /// in `[deleted_from, deleted_to]` covered by a range tombstone.
    pub(crate) fn wide_partition(
        md: &Arc<CfMetaData>,
        rows: i32,
        deleted: Option<(i32, i32)>,
    ) -> ColumnFamily {
        let t = &md.comparator;
        let mut cf = ColumnFamily::new(md.clone());
        for i in 0..rows {
            cf.add_cell(Cell::new(
                t.create(&row(i), b"b").unwrap(),
                Bytes::from(vec![i as u8; 40]),
                10,
            ));
        }
        if let Some((from, to)) = deleted {
            cf.add_range_tombstone(RangeTombstone::new(
                row(from).start(),
                row(to).end(),
                DeletionTime::new(20, 100),
            ));
        }
        cf
    }
}
