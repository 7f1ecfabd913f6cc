// Read path of a wide-row column family store: typed cell names, row
// filters, immutable on-disk segments, and the merge of a memtable with
// those segments into query results.

pub mod cache;
pub mod composites;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod fs;
pub mod marshal;
pub mod memtable;
pub mod root;
pub mod sst;
