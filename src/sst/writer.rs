use std::sync::Arc;

use anyhow::{anyhow, bail};
use log::info;

use super::{column_index::ColumnIndexBuilder, data_file, index_file, stats::SegmentStats, stats_file};
use crate::{
    config::CfMetaData,
    db::{
        cell::OnDiskAtom, column_family::ColumnFamily, decorated_key::DecoratedKey,
        row_index_entry::RowIndexEntry,
    },
    encoding::{DataOutput, Encode},
    fs::{DbDir, DbFile},
};

/// Writes one segment: partitions must be appended in key order.
pub struct SegmentWriter<D: DbDir> {
    dir: D,
    name: String,
    metadata: Arc<CfMetaData>,
    data: D::DbFile,
    index: D::DbFile,
    data_len: u64,
    stats: SegmentStats,
    last_key: Option<DecoratedKey>,
}

impl<D: DbDir> SegmentWriter<D> {
    pub fn create(dir: &D, name: &str, metadata: Arc<CfMetaData>) -> anyhow::Result<Self> {
        let mut dir = dir.clone();
        let data = dir
            .create(&data_file(name))?
            .ok_or_else(|| anyhow!("segment {} already exists", name))?;
        let index = dir
            .create(&index_file(name))?
            .ok_or_else(|| anyhow!("index of segment {} already exists", name))?;
        Ok(SegmentWriter {
            dir,
            name: name.to_owned(),
            metadata,
            data,
            index,
            data_len: 0,
            stats: SegmentStats::default(),
            last_key: None,
        })
    }

    /// Writes a partition and its index entry.
    pub fn append(&mut self, key: &DecoratedKey, cf: &ColumnFamily) -> anyhow::Result<RowIndexEntry> {
        if let Some(last) = &self.last_key {
            if last >= key {
                bail!("partition {:?} appended after {:?}", key, last);
            }
        }
        let comparator = &self.metadata.comparator;
        let position = self.data_len;
        let top_level = cf.deletion_info().top_level();

        let mut buf = Vec::new();
        buf.write_with_short_length(key.key())?;
        top_level.encode(&mut buf)?;

        let mut atoms = Vec::new();
        let mut builder = ColumnIndexBuilder::new(&mut atoms, comparator, self.metadata.column_index_size);
        for atom in cf.atoms() {
            self.stats.observe_atom(comparator, &atom);
            builder.add(&atom)?;
        }
        let (column_index, _) = builder.build();
        buf.extend_from_slice(&atoms);
        OnDiskAtom::write_end_of_row(&mut buf)?;

        self.data.write(&buf)?;
        self.data_len += buf.len() as u64;

        let entry = RowIndexEntry::create(position, top_level, column_index);
        let mut index_buf = Vec::new();
        index_buf.write_with_short_length(key.key())?;
        entry.serialize(comparator, &mut index_buf)?;
        self.index.write(&index_buf)?;

        self.stats.observe_key(key);
        self.stats.observe_deletion(&top_level);
        self.last_key = Some(key.clone());
        Ok(entry)
    }

    /// Syncs the data and index files and writes the statistics, which mark
    /// the segment complete.
    pub fn finish(mut self) -> anyhow::Result<SegmentStats> {
        if self.stats.partitions == 0 {
            bail!("will only write a non-empty segment");
        }
        self.data.sync()?;
        self.index.sync()?;

        let json = self.stats.to_json(&self.metadata.comparator)?;
        let mut stats = self
            .dir
            .create(&stats_file(&self.name))?
            .ok_or_else(|| anyhow!("statistics of segment {} already exist", self.name))?;
        stats.write(json.as_bytes())?;
        stats.sync()?;

        info!(
            "wrote segment {} with {} partitions ({} bytes)",
            self.name, self.stats.partitions, self.data_len
        );
        Ok(self.stats)
    }
}
