use std::{cmp::Ordering, io::Write};

use crate::{
    composites::{CellNameType, Composite, Prefix},
    db::{
        cell::OnDiskAtom,
        deletion::RangeTombstone,
        row_index_entry::{ColumnIndex, IndexInfo},
    },
    error::Result,
};

fn to_composite<P: Prefix + ?Sized>(p: &P) -> Composite {
    Composite::new(p.components().iter().cloned()).with_eoc(p.eoc())
}

/// Writes the atoms of one partition and cuts them into promoted index
/// blocks of roughly `block_size` bytes.
///
/// A block always ends on an atom boundary. Range tombstones still open when
/// a block starts are written again at its head, so a reader that jumps
/// straight to a block sees every deletion covering it.
pub struct ColumnIndexBuilder<'a, W: Write> {
    w: &'a mut W,
    comparator: &'a CellNameType,
    block_size: usize,
    written: u64,
    block_start: u64,
    first_name: Option<Composite>,
    last_name: Option<Composite>,
    open_tombstones: Vec<RangeTombstone>,
    index: ColumnIndex,
}

impl<'a, W: Write> ColumnIndexBuilder<'a, W> {
    pub fn new(w: &'a mut W, comparator: &'a CellNameType, block_size: usize) -> Self {
        ColumnIndexBuilder {
            w,
            comparator,
            block_size: block_size.max(1),
            written: 0,
            block_start: 0,
            first_name: None,
            last_name: None,
            open_tombstones: Vec::new(),
            index: ColumnIndex::default(),
        }
    }

    fn write_atom(&mut self, atom: &OnDiskAtom) -> Result<()> {
        let mut buf = Vec::with_capacity(atom.serialized_size(self.comparator)?);
        atom.serialize(self.comparator, &mut buf)?;
        self.w.write_all(&buf)?;
        self.written += buf.len() as u64;

        if self.first_name.is_none() {
            self.first_name = Some(to_composite(atom.name()));
        }
        // A range tombstone reaches up to its max; blocks must cover it.
        let high: &dyn Prefix = match atom {
            OnDiskAtom::RangeTombstone(rt) => &rt.max,
            OnDiskAtom::Cell(_) => atom.name(),
        };
        let greater = match &self.last_name {
            None => true,
            Some(last) => self.comparator.compare(high, last) == Ordering::Greater,
        };
        if greater {
            self.last_name = Some(to_composite(high));
        }
        Ok(())
    }

    pub fn add(&mut self, atom: &OnDiskAtom) -> Result<()> {
        if self.first_name.is_none() && !self.open_tombstones.is_empty() {
            let comparator = self.comparator;
            self.open_tombstones
                .retain(|rt| comparator.compare(&rt.max, atom.name()) != Ordering::Less);
            for rt in std::mem::take(&mut self.open_tombstones) {
                self.write_atom(&OnDiskAtom::RangeTombstone(rt.clone()))?;
                self.open_tombstones.push(rt);
            }
        }

        self.write_atom(atom)?;
        if let OnDiskAtom::RangeTombstone(rt) = atom {
            self.open_tombstones.push(rt.clone());
        }

        if self.written - self.block_start >= self.block_size as u64 {
            self.close_block();
        }
        Ok(())
    }

    fn close_block(&mut self) {
        if let (Some(first_name), Some(last_name)) = (self.first_name.take(), self.last_name.take()) {
            self.index.columns_index.push(IndexInfo {
                first_name,
                last_name,
                offset: self.block_start,
                width: self.written - self.block_start,
            });
        }
        self.block_start = self.written;
    }

    /// Closes the last block. Returns the index and the number of atom bytes
    /// written.
    pub fn build(mut self) -> (ColumnIndex, u64) {
        self.close_block();
        (self.index, self.written)
    }
}
