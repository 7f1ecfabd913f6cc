use std::{
    cmp::Ordering,
    io::{Read, Write},
};

use crate::{
    composites::{CellName, CellNameType, Prefix},
    encoding::{short_length_size, DataInput, DataOutput, INT_SIZE},
    error::{Error, Result},
};

/// Selects an explicit set of cells by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamesQueryFilter {
    // Sorted by the table comparator, without duplicates.
    columns: Vec<CellName>,
    /// Count live CQL rows rather than cells.
    pub count_cql3_rows: bool,
}

impl NamesQueryFilter {
    pub fn new<I>(comparator: &CellNameType, columns: I) -> Self
    where
        I: IntoIterator<Item = CellName>,
    {
        let mut columns: Vec<CellName> = columns.into_iter().collect();
        columns.sort_by(|a, b| comparator.compare(a, b));
        columns.dedup_by(|a, b| comparator.compare(&*a, &*b) == Ordering::Equal);
        NamesQueryFilter {
            columns,
            count_cql3_rows: false,
        }
    }

    pub fn counting_cql3_rows(mut self) -> Self {
        self.count_cql3_rows = true;
        self
    }

    pub fn columns(&self) -> &[CellName] {
        &self.columns
    }

    pub fn includes(&self, comparator: &CellNameType, name: &CellName) -> bool {
        self.columns
            .binary_search_by(|c| comparator.compare(c, name))
            .is_ok()
    }

    /// Whether any selected name falls between `min` and `max`.
    pub fn intersects<A, B>(&self, comparator: &CellNameType, min: &A, max: &B) -> bool
    where
        A: Prefix + ?Sized,
        B: Prefix + ?Sized,
    {
        let idx = self
            .columns
            .partition_point(|c| comparator.compare(c, min) == Ordering::Less);
        self.columns
            .get(idx)
            .map_or(false, |c| comparator.compare(c, max) != Ordering::Greater)
    }

    pub fn serialize<W: Write + ?Sized>(&self, comparator: &CellNameType, out: &mut W) -> Result<()> {
        out.write_i32(self.columns.len() as i32)?;
        for c in &self.columns {
            out.write_with_short_length(&comparator.to_bytes(c)?)?;
        }
        out.write_bool(self.count_cql3_rows)
    }

    pub fn deserialize<R: Read + ?Sized>(comparator: &CellNameType, input: &mut R) -> Result<Self> {
        let n = input.read_i32()?;
        if n < 0 {
            return Err(Error::decoding(format!("negative column count {}", n)));
        }
        let mut columns = Vec::with_capacity(n as usize);
        for _ in 0..n {
            columns.push(comparator.cell_from_bytes(&input.read_with_short_length()?)?);
        }
        let count_cql3_rows = input.read_bool()?;
        let mut filter = NamesQueryFilter::new(comparator, columns);
        filter.count_cql3_rows = count_cql3_rows;
        Ok(filter)
    }

    pub fn serialized_size(&self, comparator: &CellNameType) -> Result<usize> {
        let mut size = INT_SIZE;
        for c in &self.columns {
            size += short_length_size(comparator.to_bytes(c)?.len());
        }
        Ok(size + 1)
    }
}
