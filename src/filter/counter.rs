use crate::{
    composites::{CellName, CellNameType, Prefix},
    db::{cell::Cell, deletion::DeletionInfo},
};

/// Counts the results a query has produced so far.
///
/// Without grouping every live cell is one result. With grouping, consecutive
/// live cells whose names share the first `n` components are one result;
/// when `n` covers the clustering prefix that is one CQL row.
#[derive(Debug, Clone)]
pub struct ColumnCounter {
    group: Option<usize>,
    now: i32,
    live: usize,
    ignored: usize,
    previous: Option<CellName>,
}

impl ColumnCounter {
    pub fn new(group: Option<usize>, now: i32) -> Self {
        ColumnCounter {
            group,
            now,
            live: 0,
            ignored: 0,
            previous: None,
        }
    }

    fn same_group(n: usize, a: &CellName, b: &CellName) -> bool {
        if n >= a.clustering_size() && n >= b.clustering_size() {
            return a.is_same_cql3_row_as(b);
        }
        let (ca, cb) = (a.components(), b.components());
        ca.len() >= n && cb.len() >= n && ca[..n] == cb[..n]
    }

    pub fn count(&mut self, cell: &Cell, deletion: &DeletionInfo, comparator: &CellNameType) {
        if !cell.is_live(self.now) || deletion.is_deleted(comparator, &cell.name, cell.timestamp) {
            self.ignored += 1;
            return;
        }
        match self.group {
            None => self.live += 1,
            Some(n) => {
                let new_group = match &self.previous {
                    None => true,
                    Some(p) => !Self::same_group(n, p, &cell.name),
                };
                if new_group {
                    self.live += 1;
                }
                self.previous = Some(cell.name.clone());
            }
        }
    }

    /// Counts every cell of a sequence.
    pub fn count_all<'a, I>(mut self, cells: I, deletion: &DeletionInfo, comparator: &CellNameType) -> Self
    where
        I: IntoIterator<Item = &'a Cell>,
    {
        for c in cells {
            self.count(c, deletion, comparator);
        }
        self
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Tombstones and shadowed cells seen.
    pub fn ignored(&self) -> usize {
        self.ignored
    }
}
