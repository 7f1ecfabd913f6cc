use std::ops::RangeBounds;

use super::decorated_key::{DecoratedKey, KeyRange};
use crate::{
    composites::{CellNameType, Composite},
    error::{Error, Result},
    filter::DiskAtomFilter,
};

/// The partitions and the cells of each partition a range read selects.
///
/// A paged range carries the key the previous page ended on and the cell name
/// to resume from; only that first partition is read from the resume point.
#[derive(Clone, Debug)]
pub struct DataRange {
    keys: KeyRange,
    filter: DiskAtomFilter,
    paging: Option<(DecoratedKey, Composite)>,
}

impl DataRange {
    pub fn new(keys: KeyRange, filter: DiskAtomFilter) -> Self {
        DataRange {
            keys,
            filter,
            paging: None,
        }
    }

    pub fn all(filter: DiskAtomFilter) -> Self {
        DataRange::new(KeyRange::all(), filter)
    }

    /// Restarts the read at `start` within `key`. Fails for names filters,
    /// which have no position to resume from.
    pub fn paged(mut self, key: DecoratedKey, start: Composite) -> Result<Self> {
        if let DiskAtomFilter::Names(_) = self.filter {
            return Err(Error::Unsupported("names filters cannot be paged"));
        }
        self.paging = Some((key, start));
        Ok(self)
    }

    pub fn keys(&self) -> &KeyRange {
        &self.keys
    }

    pub fn filter(&self) -> &DiskAtomFilter {
        &self.filter
    }

    pub fn contains(&self, key: &DecoratedKey) -> bool {
        self.keys.contains(key)
    }

    pub fn is_reversed(&self) -> bool {
        self.filter.is_reversed()
    }

    /// The filter to read `key` with.
    pub fn column_filter(&self, comparator: &CellNameType, key: &DecoratedKey) -> Result<DiskAtomFilter> {
        match &self.paging {
            Some((first, start)) if first == key => self.filter.with_start(comparator, start.clone()),
            _ => Ok(self.filter.clone()),
        }
    }

    pub fn update_columns_limit(&mut self, limit: usize) {
        self.filter.update_columns_limit(limit);
    }

    /// Moves the resume point, or clears it.
    pub fn set_paging(&mut self, paging: Option<(DecoratedKey, Composite)>) -> Result<()> {
        if paging.is_some() {
            if let DiskAtomFilter::Names(_) = self.filter {
                return Err(Error::Unsupported("names filters cannot be paged"));
            }
        }
        self.paging = paging;
        Ok(())
    }
}
