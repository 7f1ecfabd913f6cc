use std::{
    ops::Bound,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use crate::{
    db::{
        column_family::ColumnFamily,
        decorated_key::{DecoratedKey, KeyRange},
        merging_iter::MergingIter,
    },
    error::Result,
};

type Slab = Arc<Vec<(DecoratedKey, Arc<ColumnFamily>)>>;

/// The write buffer of a table.
///
/// Updates land in a list of immutable sorted slabs. Every insert pushes a
/// one-entry slab and merges neighbours while a slab is less than twice the
/// size of the one after it, so there are O(log n) slabs at any time. Slabs
/// are never modified once published, which lets a reader take a snapshot by
/// cloning the list.
#[derive(Debug, Default)]
pub struct Memtable {
    slabs: Mutex<Vec<Slab>>,
    memory_size: AtomicUsize,
    operations: AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Memtable::default()
    }

    // Entries of `rhs` are newer than those of `lhs`. Partitions present in
    // both are resolved into one.
    fn merge(lhs: &Slab, rhs: &Slab) -> Slab {
        let mut out = Vec::with_capacity(lhs.len() + rhs.len());
        let mut lhs = lhs.iter().peekable();
        let mut rhs = rhs.iter().peekable();
        loop {
            match (lhs.peek(), rhs.peek()) {
                (None, None) => break,
                (Some(_), None) => {
                    out.extend(lhs.cloned());
                    break;
                }
                (None, Some(_)) => {
                    out.extend(rhs.cloned());
                    break;
                }
                (Some((k1, cf1)), Some((k2, cf2))) => match k1.cmp(k2) {
                    std::cmp::Ordering::Less => out.extend(lhs.next().cloned()),
                    std::cmp::Ordering::Greater => out.extend(rhs.next().cloned()),
                    std::cmp::Ordering::Equal => {
                        let mut merged = (**cf1).clone();
                        merged.resolve(cf2);
                        out.push((k1.clone(), Arc::new(merged)));
                        lhs.next();
                        rhs.next();
                    }
                },
            }
        }
        Arc::new(out)
    }

    fn maybe_fix_at(slabs: &mut Vec<Slab>, idx: usize) {
        if slabs[idx].len() < slabs[idx + 1].len() * 2 {
            let merged = Self::merge(&slabs[idx], &slabs[idx + 1]);
            slabs.splice(idx..idx + 2, [merged]).for_each(drop);
        }
    }

    /// Adds an update to partition `key`.
    pub fn apply(&self, key: DecoratedKey, update: ColumnFamily) {
        self.memory_size
            .fetch_add(update.memory_size(), Ordering::Relaxed);
        self.operations.fetch_add(1, Ordering::Relaxed);
        let mut slabs = self.slabs.lock().unwrap_or_else(PoisonError::into_inner);
        slabs.push(Arc::new(vec![(key, Arc::new(update))]));
        for i in (0..(slabs.len() - 1)).rev() {
            Self::maybe_fix_at(&mut slabs, i);
        }
    }

    /// An immutable view of the current contents.
    pub fn snapshot(&self) -> MemtableSnapshot {
        MemtableSnapshot {
            slabs: self
                .slabs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Estimated bytes of all applied updates.
    pub fn memory_size(&self) -> usize {
        self.memory_size.load(Ordering::Relaxed)
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.operations() == 0
    }
}

/// A point-in-time view of a memtable.
#[derive(Debug, Clone)]
pub struct MemtableSnapshot {
    slabs: Vec<Slab>,
}

impl MemtableSnapshot {
    /// Partitions within `range` in key order, descending when `reversed`.
    pub fn entries(
        &self,
        range: &KeyRange,
        reversed: bool,
    ) -> impl Iterator<Item = Result<(DecoratedKey, Arc<ColumnFamily>)>> {
        let sources: Vec<_> = self
            .slabs
            .iter()
            .map(|slab| {
                let lo = match &range.start {
                    Bound::Unbounded => 0,
                    Bound::Included(s) => slab.partition_point(|(k, _)| k < s),
                    Bound::Excluded(s) => slab.partition_point(|(k, _)| k <= s),
                };
                let hi = match &range.end {
                    Bound::Unbounded => slab.len(),
                    Bound::Included(e) => slab.partition_point(|(k, _)| k <= e),
                    Bound::Excluded(e) => slab.partition_point(|(k, _)| k < e),
                };
                let mut entries: Vec<_> = if lo < hi {
                    slab[lo..hi].iter().cloned().map(Ok).collect()
                } else {
                    Vec::new()
                };
                if reversed {
                    entries.reverse();
                }
                entries.into_iter()
            })
            .collect();
        MergingIter::new(
            sources,
            move |a: &(DecoratedKey, Arc<ColumnFamily>), b: &(DecoratedKey, Arc<ColumnFamily>)| {
                if reversed {
                    b.0.cmp(&a.0)
                } else {
                    a.0.cmp(&b.0)
                }
            },
        )
        .filter_map(|group| {
            group
                .map(|g| {
                    g.into_iter().reduce(|(key, mut cf), (_, other)| {
                        Arc::make_mut(&mut cf).resolve(&other);
                        (key, cf)
                    })
                })
                .transpose()
        })
    }

    /// The merged partition for `key`, if any update touched it.
    pub fn get(&self, key: &DecoratedKey) -> Option<Arc<ColumnFamily>> {
        let mut found: Option<Arc<ColumnFamily>> = None;
        for slab in &self.slabs {
            if let Ok(idx) = slab.binary_search_by(|(k, _)| k.cmp(key)) {
                let cf = &slab[idx].1;
                found = Some(match found {
                    None => cf.clone(),
                    Some(mut prev) => {
                        Arc::make_mut(&mut prev).resolve(cf);
                        prev
                    }
                });
            }
        }
        found
    }

    pub fn contains_key(&self, key: &DecoratedKey) -> bool {
        self.slabs
            .iter()
            .any(|slab| slab.binary_search_by(|(k, _)| k.cmp(key)).is_ok())
    }

    /// Number of distinct partitions.
    pub fn len(&self) -> usize {
        self.entries(&KeyRange::all(), false).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slabs.iter().all(|s| s.is_empty())
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }
}
