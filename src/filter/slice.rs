use std::{
    cmp::Ordering,
    io::{Read, Write},
};

use crate::{
    composites::{CellNameType, Composite, Prefix},
    encoding::{short_length_size, DataInput, DataOutput, INT_SIZE},
    error::{Error, Result},
};

fn order<A, B>(comparator: &CellNameType, reversed: bool, a: &A, b: &B) -> Ordering
where
    A: Prefix + ?Sized,
    B: Prefix + ?Sized,
{
    if reversed {
        comparator.reverse_compare(a, b)
    } else {
        comparator.compare(a, b)
    }
}

/// A contiguous range of cell names. An empty bound is unbounded. For a
/// reversed query `start` is the greater name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSlice {
    pub start: Composite,
    pub finish: Composite,
}

impl ColumnSlice {
    pub fn new(start: Composite, finish: Composite) -> Self {
        ColumnSlice { start, finish }
    }

    pub fn all() -> Self {
        ColumnSlice::new(Composite::empty(), Composite::empty())
    }

    pub fn includes<P: Prefix + ?Sized>(
        &self,
        comparator: &CellNameType,
        reversed: bool,
        name: &P,
    ) -> bool {
        (self.start.is_empty() || order(comparator, reversed, &self.start, name) != Ordering::Greater)
            && (self.finish.is_empty()
                || order(comparator, reversed, name, &self.finish) != Ordering::Greater)
    }

    /// Whether any name between `min` and `max` (forward order) could fall in
    /// this slice.
    pub fn intersects<A, B>(&self, comparator: &CellNameType, reversed: bool, min: &A, max: &B) -> bool
    where
        A: Prefix + ?Sized,
        B: Prefix + ?Sized,
    {
        let (lo, hi) = if reversed {
            (&self.finish, &self.start)
        } else {
            (&self.start, &self.finish)
        };
        (lo.is_empty() || comparator.compare(lo, max) != Ordering::Greater)
            && (hi.is_empty() || comparator.compare(min, hi) != Ordering::Greater)
    }

    /// A slice whose bounds are out of order for the direction selects
    /// nothing.
    pub fn is_wrapping(&self, comparator: &CellNameType, reversed: bool) -> bool {
        !self.start.is_empty()
            && !self.finish.is_empty()
            && order(comparator, reversed, &self.start, &self.finish) == Ordering::Greater
    }

    pub fn serialize<W: Write + ?Sized>(&self, comparator: &CellNameType, out: &mut W) -> Result<()> {
        out.write_with_short_length(&comparator.to_bytes(&self.start)?)?;
        out.write_with_short_length(&comparator.to_bytes(&self.finish)?)
    }

    pub fn deserialize<R: Read + ?Sized>(comparator: &CellNameType, input: &mut R) -> Result<Self> {
        let start = comparator.composite_from_bytes(&input.read_with_short_length()?)?;
        let finish = comparator.composite_from_bytes(&input.read_with_short_length()?)?;
        Ok(ColumnSlice { start, finish })
    }

    pub fn serialized_size(&self, comparator: &CellNameType) -> Result<usize> {
        Ok(short_length_size(comparator.to_bytes(&self.start)?.len())
            + short_length_size(comparator.to_bytes(&self.finish)?.len()))
    }
}

/// Selects the cells of one or more slices, in forward or reverse order, up
/// to `count` results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceQueryFilter {
    pub slices: Vec<ColumnSlice>,
    pub reversed: bool,
    /// Maximum number of results, counted as cells or as CQL rows depending
    /// on `composites_to_group`.
    pub count: usize,
    /// When set, cells sharing this many leading name components count as a
    /// single result.
    pub composites_to_group: Option<usize>,
}

impl SliceQueryFilter {
    pub fn new(slices: Vec<ColumnSlice>, reversed: bool, count: usize) -> Self {
        SliceQueryFilter {
            slices,
            reversed,
            count,
            composites_to_group: None,
        }
    }

    pub fn all() -> Self {
        SliceQueryFilter::new(vec![ColumnSlice::all()], false, usize::MAX)
    }

    pub fn single(start: Composite, finish: Composite, reversed: bool, count: usize) -> Self {
        SliceQueryFilter::new(vec![ColumnSlice::new(start, finish)], reversed, count)
    }

    pub fn grouped(mut self, composites_to_group: usize) -> Self {
        self.composites_to_group = Some(composites_to_group);
        self
    }

    pub fn includes<P: Prefix + ?Sized>(&self, comparator: &CellNameType, name: &P) -> bool {
        self.slices
            .iter()
            .any(|s| s.includes(comparator, self.reversed, name))
    }

    pub fn intersects<A, B>(&self, comparator: &CellNameType, min: &A, max: &B) -> bool
    where
        A: Prefix + ?Sized,
        B: Prefix + ?Sized,
    {
        self.slices
            .iter()
            .any(|s| s.intersects(comparator, self.reversed, min, max))
    }

    /// The same filter starting from `start` instead of its first slice's
    /// start. Slices that end before `start` are dropped.
    pub fn with_start(&self, comparator: &CellNameType, start: Composite) -> Self {
        let mut slices = Vec::with_capacity(self.slices.len());
        for s in &self.slices {
            if !s.finish.is_empty()
                && order(comparator, self.reversed, &s.finish, &start) == Ordering::Less
            {
                continue;
            }
            if slices.is_empty() && s.includes(comparator, self.reversed, &start) {
                slices.push(ColumnSlice::new(start.clone(), s.finish.clone()));
            } else {
                slices.push(s.clone());
            }
        }
        SliceQueryFilter {
            slices,
            reversed: self.reversed,
            count: self.count,
            composites_to_group: self.composites_to_group,
        }
    }

    pub fn serialize<W: Write + ?Sized>(&self, comparator: &CellNameType, out: &mut W) -> Result<()> {
        out.write_i32(self.slices.len() as i32)?;
        for s in &self.slices {
            s.serialize(comparator, out)?;
        }
        out.write_bool(self.reversed)?;
        out.write_i32(i32::try_from(self.count).unwrap_or(i32::MAX))?;
        out.write_i32(match self.composites_to_group {
            Some(n) => i32::try_from(n).map_err(|_| Error::marshal("composites_to_group overflow"))?,
            None => -1,
        })
    }

    pub fn deserialize<R: Read + ?Sized>(comparator: &CellNameType, input: &mut R) -> Result<Self> {
        let n = input.read_i32()?;
        if n < 0 {
            return Err(Error::decoding(format!("negative slice count {}", n)));
        }
        let mut slices = Vec::with_capacity(n as usize);
        for _ in 0..n {
            slices.push(ColumnSlice::deserialize(comparator, input)?);
        }
        let reversed = input.read_bool()?;
        let count = input.read_i32()?;
        let count = if count == i32::MAX || count < 0 {
            usize::MAX
        } else {
            count as usize
        };
        let group = input.read_i32()?;
        Ok(SliceQueryFilter {
            slices,
            reversed,
            count,
            composites_to_group: usize::try_from(group).ok(),
        })
    }

    pub fn serialized_size(&self, comparator: &CellNameType) -> Result<usize> {
        let mut size = INT_SIZE;
        for s in &self.slices {
            size += s.serialized_size(comparator)?;
        }
        Ok(size + 1 + 2 * INT_SIZE)
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::{ColumnSlice, SliceQueryFilter};
    use crate::{
        composites::{CellNameType, Composite},
        marshal::DataType,
    };

    fn setup() -> (CellNameType, impl Fn(&'static str) -> Composite) {
        let t = CellNameType::from_data_type(
            &DataType::Composite(vec![DataType::Utf8, DataType::Utf8]),
            true,
        )
        .unwrap();
        (t, |s: &'static str| Composite::new([Bytes::from_static(s.as_bytes())]))
    }

    #[test]
    fn test_includes() {
        let (t, p) = setup();
        let name = |a: &'static str, b: &'static str| {
            t.make_dense(vec![Bytes::from_static(a.as_bytes()), Bytes::from_static(b.as_bytes())])
                .unwrap()
        };
        let fwd = ColumnSlice::new(p("b"), p("c").end());
        assert!(fwd.includes(&t, false, &name("b", "a")));
        assert!(fwd.includes(&t, false, &name("c", "z")));
        assert!(!fwd.includes(&t, false, &name("a", "z")));
        assert!(!fwd.includes(&t, false, &name("d", "")));

        let rev = ColumnSlice::new(p("c").end(), p("b"));
        assert!(rev.includes(&t, true, &name("b", "a")));
        assert!(rev.includes(&t, true, &name("c", "z")));
        assert!(!rev.includes(&t, true, &name("d", "a")));
        assert!(!rev.is_wrapping(&t, true));
        assert!(rev.is_wrapping(&t, false));

        assert!(ColumnSlice::all().includes(&t, true, &name("x", "y")));
        assert!(fwd.intersects(&t, false, &p("a"), &p("b").end()));
        assert!(!fwd.intersects(&t, false, &p("d"), &p("e")));
        assert!(rev.intersects(&t, true, &p("a"), &p("b").end()));
    }

    #[test]
    fn test_with_start() {
        let (t, p) = setup();
        let f = SliceQueryFilter::new(
            vec![
                ColumnSlice::new(p("a"), p("b").end()),
                ColumnSlice::new(p("d"), p("e").end()),
            ],
            false,
            10,
        );
        let paged = f.with_start(&t, p("d").end());
        assert_eq!(paged.slices, vec![ColumnSlice::new(p("d").end(), p("e").end())]);
        let paged = f.with_start(&t, p("a").end());
        assert_eq!(paged.slices.len(), 2);
        assert_eq!(paged.slices[0].start, p("a").end());
    }

    #[test]
    fn test_serialization() {
        let (t, p) = setup();
        let f = SliceQueryFilter::single(p("a"), p("z").end(), false, 100).grouped(1);
        let mut buf = Vec::new();
        f.serialize(&t, &mut buf).unwrap();
        assert_eq!(buf.len(), f.serialized_size(&t).unwrap());
        assert_eq!(SliceQueryFilter::deserialize(&t, &mut buf.as_slice()).unwrap(), f);

        let all = SliceQueryFilter::all();
        let mut buf = Vec::new();
        all.serialize(&t, &mut buf).unwrap();
        assert_eq!(SliceQueryFilter::deserialize(&t, &mut buf.as_slice()).unwrap(), all);
    }
}
