use std::{
    cmp::Ordering,
    io::{Read, Write},
    mem,
};

use bytes::Bytes;

use super::deletion::{DeletionTime, RangeTombstone};
use crate::{
    composites::{CellName, CellNameType, Prefix},
    encoding::{short_length_size, DataInput, DataOutput, Decode, Encode, INT_SIZE, LONG_SIZE},
    error::{Error, Result},
};

const DELETION_MASK: u8 = 0x01;
const EXPIRATION_MASK: u8 = 0x02;
const RANGE_TOMBSTONE_MASK: u8 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellKind {
    Normal,
    /// A cell tombstone.
    Deleted { local_deletion_time: i32 },
    /// Live until `local_expiration_time`, then behaves like a tombstone
    /// deleted at that time.
    Expiring { ttl: i32, local_expiration_time: i32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub name: CellName,
    pub value: Bytes,
    pub timestamp: i64,
    pub kind: CellKind,
}

impl Cell {
    pub fn new(name: CellName, value: Bytes, timestamp: i64) -> Self {
        Cell {
            name,
            value,
            timestamp,
            kind: CellKind::Normal,
        }
    }

    pub fn tombstone(name: CellName, timestamp: i64, local_deletion_time: i32) -> Self {
        Cell {
            name,
            value: Bytes::copy_from_slice(&local_deletion_time.to_be_bytes()),
            timestamp,
            kind: CellKind::Deleted {
                local_deletion_time,
            },
        }
    }

    pub fn expiring(name: CellName, value: Bytes, timestamp: i64, ttl: i32, now: i32) -> Self {
        Cell {
            name,
            value,
            timestamp,
            kind: CellKind::Expiring {
                ttl,
                local_expiration_time: now.saturating_add(ttl),
            },
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, CellKind::Deleted { .. })
    }

    pub fn is_live(&self, now: i32) -> bool {
        match self.kind {
            CellKind::Normal => true,
            CellKind::Deleted { .. } => false,
            CellKind::Expiring {
                local_expiration_time,
                ..
            } => now < local_expiration_time,
        }
    }

    /// When this cell became (or will become) a tombstone. `i32::MAX` for
    /// cells that never do.
    pub fn local_deletion_time(&self) -> i32 {
        match self.kind {
            CellKind::Normal => i32::MAX,
            CellKind::Deleted {
                local_deletion_time,
            } => local_deletion_time,
            CellKind::Expiring {
                local_expiration_time,
                ..
            } => local_expiration_time,
        }
    }

    /// Picks the authoritative version of two cells with the same name. The
    /// newer write wins; on a timestamp tie a tombstone beats a live cell and
    /// otherwise the greater value wins, so the result never depends on the
    /// order the cells arrive in.
    pub fn reconcile(self, other: Cell) -> Cell {
        match self.timestamp.cmp(&other.timestamp) {
            Ordering::Less => return other,
            Ordering::Greater => return self,
            Ordering::Equal => {}
        }
        if self.is_tombstone() != other.is_tombstone() {
            return if self.is_tombstone() { self } else { other };
        }
        match self.value.cmp(&other.value) {
            Ordering::Less => other,
            Ordering::Greater => self,
            Ordering::Equal => {
                if self.local_deletion_time() >= other.local_deletion_time() {
                    self
                } else {
                    other
                }
            }
        }
    }

    pub fn memory_size(&self) -> usize {
        mem::size_of::<Cell>() + self.name.memory_size() + self.value.len()
    }
}

/// What a partition is made of on disk: cells and range tombstones, in
/// comparator order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OnDiskAtom {
    Cell(Cell),
    RangeTombstone(RangeTombstone),
}

impl OnDiskAtom {
    /// The name the atom sorts by: the cell name, or the start of the range.
    pub fn name(&self) -> &dyn Prefix {
        match self {
            OnDiskAtom::Cell(c) => &c.name,
            OnDiskAtom::RangeTombstone(rt) => &rt.min,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            OnDiskAtom::Cell(c) => c.timestamp,
            OnDiskAtom::RangeTombstone(rt) => rt.data.marked_for_delete_at,
        }
    }

    pub fn local_deletion_time(&self) -> i32 {
        match self {
            OnDiskAtom::Cell(c) => c.local_deletion_time(),
            OnDiskAtom::RangeTombstone(rt) => rt.data.local_deletion_time,
        }
    }

    pub fn serialize<W: Write + ?Sized>(&self, comparator: &CellNameType, out: &mut W) -> Result<()> {
        match self {
            OnDiskAtom::RangeTombstone(rt) => {
                if rt.min.is_empty() {
                    return Err(Error::marshal("range tombstone with an empty start"));
                }
                out.write_with_short_length(&comparator.to_bytes(&rt.min)?)?;
                out.write_byte(RANGE_TOMBSTONE_MASK)?;
                out.write_with_short_length(&comparator.to_bytes(&rt.max)?)?;
                rt.data.encode(out)
            }
            OnDiskAtom::Cell(cell) => {
                out.write_with_short_length(&comparator.to_bytes(&cell.name)?)?;
                match cell.kind {
                    CellKind::Normal => out.write_byte(0)?,
                    CellKind::Deleted { .. } => out.write_byte(DELETION_MASK)?,
                    CellKind::Expiring {
                        ttl,
                        local_expiration_time,
                    } => {
                        out.write_byte(EXPIRATION_MASK)?;
                        out.write_i32(ttl)?;
                        out.write_i32(local_expiration_time)?;
                    }
                }
                out.write_i64(cell.timestamp)?;
                out.write_with_length(&cell.value)
            }
        }
    }

    pub fn serialized_size(&self, comparator: &CellNameType) -> Result<usize> {
        Ok(match self {
            OnDiskAtom::RangeTombstone(rt) => {
                short_length_size(comparator.to_bytes(&rt.min)?.len())
                    + 1
                    + short_length_size(comparator.to_bytes(&rt.max)?.len())
                    + rt.data.serialized_size()
            }
            OnDiskAtom::Cell(cell) => {
                let expiring = match cell.kind {
                    CellKind::Expiring { .. } => 2 * INT_SIZE,
                    _ => 0,
                };
                short_length_size(comparator.to_bytes(&cell.name)?.len())
                    + 1
                    + expiring
                    + LONG_SIZE
                    + INT_SIZE
                    + cell.value.len()
            }
        })
    }

    /// Reads the next atom of a partition, or `None` at the end-of-row
    /// marker.
    pub fn deserialize<R: Read + ?Sized>(
        comparator: &CellNameType,
        input: &mut R,
    ) -> Result<Option<OnDiskAtom>> {
        let name = input.read_with_short_length()?;
        if name.is_empty() {
            return Ok(None);
        }
        let mask = input.read_byte()?;
        if mask & RANGE_TOMBSTONE_MASK != 0 {
            let min = comparator.composite_from_bytes(&name)?;
            let max = comparator.composite_from_bytes(&input.read_with_short_length()?)?;
            let data = DeletionTime::decode(input)?;
            return Ok(Some(OnDiskAtom::RangeTombstone(RangeTombstone::new(
                min, max, data,
            ))));
        }
        if mask & !(DELETION_MASK | EXPIRATION_MASK) != 0 {
            return Err(Error::decoding(format!("unknown cell mask {:#04x}", mask)));
        }
        let name = comparator.cell_from_bytes(&name)?;
        let expiring = if mask & EXPIRATION_MASK != 0 {
            Some((input.read_i32()?, input.read_i32()?))
        } else {
            None
        };
        let timestamp = input.read_i64()?;
        let value = input.read_with_length()?;
        let kind = if mask & DELETION_MASK != 0 {
            let ldt: [u8; 4] = value[..]
                .try_into()
                .map_err(|_| Error::decoding("cell tombstone value is not a deletion time"))?;
            CellKind::Deleted {
                local_deletion_time: i32::from_be_bytes(ldt),
            }
        } else if let Some((ttl, local_expiration_time)) = expiring {
            CellKind::Expiring {
                ttl,
                local_expiration_time,
            }
        } else {
            CellKind::Normal
        };
        Ok(Some(OnDiskAtom::Cell(Cell {
            name,
            value,
            timestamp,
            kind,
        })))
    }

    /// Writes the end-of-row marker.
    pub fn write_end_of_row<W: Write + ?Sized>(out: &mut W) -> Result<()> {
        out.write_u16(0)
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::{Cell, CellKind, OnDiskAtom};
    use crate::{
        composites::{CellName, Composite},
        config::test::sparse_table,
        db::deletion::{DeletionTime, RangeTombstone},
        error::Error,
        marshal::DataType,
    };

    fn name(s: &'static str) -> CellName {
        sparse_table()
            .comparator
            .create(
                &Composite::new([DataType::Int32.from_string("1").unwrap()]),
                s.as_bytes(),
            )
            .unwrap()
    }

    #[test]
    fn test_reconcile() {
        let a = Cell::new(name("col"), Bytes::from_static(&[0x01]), 5);
        let b = Cell::new(name("col"), Bytes::from_static(&[0x02]), 5);
        for _ in 0..10 {
            assert_eq!(a.clone().reconcile(b.clone()).value[..], [0x02]);
            assert_eq!(b.clone().reconcile(a.clone()).value[..], [0x02]);
        }

        let newer = Cell::new(name("col"), Bytes::from_static(&[0x00]), 6);
        assert_eq!(a.clone().reconcile(newer.clone()), newer);

        let dead = Cell::tombstone(name("col"), 5, 100);
        assert_eq!(b.clone().reconcile(dead.clone()), dead);
        assert_eq!(dead.clone().reconcile(b.clone()), dead);
        assert_eq!(dead.clone().reconcile(newer.clone()), newer);
    }

    #[test]
    fn test_liveness() {
        let c = Cell::expiring(name("a"), Bytes::from_static(b"v"), 1, 10, 100);
        assert_eq!(
            c.kind,
            CellKind::Expiring {
                ttl: 10,
                local_expiration_time: 110
            }
        );
        assert!(c.is_live(109));
        assert!(!c.is_live(110));
        assert_eq!(c.local_deletion_time(), 110);
        assert!(!Cell::tombstone(name("a"), 1, 5).is_live(0));
    }

    #[test]
    fn test_atom_serialization() {
        let md = sparse_table();
        let t = &md.comparator;
        let k = Composite::new([DataType::Int32.from_string("1").unwrap()]);
        let atoms = vec![
            OnDiskAtom::Cell(Cell::new(name("a"), Bytes::from_static(b"\x00\x00\x00\x07"), 3)),
            OnDiskAtom::Cell(Cell::tombstone(name("b"), 4, 1000)),
            OnDiskAtom::Cell(Cell::expiring(name("b"), Bytes::from_static(b"x"), 5, 60, 10)),
            OnDiskAtom::RangeTombstone(RangeTombstone::new(
                k.clone().start(),
                k.end(),
                DeletionTime::new(9, 99),
            )),
        ];
        let mut buf = Vec::new();
        for atom in &atoms {
            let before = buf.len();
            atom.serialize(t, &mut buf).unwrap();
            assert_eq!(buf.len() - before, atom.serialized_size(t).unwrap());
        }
        OnDiskAtom::write_end_of_row(&mut buf).unwrap();

        let mut input = buf.as_slice();
        let mut read = Vec::new();
        while let Some(atom) = OnDiskAtom::deserialize(t, &mut input).unwrap() {
            read.push(atom);
        }
        assert_eq!(read, atoms);
        assert!(input.is_empty());

        // Names decoded through the comparator come back interned.
        match &read[0] {
            OnDiskAtom::Cell(c) => assert_eq!(c.name.cql3_column_name().unwrap(), &b"a"[..]),
            _ => panic!("expected a cell"),
        }

        let mut truncated = &buf[..buf.len() / 2];
        let err = std::iter::from_fn(|| OnDiskAtom::deserialize(t, &mut truncated).transpose())
            .find_map(|r| r.err())
            .unwrap();
        assert!(matches!(err, Error::Decoding(_)));

        let unbounded = OnDiskAtom::RangeTombstone(RangeTombstone::new(
            Composite::empty(),
            Composite::empty(),
            DeletionTime::new(1, 1),
        ));
        assert!(matches!(
            unbounded.serialize(t, &mut Vec::new()),
            Err(Error::Marshal(_))
        ));
    }
}
