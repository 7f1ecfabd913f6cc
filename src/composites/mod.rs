// Cell name addressing.
//
// A cell is named by a sequence of byte components: the clustering values of
// its CQL row, then (for sparse layouts) the name of the declared column it
// belongs to, then (for collection columns) the element within the
// collection. `Composite` is the general prefix type used for slice bounds and
// range tombstones; `CellName` is a complete name attached to a cell.

use std::{fmt, hash::Hash, mem, sync::Arc};

use bytes::Bytes;

mod cell_name_type;

pub use cell_name_type::{CellNameType, Layout};

/// End-of-component marker. Lets a prefix sort before (`Start`) or after
/// (`End`) every name it is a prefix of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Eoc {
    Start,
    None,
    End,
}

impl Eoc {
    pub fn to_byte(self) -> u8 {
        match self {
            Eoc::Start => 0xff,
            Eoc::None => 0,
            Eoc::End => 1,
        }
    }

    pub fn from_byte(b: u8) -> Eoc {
        match b as i8 {
            0 => Eoc::None,
            x if x < 0 => Eoc::Start,
            _ => Eoc::End,
        }
    }

    // Result of comparing a prefix carrying this marker with a longer name it
    // is a prefix of.
    pub(crate) fn prefix_comparison_result(self) -> std::cmp::Ordering {
        match self {
            Eoc::Start | Eoc::None => std::cmp::Ordering::Less,
            Eoc::End => std::cmp::Ordering::Greater,
        }
    }
}

/// Anything that can be ordered by a `CellNameType`.
pub trait Prefix {
    fn components(&self) -> &[Bytes];

    fn eoc(&self) -> Eoc {
        Eoc::None
    }

    fn size(&self) -> usize {
        self.components().len()
    }

    fn is_empty(&self) -> bool {
        self.components().is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Composite {
    components: Vec<Bytes>,
    eoc: Eoc,
}

impl Composite {
    /// The empty prefix. As a slice bound it means "unbounded".
    pub fn empty() -> Self {
        Composite {
            components: Vec::new(),
            eoc: Eoc::None,
        }
    }

    pub fn new<I>(components: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        Composite {
            components: components.into_iter().map(Into::into).collect(),
            eoc: Eoc::None,
        }
    }

    pub fn with_eoc(mut self, eoc: Eoc) -> Self {
        self.eoc = eoc;
        self
    }

    /// Sorts before every name this is a prefix of.
    pub fn start(self) -> Self {
        self.with_eoc(Eoc::Start)
    }

    /// Sorts after every name this is a prefix of.
    pub fn end(self) -> Self {
        self.with_eoc(Eoc::End)
    }

    pub fn get(&self, i: usize) -> Option<&Bytes> {
        self.components.get(i)
    }

    pub fn push(&mut self, component: Bytes) {
        self.components.push(component);
    }
}

impl Prefix for Composite {
    fn components(&self) -> &[Bytes] {
        &self.components
    }

    fn eoc(&self) -> Eoc {
        self.eoc
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct NameInner {
    components: Vec<Bytes>,
    clustering_size: usize,
    // Whether the component after the clustering values names a declared
    // column (sparse layouts).
    has_column: bool,
}

/// The full name of a cell. Cheap to clone; interned names are shared between
/// every cell that uses them.
#[derive(Clone)]
pub struct CellName(Arc<NameInner>);

impl CellName {
    pub(crate) fn dense(components: Vec<Bytes>) -> Self {
        let clustering_size = components.len();
        CellName(Arc::new(NameInner {
            components,
            clustering_size,
            has_column: false,
        }))
    }

    pub(crate) fn sparse(mut clustering: Vec<Bytes>, column: Bytes, element: Option<Bytes>) -> Self {
        let clustering_size = clustering.len();
        clustering.push(column);
        clustering.extend(element);
        CellName(Arc::new(NameInner {
            components: clustering,
            clustering_size,
            has_column: true,
        }))
    }

    pub fn clustering_size(&self) -> usize {
        self.0.clustering_size
    }

    pub fn clustering_prefix(&self) -> Composite {
        Composite::new(self.0.components[..self.0.clustering_size].iter().cloned())
    }

    pub fn is_dense(&self) -> bool {
        !self.0.has_column
    }

    /// Name of the declared column this cell belongs to.
    pub fn cql3_column_name(&self) -> Option<&Bytes> {
        if self.0.has_column {
            self.0.components.get(self.0.clustering_size)
        } else {
            None
        }
    }

    pub fn collection_element(&self) -> Option<&Bytes> {
        if self.0.has_column {
            self.0.components.get(self.0.clustering_size + 1)
        } else {
            None
        }
    }

    pub fn is_collection_cell(&self) -> bool {
        self.collection_element().is_some()
    }

    /// The name without any collection element: every element of a
    /// collection shares it.
    pub fn column_prefix(&self) -> Composite {
        let n = if self.0.has_column {
            self.0.clustering_size + 1
        } else {
            self.0.components.len()
        };
        Composite::new(self.0.components[..n].iter().cloned())
    }

    /// Whether both cells belong to the same CQL row. In a dense layout a cell
    /// is a whole row, so only an equal name qualifies.
    pub fn is_same_cql3_row_as(&self, other: &CellName) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        if self.is_dense() || other.is_dense() {
            return self == other;
        }
        self.clustering_size() == other.clustering_size()
            && self.0.components[..self.clustering_size()]
                == other.0.components[..other.clustering_size()]
    }

    pub fn ptr_eq(&self, other: &CellName) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn memory_size(&self) -> usize {
        mem::size_of::<NameInner>()
            + self
                .0
                .components
                .iter()
                .map(|c| mem::size_of::<Bytes>() + c.len())
                .sum::<usize>()
    }
}

impl Prefix for CellName {
    fn components(&self) -> &[Bytes] {
        &self.0.components
    }
}

impl PartialEq for CellName {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.components == other.0.components
    }
}

impl Eq for CellName {}

impl Hash for CellName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.components.hash(state)
    }
}

impl fmt::Debug for CellName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellName(")?;
        for (i, c) in self.0.components.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{}", String::from_utf8_lossy(c))?;
        }
        write!(f, ")")
    }
}
