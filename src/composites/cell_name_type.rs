use std::{cmp::Ordering, collections::BTreeMap, collections::HashMap, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};

use super::{CellName, Composite, Eoc, Prefix};
use crate::{
    error::{Error, Result},
    marshal::{split_composite, DataType, BYTES, UTF8},
};

/// How the components of a cell name map onto a table's columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    /// One component, which is the whole row.
    SimpleDense(DataType),
    /// Several clustering components and no column selector.
    CompoundDense(Vec<DataType>),
    /// One component naming a declared column, no clustering.
    SimpleSparse(DataType),
    /// Clustering components followed by a UTF-8 column selector, and an
    /// element component for collection columns.
    CompoundSparse {
        clustering: Vec<DataType>,
        collections: Option<BTreeMap<Bytes, DataType>>,
    },
}

/// Comparator and codec for the cell names of one table.
///
/// Sparse layouts keep a table of interned names for declared columns so that
/// names built for the same column share one allocation. The table is copied
/// on write: a clone taken before `add_cql3_column` or `remove_cql3_column`
/// keeps seeing the old table.
#[derive(Clone, Debug)]
pub struct CellNameType {
    layout: Layout,
    interned: Arc<HashMap<Bytes, CellName>>,
}

impl PartialEq for CellNameType {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout
    }
}

impl CellNameType {
    pub fn new(layout: Layout) -> Self {
        CellNameType {
            layout,
            interned: Arc::new(HashMap::new()),
        }
    }

    /// Derives the addressing scheme from a table comparator.
    pub fn from_data_type(t: &DataType, is_dense: bool) -> Result<Self> {
        let layout = match (t, is_dense) {
            (DataType::Composite(types), true) => Layout::CompoundDense(types.clone()),
            (t, true) => Layout::SimpleDense(t.clone()),
            (DataType::Composite(types), false) => {
                let (last, rest) = types
                    .split_last()
                    .ok_or_else(|| Error::configuration("empty composite comparator"))?;
                match last {
                    DataType::ColumnToCollection(collections) => {
                        let (selector, clustering) = rest.split_last().ok_or_else(|| {
                            Error::configuration("collection comparator without a column selector")
                        })?;
                        check_selector(selector)?;
                        Layout::CompoundSparse {
                            clustering: clustering.to_vec(),
                            collections: Some(collections.clone()),
                        }
                    }
                    selector => {
                        check_selector(selector)?;
                        Layout::CompoundSparse {
                            clustering: rest.to_vec(),
                            collections: None,
                        }
                    }
                }
            }
            (t, false) => Layout::SimpleSparse(t.clone()),
        };
        Ok(CellNameType::new(layout))
    }

    /// The comparator this type was derived from.
    pub fn as_data_type(&self) -> DataType {
        match &self.layout {
            Layout::SimpleDense(t) | Layout::SimpleSparse(t) => t.clone(),
            Layout::CompoundDense(types) => DataType::Composite(types.clone()),
            Layout::CompoundSparse {
                clustering,
                collections,
            } => {
                let mut types = clustering.clone();
                types.push(DataType::Utf8);
                if let Some(c) = collections {
                    types.push(DataType::ColumnToCollection(c.clone()));
                }
                DataType::Composite(types)
            }
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.layout, Layout::SimpleDense(_) | Layout::CompoundDense(_))
    }

    pub fn is_compound(&self) -> bool {
        matches!(
            self.layout,
            Layout::CompoundDense(_) | Layout::CompoundSparse { .. }
        )
    }

    pub fn clustering_size(&self) -> usize {
        match &self.layout {
            Layout::SimpleDense(_) => 1,
            Layout::CompoundDense(types) => types.len(),
            Layout::SimpleSparse(_) => 0,
            Layout::CompoundSparse { clustering, .. } => clustering.len(),
        }
    }

    pub fn has_collections(&self) -> bool {
        matches!(
            &self.layout,
            Layout::CompoundSparse {
                collections: Some(_),
                ..
            }
        )
    }

    pub fn collection_type(&self, column: &[u8]) -> Option<&DataType> {
        match &self.layout {
            Layout::CompoundSparse {
                collections: Some(c),
                ..
            } => c.get(column),
            _ => None,
        }
    }

    // Comparator for component `i` of `components`. The element component of
    // a collection cell depends on which column the cell belongs to.
    fn subtype(&self, i: usize, components: &[Bytes]) -> &DataType {
        match &self.layout {
            Layout::SimpleDense(t) | Layout::SimpleSparse(t) => t,
            Layout::CompoundDense(types) => types.get(i).unwrap_or(&BYTES),
            Layout::CompoundSparse {
                clustering,
                collections,
            } => {
                let n = clustering.len();
                if i < n {
                    &clustering[i]
                } else if i == n {
                    &UTF8
                } else {
                    collections
                        .as_ref()
                        .and_then(|c| components.get(n).and_then(|col| c.get(col)))
                        .and_then(|t| t.name_comparator().ok())
                        .unwrap_or(&BYTES)
                }
            }
        }
    }

    /// Total order over names and prefixes. Components compare one by one
    /// with their own type; when one side is a strict prefix of the other its
    /// end-of-component marker decides.
    pub fn compare<A, B>(&self, a: &A, b: &B) -> Ordering
    where
        A: Prefix + ?Sized,
        B: Prefix + ?Sized,
    {
        let (ca, cb) = (a.components(), b.components());
        for (i, (x, y)) in ca.iter().zip(cb.iter()).enumerate() {
            let c = self.subtype(i, ca).compare(x, y);
            if c != Ordering::Equal {
                return c;
            }
        }
        match ca.len().cmp(&cb.len()) {
            Ordering::Equal => a.eoc().cmp(&b.eoc()),
            Ordering::Less => a.eoc().prefix_comparison_result(),
            Ordering::Greater => b.eoc().prefix_comparison_result().reverse(),
        }
    }

    pub fn reverse_compare<A, B>(&self, a: &A, b: &B) -> Ordering
    where
        A: Prefix + ?Sized,
        B: Prefix + ?Sized,
    {
        self.compare(b, a)
    }

    /// Whether `name` falls under `prefix`.
    pub fn is_prefix_of<P: Prefix + ?Sized>(&self, prefix: &P, name: &CellName) -> bool {
        let (cp, cn) = (prefix.components(), name.components());
        cp.len() <= cn.len()
            && cp
                .iter()
                .zip(cn.iter())
                .enumerate()
                .all(|(i, (x, y))| self.subtype(i, cn).compare(x, y) == Ordering::Equal)
    }

    /// Serializes a prefix. Simple layouts store the bare component; compound
    /// layouts store each component with a short length and an
    /// end-of-component byte, the last of which carries the prefix's marker.
    pub fn to_bytes<P: Prefix + ?Sized>(&self, p: &P) -> Result<Bytes> {
        let components = p.components();
        if !self.is_compound() {
            return match components {
                [] => Ok(Bytes::new()),
                [c] => Ok(c.clone()),
                _ => Err(Error::marshal(format!(
                    "{} components for a simple comparator",
                    components.len()
                ))),
            };
        }
        let mut out = BytesMut::new();
        for (i, c) in components.iter().enumerate() {
            let len = u16::try_from(c.len())
                .map_err(|_| Error::marshal("name component longer than 65535 bytes"))?;
            out.put_u16(len);
            out.put_slice(c);
            out.put_u8(if i + 1 == components.len() {
                p.eoc().to_byte()
            } else {
                0
            });
        }
        Ok(out.freeze())
    }

    /// Decodes a prefix such as a slice bound.
    pub fn composite_from_bytes(&self, bytes: &[u8]) -> Result<Composite> {
        if bytes.is_empty() {
            return Ok(Composite::empty());
        }
        if !self.is_compound() {
            return Ok(Composite::new([Bytes::copy_from_slice(bytes)]));
        }
        let parts = split_composite(bytes)
            .ok_or_else(|| Error::decoding("malformed composite cell name"))?;
        let eoc = parts
            .last()
            .map(|(_, eoc)| Eoc::from_byte(*eoc as u8))
            .unwrap_or(Eoc::None);
        if parts.len() > self.max_components() {
            return Err(Error::decoding(format!(
                "prefix has {} components, comparator allows at most {}",
                parts.len(),
                self.max_components()
            )));
        }
        Ok(Composite::new(parts.into_iter().map(|(c, _)| Bytes::copy_from_slice(c))).with_eoc(eoc))
    }

    fn max_components(&self) -> usize {
        match &self.layout {
            Layout::SimpleDense(_) | Layout::SimpleSparse(_) => 1,
            Layout::CompoundDense(types) => types.len(),
            Layout::CompoundSparse {
                clustering,
                collections,
            } => clustering.len() + if collections.is_some() { 2 } else { 1 },
        }
    }

    /// Decodes a complete cell name, returning the interned instance when the
    /// name is one of the registered columns.
    pub fn cell_from_bytes(&self, bytes: &[u8]) -> Result<CellName> {
        if bytes.is_empty() {
            return Err(Error::decoding("empty cell name"));
        }
        match &self.layout {
            Layout::SimpleDense(_) => Ok(CellName::dense(vec![Bytes::copy_from_slice(bytes)])),
            Layout::SimpleSparse(_) => Ok(match self.interned.get(bytes) {
                Some(name) => name.clone(),
                None => CellName::sparse(Vec::new(), Bytes::copy_from_slice(bytes), None),
            }),
            Layout::CompoundDense(types) => {
                let parts = split_composite(bytes)
                    .ok_or_else(|| Error::decoding("malformed composite cell name"))?;
                if parts.len() != types.len() {
                    return Err(Error::decoding(format!(
                        "dense cell name has {} components, expected {}",
                        parts.len(),
                        types.len()
                    )));
                }
                Ok(CellName::dense(
                    parts.into_iter().map(|(c, _)| Bytes::copy_from_slice(c)).collect(),
                ))
            }
            Layout::CompoundSparse { clustering, .. } => {
                let parts = split_composite(bytes)
                    .ok_or_else(|| Error::decoding("malformed composite cell name"))?;
                let n = clustering.len();
                if parts.len() <= n {
                    return Err(Error::decoding(format!(
                        "sparse cell name has {} components, expected a column after {}",
                        parts.len(),
                        n
                    )));
                }
                let mut components: Vec<Bytes> =
                    parts.into_iter().map(|(c, _)| Bytes::copy_from_slice(c)).collect();
                let element = match components.len() - n {
                    1 => None,
                    2 if self.collection_type(&components[n]).is_some() => components.pop(),
                    _ => {
                        return Err(Error::decoding(format!(
                            "sparse cell name has {} components for {} clustering columns",
                            components.len(),
                            n
                        )));
                    }
                };
                let column = components.pop().unwrap_or_default();
                Ok(self.make_sparse(components, column, element))
            }
        }
    }

    fn make_sparse(&self, clustering: Vec<Bytes>, column: Bytes, element: Option<Bytes>) -> CellName {
        match self.interned.get(&column) {
            Some(name) if clustering.is_empty() && element.is_none() => name.clone(),
            // Reuse the interned column bytes.
            Some(name) => CellName::sparse(
                clustering,
                name.cql3_column_name().cloned().unwrap_or(column),
                element,
            ),
            None => CellName::sparse(clustering, column, element),
        }
    }

    /// Builds the name of a cell of a declared column under a clustering
    /// prefix.
    pub fn create(&self, prefix: &Composite, column: &[u8]) -> Result<CellName> {
        match &self.layout {
            Layout::SimpleDense(_) | Layout::CompoundDense(_) => Err(Error::Unsupported(
                "dense layouts have no column selector; use make_dense",
            )),
            Layout::SimpleSparse(_) | Layout::CompoundSparse { .. } => {
                self.check_prefix(prefix)?;
                Ok(self.make_sparse(
                    prefix.components().to_vec(),
                    Bytes::copy_from_slice(column),
                    None,
                ))
            }
        }
    }

    /// Builds the name of one element of a collection column.
    pub fn create_collection_cell(
        &self,
        prefix: &Composite,
        column: &[u8],
        element: Bytes,
    ) -> Result<CellName> {
        if self.collection_type(column).is_none() {
            return Err(Error::configuration(format!(
                "{} is not a collection column",
                String::from_utf8_lossy(column)
            )));
        }
        self.check_prefix(prefix)?;
        Ok(self.make_sparse(
            prefix.components().to_vec(),
            Bytes::copy_from_slice(column),
            Some(element),
        ))
    }

    /// Builds a dense cell name from a full set of clustering values.
    pub fn make_dense(&self, components: Vec<Bytes>) -> Result<CellName> {
        if !self.is_dense() {
            return Err(Error::Unsupported("sparse layouts need a column selector"));
        }
        if components.len() != self.clustering_size() {
            return Err(Error::marshal(format!(
                "dense cell name needs {} components, got {}",
                self.clustering_size(),
                components.len()
            )));
        }
        Ok(CellName::dense(components))
    }

    fn check_prefix(&self, prefix: &Composite) -> Result<()> {
        if prefix.size() != self.clustering_size() {
            return Err(Error::marshal(format!(
                "clustering prefix has {} components, expected {}",
                prefix.size(),
                self.clustering_size()
            )));
        }
        Ok(())
    }

    /// Bounds covering every cell of `column` under `prefix`, including all
    /// elements of a collection.
    pub fn column_range(&self, prefix: &Composite, column: &[u8]) -> (Composite, Composite) {
        let mut c = prefix.clone();
        c.push(Bytes::copy_from_slice(column));
        (c.clone().start(), c.end())
    }

    /// Registers a declared column so that its names are interned.
    pub fn add_cql3_column(&mut self, column: Bytes) {
        if self.is_dense() {
            return;
        }
        let name = CellName::sparse(Vec::new(), column.clone(), None);
        Arc::make_mut(&mut self.interned).insert(column, name);
    }

    pub fn remove_cql3_column(&mut self, column: &[u8]) {
        if self.interned.contains_key(column) {
            Arc::make_mut(&mut self.interned).remove(column);
        }
    }

    pub fn interned_count(&self) -> usize {
        self.interned.len()
    }

    /// Replaces the type of one clustering component, keeping the interned
    /// names.
    pub fn set_subtype(&self, position: usize, t: DataType) -> Result<CellNameType> {
        let out_of_range = || {
            Error::configuration(format!("no clustering component at position {}", position))
        };
        let layout = match &self.layout {
            Layout::SimpleDense(_) if position == 0 => Layout::SimpleDense(t),
            Layout::SimpleSparse(_) if position == 0 => Layout::SimpleSparse(t),
            Layout::CompoundDense(types) => {
                let mut types = types.clone();
                *types.get_mut(position).ok_or_else(out_of_range)? = t;
                Layout::CompoundDense(types)
            }
            Layout::CompoundSparse {
                clustering,
                collections,
            } => {
                let mut clustering = clustering.clone();
                *clustering.get_mut(position).ok_or_else(out_of_range)? = t;
                Layout::CompoundSparse {
                    clustering,
                    collections: collections.clone(),
                }
            }
            _ => return Err(out_of_range()),
        };
        Ok(CellNameType {
            layout,
            interned: self.interned.clone(),
        })
    }

    /// Human-readable form of a name or prefix.
    pub fn get_string<P: Prefix + ?Sized>(&self, p: &P) -> Result<String> {
        let components = p.components();
        let mut out = String::new();
        for (i, c) in components.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(&self.subtype(i, components).get_string(c)?);
        }
        match p.eoc() {
            Eoc::Start => out.push('!'),
            Eoc::End => out.push('@'),
            Eoc::None => {}
        }
        Ok(out)
    }
}

fn check_selector(t: &DataType) -> Result<()> {
    if *t == DataType::Utf8 {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "sparse comparator must end with a UTF8Type column selector, not {}",
            t
        )))
    }
}
