// Byte comparators.
//
// A DataType knows how to order, validate, render and parse the opaque byte
// strings stored as cell names, cell values and partition keys. Every type
// shares one rule: the empty byte string sorts before everything else and
// equal to itself, for the reversed wrapper too, so that empty bounds can be
// used as open ends of a range whatever the direction of the scan.

use std::{cmp::Ordering, collections::BTreeMap, fmt, str::FromStr};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    encoding::{from_hex, to_hex},
    error::{Error, Result},
};

mod parser;
mod value;

pub use value::Value;

pub(crate) static BYTES: DataType = DataType::Bytes;
pub(crate) static UTF8: DataType = DataType::Utf8;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Bytes,
    Ascii,
    Utf8,
    Boolean,
    Int32,
    Long,
    Float,
    Double,
    Reversed(Box<DataType>),
    Composite(Vec<DataType>),
    List(Box<DataType>),
    Set(Box<DataType>),
    Map(Box<DataType>, Box<DataType>),
    /// Last component of a sparse comparator that has collection columns: maps
    /// a column name to the collection type stored under it.
    ColumnToCollection(BTreeMap<Bytes, DataType>),
}

impl DataType {
    pub fn reversed(self) -> DataType {
        DataType::Reversed(Box::new(self))
    }

    pub fn is_reversed(&self) -> bool {
        matches!(self, DataType::Reversed(_))
    }

    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            DataType::List(_) | DataType::Set(_) | DataType::Map(_, _)
        )
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, DataType::Composite(_))
    }

    /// The type with any reversal stripped.
    pub fn base(&self) -> &DataType {
        match self {
            DataType::Reversed(t) => t.base(),
            t => t,
        }
    }

    /// Comparator used for the element component of a collection cell name.
    /// List elements are addressed by opaque ids, set elements by the element
    /// itself and map entries by their key.
    pub fn name_comparator(&self) -> Result<&DataType> {
        match self {
            DataType::List(_) => Ok(&BYTES),
            DataType::Set(e) => Ok(e),
            DataType::Map(k, _) => Ok(k),
            _ => Err(Error::Unsupported("name comparator of a non-collection type")),
        }
    }

    /// Type of the value stored in a single collection cell.
    pub fn value_comparator(&self) -> Result<&DataType> {
        match self {
            DataType::List(e) => Ok(e),
            DataType::Set(_) => Ok(&BYTES),
            DataType::Map(_, v) => Ok(v),
            _ => Err(Error::Unsupported("value comparator of a non-collection type")),
        }
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.compare_non_empty(a, b),
        }
    }

    fn compare_non_empty(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            DataType::Bytes
            | DataType::Ascii
            | DataType::Utf8
            | DataType::ColumnToCollection(_) => a.cmp(b),
            DataType::Boolean => (a[0] != 0).cmp(&(b[0] != 0)),
            DataType::Int32 => match (fixed::<4>(a), fixed::<4>(b)) {
                (Some(x), Some(y)) => i32::from_be_bytes(x).cmp(&i32::from_be_bytes(y)),
                _ => a.cmp(b),
            },
            DataType::Long => match (fixed::<8>(a), fixed::<8>(b)) {
                (Some(x), Some(y)) => i64::from_be_bytes(x).cmp(&i64::from_be_bytes(y)),
                _ => a.cmp(b),
            },
            DataType::Float => match (fixed::<4>(a), fixed::<4>(b)) {
                (Some(x), Some(y)) => f32::from_be_bytes(x).total_cmp(&f32::from_be_bytes(y)),
                _ => a.cmp(b),
            },
            DataType::Double => match (fixed::<8>(a), fixed::<8>(b)) {
                (Some(x), Some(y)) => f64::from_be_bytes(x).total_cmp(&f64::from_be_bytes(y)),
                _ => a.cmp(b),
            },
            DataType::Reversed(t) => t.compare(b, a),
            DataType::Composite(types) => compare_composite(types, a, b),
            DataType::List(e) | DataType::Set(e) => match (split_collection(a, 1), split_collection(b, 1)) {
                (Some(xs), Some(ys)) => {
                    for (x, y) in xs.iter().zip(ys.iter()) {
                        let c = e.compare(x, y);
                        if c != Ordering::Equal {
                            return c;
                        }
                    }
                    xs.len().cmp(&ys.len())
                }
                _ => a.cmp(b),
            },
            DataType::Map(k, v) => match (split_collection(a, 2), split_collection(b, 2)) {
                (Some(xs), Some(ys)) => {
                    for (x, y) in xs.chunks(2).zip(ys.chunks(2)) {
                        let c = k.compare(x[0], y[0]).then_with(|| v.compare(x[1], y[1]));
                        if c != Ordering::Equal {
                            return c;
                        }
                    }
                    xs.len().cmp(&ys.len())
                }
                _ => a.cmp(b),
            },
        }
    }

    /// Checks that `bytes` is a well-formed value of this type.
    pub fn validate(&self, bytes: &[u8]) -> Result<()> {
        match self {
            DataType::Bytes => Ok(()),
            DataType::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                None => Ok(()),
                Some(i) => Err(Error::marshal(format!("invalid ASCII byte at {}", i))),
            },
            DataType::Utf8 => std::str::from_utf8(bytes)
                .map(|_| ())
                .map_err(|e| Error::marshal(format!("invalid UTF-8: {}", e))),
            DataType::Boolean => check_width(self, bytes, 1),
            DataType::Int32 | DataType::Float => check_width(self, bytes, 4),
            DataType::Long | DataType::Double => check_width(self, bytes, 8),
            DataType::Reversed(t) => t.validate(bytes),
            DataType::Composite(types) => {
                let components = split_composite(bytes)
                    .ok_or_else(|| Error::marshal("malformed composite value"))?;
                if components.len() > types.len() {
                    return Err(Error::marshal(format!(
                        "composite has {} components but its type only has {}",
                        components.len(),
                        types.len()
                    )));
                }
                for ((component, _), t) in components.iter().zip(types.iter()) {
                    t.validate(component)?;
                }
                Ok(())
            }
            DataType::List(e) | DataType::Set(e) => {
                let elements =
                    split_collection(bytes, 1).ok_or_else(|| Error::marshal("malformed collection"))?;
                elements.iter().try_for_each(|x| e.validate(x))
            }
            DataType::Map(k, v) => {
                let elements =
                    split_collection(bytes, 2).ok_or_else(|| Error::marshal("malformed map"))?;
                for pair in elements.chunks(2) {
                    k.validate(pair[0])?;
                    v.validate(pair[1])?;
                }
                Ok(())
            }
            DataType::ColumnToCollection(_) => {
                Err(Error::Unsupported("validating a column-to-collection component"))
            }
        }
    }

    /// Turns raw bytes into a typed value.
    pub fn compose(&self, bytes: &[u8]) -> Result<Value> {
        self.validate(bytes)?;
        let value = match self {
            DataType::Bytes | DataType::ColumnToCollection(_) => {
                Value::Blob(Bytes::copy_from_slice(bytes))
            }
            DataType::Ascii | DataType::Utf8 => {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
            _ if bytes.is_empty() => Value::Empty,
            DataType::Boolean => Value::Boolean(bytes[0] != 0),
            DataType::Int32 => Value::Int(i32::from_be_bytes(expect_fixed(bytes)?)),
            DataType::Long => Value::Long(i64::from_be_bytes(expect_fixed(bytes)?)),
            DataType::Float => Value::Float(f32::from_be_bytes(expect_fixed(bytes)?)),
            DataType::Double => Value::Double(f64::from_be_bytes(expect_fixed(bytes)?)),
            DataType::Reversed(t) => t.compose(bytes)?,
            DataType::Composite(types) => {
                let components = split_composite(bytes)
                    .ok_or_else(|| Error::marshal("malformed composite value"))?;
                Value::Composite(
                    components
                        .iter()
                        .zip(types.iter())
                        .map(|((c, _), t)| t.compose(c))
                        .collect::<Result<_>>()?,
                )
            }
            DataType::List(e) => Value::List(compose_all(e, bytes)?),
            DataType::Set(e) => Value::Set(compose_all(e, bytes)?),
            DataType::Map(k, v) => {
                let elements =
                    split_collection(bytes, 2).ok_or_else(|| Error::marshal("malformed map"))?;
                Value::Map(
                    elements
                        .chunks(2)
                        .map(|pair| Ok((k.compose(pair[0])?, v.compose(pair[1])?)))
                        .collect::<Result<_>>()?,
                )
            }
        };
        Ok(value)
    }

    /// Turns a typed value into its byte form, failing when the value does
    /// not belong to this type.
    pub fn decompose(&self, value: &Value) -> Result<Bytes> {
        let bytes = match (self, value) {
            (DataType::Reversed(t), v) => return t.decompose(v),
            (_, Value::Empty) => Bytes::new(),
            (DataType::Bytes | DataType::ColumnToCollection(_), Value::Blob(b)) => b.clone(),
            (DataType::Ascii | DataType::Utf8, Value::Text(s)) => {
                let b = Bytes::copy_from_slice(s.as_bytes());
                self.validate(&b)?;
                b
            }
            (DataType::Boolean, Value::Boolean(b)) => Bytes::copy_from_slice(&[*b as u8]),
            (DataType::Int32, Value::Int(v)) => Bytes::copy_from_slice(&v.to_be_bytes()),
            (DataType::Long, Value::Long(v)) => Bytes::copy_from_slice(&v.to_be_bytes()),
            (DataType::Float, Value::Float(v)) => Bytes::copy_from_slice(&v.to_be_bytes()),
            (DataType::Double, Value::Double(v)) => Bytes::copy_from_slice(&v.to_be_bytes()),
            (DataType::Composite(types), Value::Composite(values)) => {
                if values.len() > types.len() {
                    return Err(Error::marshal("too many composite components"));
                }
                let components = types
                    .iter()
                    .zip(values.iter())
                    .map(|(t, v)| t.decompose(v))
                    .collect::<Result<Vec<_>>>()?;
                build_composite(&components)?
            }
            (DataType::List(e), Value::List(values)) | (DataType::Set(e), Value::Set(values)) => {
                let elements = values
                    .iter()
                    .map(|v| e.decompose(v))
                    .collect::<Result<Vec<_>>>()?;
                build_collection(&elements, 1)?
            }
            (DataType::Map(k, v), Value::Map(entries)) => {
                let mut elements = Vec::with_capacity(entries.len() * 2);
                for (key, value) in entries {
                    elements.push(k.decompose(key)?);
                    elements.push(v.decompose(value)?);
                }
                build_collection(&elements, 2)?
            }
            (t, v) => {
                return Err(Error::marshal(format!("{:?} is not a value of {}", v, t)));
            }
        };
        Ok(bytes)
    }

    /// Parses the human-readable form of a value.
    pub fn from_string(&self, s: &str) -> Result<Bytes> {
        let bytes = match self {
            DataType::Bytes | DataType::ColumnToCollection(_) => from_hex(s)
                .map(Bytes::from)
                .ok_or_else(|| Error::marshal(format!("cannot parse '{}' as hex bytes", s)))?,
            DataType::Ascii | DataType::Utf8 => {
                let b = Bytes::copy_from_slice(s.as_bytes());
                self.validate(&b)?;
                b
            }
            _ if s.is_empty() => Bytes::new(),
            DataType::Boolean => match s.to_ascii_lowercase().as_str() {
                "true" => Bytes::from_static(&[1]),
                "false" => Bytes::from_static(&[0]),
                _ => return Err(Error::marshal(format!("unable to make boolean from '{}'", s))),
            },
            DataType::Int32 => self.decompose(&Value::Int(parse_number(s)?))?,
            DataType::Long => self.decompose(&Value::Long(parse_number(s)?))?,
            DataType::Float => self.decompose(&Value::Float(parse_number(s)?))?,
            DataType::Double => self.decompose(&Value::Double(parse_number(s)?))?,
            DataType::Reversed(t) => t.from_string(s)?,
            DataType::Composite(types) => {
                let parts = split_escaped(s);
                if parts.len() > types.len() {
                    return Err(Error::marshal(format!(
                        "'{}' has more components than {}",
                        s, self
                    )));
                }
                let components = types
                    .iter()
                    .zip(parts.iter())
                    .map(|(t, part)| t.from_string(part))
                    .collect::<Result<Vec<_>>>()?;
                build_composite(&components)?
            }
            DataType::List(_) | DataType::Set(_) | DataType::Map(_, _) => {
                return Err(Error::Unsupported("parsing collection literals"));
            }
        };
        Ok(bytes)
    }

    /// Renders `bytes` for humans. Inverse of `from_string`.
    pub fn get_string(&self, bytes: &[u8]) -> Result<String> {
        let s = match self {
            DataType::Bytes
            | DataType::ColumnToCollection(_)
            | DataType::List(_)
            | DataType::Set(_)
            | DataType::Map(_, _) => to_hex(bytes),
            DataType::Reversed(t) => t.get_string(bytes)?,
            DataType::Composite(types) => {
                let components = split_composite(bytes)
                    .ok_or_else(|| Error::marshal("malformed composite value"))?;
                let mut out = String::new();
                for (i, (c, _)) in components.iter().enumerate() {
                    if i > 0 {
                        out.push(':');
                    }
                    let t = types.get(i).unwrap_or(&BYTES);
                    out.push_str(&escape_component(&t.get_string(c)?));
                }
                out
            }
            t => match t.compose(bytes)? {
                Value::Empty => String::new(),
                v => v.to_string(),
            },
        };
        Ok(s)
    }

    /// Whether data written and ordered under `previous` stays valid and in
    /// order once this type replaces it.
    pub fn is_compatible_with(&self, previous: &DataType) -> bool {
        if self == previous {
            return true;
        }
        match (self, previous) {
            (DataType::Bytes, DataType::Ascii | DataType::Utf8) => true,
            (DataType::Utf8, DataType::Ascii) => true,
            (DataType::Reversed(a), DataType::Reversed(b)) => a.is_compatible_with(b),
            (DataType::Composite(new), DataType::Composite(old)) => {
                new.len() >= old.len()
                    && new.iter().zip(old.iter()).all(|(n, o)| n.is_compatible_with(o))
            }
            (DataType::ColumnToCollection(new), DataType::ColumnToCollection(old)) => {
                old.iter().all(|(name, o)| match new.get(name) {
                    Some(n) => n.is_compatible_with(o),
                    None => false,
                })
            }
            (DataType::List(a), DataType::List(b)) => a.is_value_compatible_with(b),
            (DataType::Set(a), DataType::Set(b)) => a.is_compatible_with(b),
            (DataType::Map(ka, va), DataType::Map(kb, vb)) => {
                ka.is_compatible_with(kb) && va.is_value_compatible_with(vb)
            }
            _ => false,
        }
    }

    /// Weaker than `is_compatible_with`: only requires that values written
    /// under `previous` can still be read, ordering aside.
    pub fn is_value_compatible_with(&self, previous: &DataType) -> bool {
        let (this, previous) = (self.base(), previous.base());
        if this.is_compatible_with(previous) {
            return true;
        }
        matches!(this, DataType::Bytes) && !previous.is_collection()
    }
}

fn fixed<const N: usize>(b: &[u8]) -> Option<[u8; N]> {
    b.try_into().ok()
}

fn expect_fixed<const N: usize>(b: &[u8]) -> Result<[u8; N]> {
    fixed(b).ok_or_else(|| Error::marshal(format!("expected {} bytes, got {}", N, b.len())))
}

fn check_width(t: &DataType, bytes: &[u8], width: usize) -> Result<()> {
    if bytes.is_empty() || bytes.len() == width {
        Ok(())
    } else {
        Err(Error::marshal(format!(
            "expected {} or 0 byte {} ({})",
            width,
            t,
            bytes.len()
        )))
    }
}

fn parse_number<T: FromStr>(s: &str) -> Result<T> {
    s.trim()
        .parse()
        .map_err(|_| Error::marshal(format!("unable to make number from '{}'", s)))
}

fn compose_all(e: &DataType, bytes: &[u8]) -> Result<Vec<Value>> {
    split_collection(bytes, 1)
        .ok_or_else(|| Error::marshal("malformed collection"))?
        .iter()
        .map(|x| e.compose(x))
        .collect()
}

/// Splits a serialized composite into its components and their
/// end-of-component bytes. `None` when the layout is malformed.
pub(crate) fn split_composite(bytes: &[u8]) -> Option<Vec<(&[u8], i8)>> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if rest.len() < 2 + len + 1 {
            return None;
        }
        out.push((&rest[2..2 + len], rest[2 + len] as i8));
        rest = &rest[3 + len..];
    }
    Some(out)
}

pub(crate) fn build_composite(components: &[Bytes]) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for c in components {
        let len = u16::try_from(c.len())
            .map_err(|_| Error::marshal("composite component longer than 65535 bytes"))?;
        out.put_u16(len);
        out.put_slice(c);
        out.put_u8(0);
    }
    Ok(out.freeze())
}

fn compare_composite(types: &[DataType], a: &[u8], b: &[u8]) -> Ordering {
    let (xs, ys) = match (split_composite(a), split_composite(b)) {
        (Some(xs), Some(ys)) => (xs, ys),
        _ => return a.cmp(b),
    };
    for (i, ((x, eoc_x), (y, eoc_y))) in xs.iter().zip(ys.iter()).enumerate() {
        let c = types.get(i).unwrap_or(&BYTES).compare(x, y);
        if c != Ordering::Equal {
            return c;
        }
        if eoc_x != eoc_y {
            return eoc_x.cmp(eoc_y);
        }
    }
    xs.len().cmp(&ys.len())
}

// Collections are a u16 count of entries followed by u16-length elements,
// `arity` elements per entry (two for maps).
fn split_collection(bytes: &[u8], arity: usize) -> Option<Vec<&[u8]>> {
    if bytes.len() < 2 {
        return None;
    }
    let n = u16::from_be_bytes([bytes[0], bytes[1]]) as usize * arity;
    let mut rest = &bytes[2..];
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        if rest.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if rest.len() < 2 + len {
            return None;
        }
        out.push(&rest[2..2 + len]);
        rest = &rest[2 + len..];
    }
    if rest.is_empty() {
        Some(out)
    } else {
        None
    }
}

fn build_collection(elements: &[Bytes], arity: usize) -> Result<Bytes> {
    let mut out = BytesMut::new();
    let n = u16::try_from(elements.len() / arity)
        .map_err(|_| Error::marshal("collection with more than 65535 elements"))?;
    out.put_u16(n);
    for e in elements {
        let len = u16::try_from(e.len())
            .map_err(|_| Error::marshal("collection element longer than 65535 bytes"))?;
        out.put_u16(len);
        out.put_slice(e);
    }
    Ok(out.freeze())
}

// A ':' inside a component is written as '\:'. A component ending in '\' or
// '!' gets a trailing '!', so that its last character can never escape the
// separator after it.
fn escape_component(s: &str) -> String {
    let mut out = s.replace(':', "\\:");
    if out.ends_with('\\') || out.ends_with('!') {
        out.push('!');
    }
    out
}

fn unescape_component(s: &str) -> String {
    s.strip_suffix('!').unwrap_or(s).replace("\\:", ":")
}

// Splits on every ':' not preceded by '\'.
fn split_escaped(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev = None;
    for (i, c) in s.char_indices() {
        if c == ':' && prev != Some('\\') {
            parts.push(unescape_component(&s[start..i]));
            start = i + 1;
        }
        prev = Some(c);
    }
    parts.push(unescape_component(&s[start..]));
    parts
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bytes => write!(f, "BytesType"),
            DataType::Ascii => write!(f, "AsciiType"),
            DataType::Utf8 => write!(f, "UTF8Type"),
            DataType::Boolean => write!(f, "BooleanType"),
            DataType::Int32 => write!(f, "Int32Type"),
            DataType::Long => write!(f, "LongType"),
            DataType::Float => write!(f, "FloatType"),
            DataType::Double => write!(f, "DoubleType"),
            DataType::Reversed(t) => write!(f, "ReversedType({})", t),
            DataType::Composite(types) => {
                write!(f, "CompositeType(")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            DataType::List(t) => write!(f, "ListType({})", t),
            DataType::Set(t) => write!(f, "SetType({})", t),
            DataType::Map(k, v) => write!(f, "MapType({},{})", k, v),
            DataType::ColumnToCollection(columns) => {
                write!(f, "ColumnToCollectionType(")?;
                for (i, (name, t)) in columns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", to_hex(name), t)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parser::parse(s)
    }
}

impl TryFrom<String> for DataType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DataType> for String {
    fn from(t: DataType) -> String {
        t.to_string()
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use bytes::Bytes;

    use super::{DataType, Value};
    use crate::error::Error;

    fn all_types() -> Vec<(DataType, Vec<Value>)> {
        vec![
            (
                DataType::Bytes,
                vec![Value::Blob(Bytes::from_static(b"\x00\x01")), Value::Blob(Bytes::from_static(b"\xff"))],
            ),
            (DataType::Ascii, vec![Value::Text("abc".into()), Value::Text("b".into())]),
            (DataType::Utf8, vec![Value::Text("héllo".into()), Value::Text("a:b".into())]),
            (DataType::Boolean, vec![Value::Boolean(false), Value::Boolean(true)]),
            (DataType::Int32, vec![Value::Int(-5), Value::Int(0), Value::Int(i32::MAX)]),
            (DataType::Long, vec![Value::Long(i64::MIN), Value::Long(42)]),
            (DataType::Float, vec![Value::Float(-1.5), Value::Float(0.1), Value::Float(f32::INFINITY)]),
            (DataType::Double, vec![Value::Double(-0.25), Value::Double(1e300)]),
            (
                DataType::Composite(vec![DataType::Int32, DataType::Utf8]),
                vec![
                    Value::Composite(vec![Value::Int(1), Value::Text("x:y".into())]),
                    Value::Composite(vec![Value::Int(-2)]),
                ],
            ),
            (
                DataType::Composite(vec![DataType::Utf8, DataType::Utf8]),
                vec![
                    Value::Composite(vec![Value::Text("a\\".into()), Value::Text("b".into())]),
                    Value::Composite(vec![Value::Text("x!".into()), Value::Text("!\\:".into())]),
                    Value::Composite(vec![Value::Text("a\\:b".into()), Value::Text("c:".into())]),
                ],
            ),
        ]
    }

    #[test]
    fn test_sentinel_law() {
        for (t, values) in all_types() {
            for r in [t.clone(), t.clone().reversed()] {
                assert_eq!(r.compare(b"", b""), Ordering::Equal, "{}", r);
                for v in &values {
                    let b = t.decompose(v).unwrap();
                    assert_eq!(r.compare(b"", &b), Ordering::Less, "{} {:?}", r, v);
                    assert_eq!(r.compare(&b, b""), Ordering::Greater, "{} {:?}", r, v);
                }
            }
        }
    }

    #[test]
    fn test_reversed_law() {
        for (t, values) in all_types() {
            let r = t.clone().reversed();
            for a in &values {
                for b in &values {
                    let (a, b) = (t.decompose(a).unwrap(), t.decompose(b).unwrap());
                    assert_eq!(r.compare(&a, &b), t.compare(&a, &b).reverse());
                }
            }
        }
    }

    #[test]
    fn test_string_round_trip() {
        for (t, values) in all_types() {
            for v in &values {
                let bytes = t.decompose(v).unwrap();
                let composed = t.compose(&bytes).unwrap();
                let s = t.get_string(&t.decompose(&composed).unwrap()).unwrap();
                let parsed = t.from_string(&s).unwrap();
                assert_eq!(t.compare(&parsed, &bytes), Ordering::Equal, "{} {:?} {}", t, v, s);
            }
        }
    }

    #[test]
    fn test_numeric_order() {
        let t = DataType::Int32;
        let a = t.decompose(&Value::Int(-1)).unwrap();
        let b = t.decompose(&Value::Int(1)).unwrap();
        // Two's complement bytes would sort -1 after 1.
        assert!(a > b);
        assert_eq!(t.compare(&a, &b), Ordering::Less);

        let t = DataType::Double;
        let a = t.decompose(&Value::Double(-2.0)).unwrap();
        let b = t.decompose(&Value::Double(-1.0)).unwrap();
        assert_eq!(t.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_validate() {
        assert!(matches!(DataType::Int32.validate(&[1, 2, 3]), Err(Error::Marshal(_))));
        assert!(DataType::Int32.validate(&[]).is_ok());
        assert!(matches!(DataType::Utf8.validate(&[0xc3]), Err(Error::Marshal(_))));
        assert!(matches!(DataType::Ascii.validate("é".as_bytes()), Err(Error::Marshal(_))));
        assert!(matches!(DataType::Long.from_string("twelve"), Err(Error::Marshal(_))));
        assert!(matches!(DataType::Bytes.from_string("xyz"), Err(Error::Marshal(_))));
        assert!(matches!(
            DataType::Boolean.from_string("maybe"),
            Err(Error::Marshal(_))
        ));

        let composite = DataType::Composite(vec![DataType::Int32]);
        let two = super::build_composite(&[Bytes::from_static(&[0, 0, 0, 1]), Bytes::from_static(b"x")]).unwrap();
        assert!(matches!(composite.validate(&two), Err(Error::Marshal(_))));
        assert!(matches!(composite.validate(&[0, 5, 1]), Err(Error::Marshal(_))));
    }

    #[test]
    fn test_collections() {
        let t = DataType::Map(Box::new(DataType::Utf8), Box::new(DataType::Int32));
        let v = Value::Map(vec![
            (Value::Text("a".into()), Value::Int(1)),
            (Value::Text("b".into()), Value::Int(2)),
        ]);
        let bytes = t.decompose(&v).unwrap();
        assert_eq!(t.compose(&bytes).unwrap(), v);
        assert_eq!(t.name_comparator().unwrap(), &DataType::Utf8);
        assert!(matches!(
            t.from_string("{a: 1}"),
            Err(Error::Unsupported(_))
        ));

        let l = DataType::List(Box::new(DataType::Int32));
        let short = l.decompose(&Value::List(vec![Value::Int(1)])).unwrap();
        let long = l
            .decompose(&Value::List(vec![Value::Int(1), Value::Int(0)]))
            .unwrap();
        assert_eq!(l.compare(&short, &long), Ordering::Less);
    }

    #[test]
    fn test_compatibility() {
        assert!(DataType::Bytes.is_compatible_with(&DataType::Utf8));
        assert!(DataType::Utf8.is_compatible_with(&DataType::Ascii));
        assert!(!DataType::Ascii.is_compatible_with(&DataType::Utf8));
        assert!(!DataType::Int32.is_compatible_with(&DataType::Long));
        for (t, _) in all_types() {
            assert!(t.is_compatible_with(&t));
        }

        let old = DataType::Composite(vec![DataType::Int32, DataType::Ascii]);
        let new = DataType::Composite(vec![DataType::Int32, DataType::Utf8, DataType::Utf8]);
        assert!(new.is_compatible_with(&old));
        assert!(!old.is_compatible_with(&new));

        assert!(DataType::Bytes.is_value_compatible_with(&DataType::Int32));
        assert!(!DataType::Bytes.is_compatible_with(&DataType::Int32));
        assert!(!DataType::Bytes.is_value_compatible_with(&DataType::List(Box::new(DataType::Int32))));
    }

    #[test]
    fn test_type_names() {
        for name in [
            "UTF8Type",
            "ReversedType(Int32Type)",
            "CompositeType(Int32Type,ReversedType(LongType),UTF8Type)",
            "MapType(UTF8Type,DoubleType)",
            "CompositeType(UTF8Type,ColumnToCollectionType(6c:ListType(Int32Type),73:SetType(AsciiType)))",
        ] {
            let t: DataType = name.parse().unwrap();
            assert_eq!(t.to_string(), name);
        }
        let t: DataType = "org.apache.cassandra.db.marshal.CompositeType(org.apache.cassandra.db.marshal.Int32Type, BytesType)"
            .parse()
            .unwrap();
        assert_eq!(t, DataType::Composite(vec![DataType::Int32, DataType::Bytes]));

        for bad in ["", "NopeType", "ListType(", "CompositeType(Int32Type,)", "UTF8Type junk"] {
            assert!(
                matches!(bad.parse::<DataType>(), Err(Error::Configuration(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_serde() {
        let t = DataType::Composite(vec![DataType::Long, DataType::Utf8]);
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"CompositeType(LongType,UTF8Type)\"");
        assert_eq!(serde_json::from_str::<DataType>(&json).unwrap(), t);
    }
}
