use std::collections::BTreeMap;

use bytes::Bytes;

use super::DataType;
use crate::{
    encoding::from_hex,
    error::{Error, Result},
};

/// Parses a type name such as `CompositeType(Int32Type,ReversedType(UTF8Type))`.
/// Fully qualified class names are accepted; everything up to the last `.` of
/// a name is ignored.
pub(super) fn parse(s: &str) -> Result<DataType> {
    let mut p = Parser { s: s.as_bytes(), idx: 0 };
    let t = p.parse_type()?;
    p.skip_blank();
    if !p.at_end() {
        return Err(p.error("unexpected trailing input"));
    }
    Ok(t)
}

struct Parser<'a> {
    s: &'a [u8],
    idx: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.idx >= self.s.len()
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.idx).copied()
    }

    fn skip_blank(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.idx += 1;
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::configuration(format!(
            "syntax error parsing '{}' at char {}: {}",
            String::from_utf8_lossy(self.s),
            self.idx,
            msg
        ))
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        self.skip_blank();
        if self.peek() == Some(c) {
            self.idx += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c as char)))
        }
    }

    fn read_name(&mut self) -> &'a str {
        self.skip_blank();
        let start = self.idx;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' || c == b'$')
        {
            self.idx += 1;
        }
        // Only ASCII was consumed.
        std::str::from_utf8(&self.s[start..self.idx]).unwrap_or_default()
    }

    fn parse_type(&mut self) -> Result<DataType> {
        let name = self.read_name();
        if name.is_empty() {
            return Err(self.error("expected a type name"));
        }
        let short = name.rsplit('.').next().unwrap_or(name);
        let t = match short {
            "BytesType" => DataType::Bytes,
            "AsciiType" => DataType::Ascii,
            "UTF8Type" => DataType::Utf8,
            "BooleanType" => DataType::Boolean,
            "Int32Type" => DataType::Int32,
            "LongType" => DataType::Long,
            "FloatType" => DataType::Float,
            "DoubleType" => DataType::Double,
            "ReversedType" => {
                let mut args = self.parse_type_args()?;
                if args.len() != 1 {
                    return Err(self.error("ReversedType takes exactly one argument"));
                }
                args.remove(0).reversed()
            }
            "CompositeType" => DataType::Composite(self.parse_type_args()?),
            "ListType" | "SetType" => {
                let mut args = self.parse_type_args()?;
                if args.len() != 1 {
                    return Err(self.error("collection types take exactly one argument"));
                }
                let e = Box::new(args.remove(0));
                if short == "ListType" {
                    DataType::List(e)
                } else {
                    DataType::Set(e)
                }
            }
            "MapType" => {
                let mut args = self.parse_type_args()?;
                if args.len() != 2 {
                    return Err(self.error("MapType takes exactly two arguments"));
                }
                let v = Box::new(args.remove(1));
                let k = Box::new(args.remove(0));
                DataType::Map(k, v)
            }
            "ColumnToCollectionType" => DataType::ColumnToCollection(self.parse_collection_args()?),
            _ => return Err(self.error(&format!("unknown type {}", short))),
        };
        Ok(t)
    }

    fn parse_type_args(&mut self) -> Result<Vec<DataType>> {
        self.expect(b'(')?;
        let mut args = Vec::new();
        loop {
            args.push(self.parse_type()?);
            self.skip_blank();
            match self.peek() {
                Some(b',') => self.idx += 1,
                Some(b')') => {
                    self.idx += 1;
                    return Ok(args);
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
    }

    fn parse_collection_args(&mut self) -> Result<BTreeMap<Bytes, DataType>> {
        self.expect(b'(')?;
        let mut columns = BTreeMap::new();
        loop {
            let hex = self.read_name();
            let name = from_hex(hex).ok_or_else(|| self.error("expected a hex column name"))?;
            self.expect(b':')?;
            let t = self.parse_type()?;
            if !t.is_collection() {
                return Err(self.error("only collection types can be mapped"));
            }
            columns.insert(Bytes::from(name), t);
            self.skip_blank();
            match self.peek() {
                Some(b',') => self.idx += 1,
                Some(b')') => {
                    self.idx += 1;
                    return Ok(columns);
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
    }
}
