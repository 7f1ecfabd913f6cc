// Binary primitives shared by every on-disk structure in the crate.
//
// Everything is big-endian so that files stay byte-compatible with other
// implementations reading the same segments. Lengths come in two flavours: a
// "short length" (u16) used for keys and cell names, and a plain i32 length
// used for values.

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::error::{Error, Result};

fn eof_to_decoding(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::decoding("unexpected end of input")
    } else {
        Error::Io(e)
    }
}

pub trait DataInput: Read {
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).map_err(eof_to_decoding)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0_u8; 1];
        self.read_fully(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0_u8; 2];
        self.read_fully(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0_u8; 4];
        self.read_fully(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0_u8; 8];
        self.read_fully(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        let mut buf = vec![0_u8; n];
        self.read_fully(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn read_with_short_length(&mut self) -> Result<Bytes> {
        let len = self.read_u16()?;
        self.read_bytes(len as usize)
    }

    fn read_with_length(&mut self) -> Result<Bytes> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::decoding(format!("negative length {}", len)));
        }
        self.read_bytes(len as usize)
    }

    fn skip_bytes_fully(&mut self, n: u64) -> Result<()> {
        let skipped = io::copy(&mut (&mut *self).take(n), &mut io::sink())?;
        if skipped < n {
            return Err(Error::decoding(format!(
                "unexpected end of input skipping {} bytes ({} available)",
                n, skipped
            )));
        }
        Ok(())
    }
}

impl<R: Read + ?Sized> DataInput for R {}

pub trait DataOutput: Write {
    fn write_byte(&mut self, b: u8) -> Result<()> {
        self.write_all(&[b])?;
        Ok(())
    }

    fn write_bool(&mut self, b: bool) -> Result<()> {
        self.write_byte(b as u8)
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_with_short_length(&mut self, buf: &[u8]) -> Result<()> {
        let len = u16::try_from(buf.len()).map_err(|_| {
            Error::marshal(format!("{} bytes do not fit a short length", buf.len()))
        })?;
        self.write_u16(len)?;
        self.write_all(buf)?;
        Ok(())
    }

    fn write_with_length(&mut self, buf: &[u8]) -> Result<()> {
        let len = i32::try_from(buf.len())
            .map_err(|_| Error::marshal(format!("{} bytes do not fit a length", buf.len())))?;
        self.write_i32(len)?;
        self.write_all(buf)?;
        Ok(())
    }
}

impl<W: Write + ?Sized> DataOutput for W {}

pub const SHORT_LENGTH_SIZE: usize = 2;
pub const INT_SIZE: usize = 4;
pub const LONG_SIZE: usize = 8;

/// Serialized width of `len` bytes written with a short length prefix.
pub fn short_length_size(len: usize) -> usize {
    SHORT_LENGTH_SIZE + len
}

/// Context-free binary encoding. Types whose layout depends on a comparator
/// (cell names, filters, index entries) have dedicated serializers instead.
pub trait Encode {
    fn encode<W: Write + ?Sized>(&self, out: &mut W) -> Result<()>;
    fn serialized_size(&self) -> usize;
}

pub trait Decode: Sized {
    fn decode<R: Read + ?Sized>(input: &mut R) -> Result<Self>;
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

pub(crate) fn from_hex(s: &str) -> Option<Vec<u8>> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
    let s = s.strip_prefix("0x").unwrap_or(s).as_bytes();
    if s.len() % 2 != 0 {
        return None;
    }
    s.chunks(2)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}
