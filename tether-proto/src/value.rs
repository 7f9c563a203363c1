//! MessagePack subset codec.
//!
//! The writer always picks the shortest legal encoding for integers and
//! lengths (positive fixint before uint8 before uint16, and so on); the
//! reader accepts every legal width for an expected value, since a peer is
//! free to over-encode. Supported types: nil, bool, unsigned int, str,
//! bin, map, array. Anything else is a malformed value.

use crate::{Error, Result};

// Format markers for the supported subset.
const FIXMAP: u8 = 0x80;
const FIXARRAY: u8 = 0x90;
const FIXSTR: u8 = 0xa0;
const NIL: u8 = 0xc0;
const FALSE: u8 = 0xc2;
const TRUE: u8 = 0xc3;
const BIN8: u8 = 0xc4;
const BIN16: u8 = 0xc5;
const BIN32: u8 = 0xc6;
const UINT8: u8 = 0xcc;
const UINT16: u8 = 0xcd;
const UINT32: u8 = 0xce;
const UINT64: u8 = 0xcf;
const STR8: u8 = 0xd9;
const STR16: u8 = 0xda;
const STR32: u8 = 0xdb;
const ARRAY16: u8 = 0xdc;
const ARRAY32: u8 = 0xdd;
const MAP16: u8 = 0xde;
const MAP32: u8 = 0xdf;

/// Growable buffer that encodes values in wire order.
///
/// Maps and arrays are written header-then-elements; the writer does not
/// verify that the caller emits the declared count.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with preallocated capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Consumes the writer and returns the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Returns the bytes encoded so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Appends pre-encoded MessagePack bytes verbatim.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes nil.
    pub fn put_nil(&mut self) {
        self.buf.push(NIL);
    }

    /// Writes a boolean.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(if v { TRUE } else { FALSE });
    }

    /// Writes an unsigned integer in its minimum-width encoding.
    pub fn put_uint(&mut self, v: u64) {
        if v <= 0x7f {
            self.buf.push(v as u8);
        } else if v <= 0xff {
            self.buf.push(UINT8);
            self.buf.push(v as u8);
        } else if v <= 0xffff {
            self.buf.push(UINT16);
            self.buf.extend_from_slice(&(v as u16).to_be_bytes());
        } else if v <= 0xffff_ffff {
            self.buf.push(UINT32);
            self.buf.extend_from_slice(&(v as u32).to_be_bytes());
        } else {
            self.buf.push(UINT64);
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    /// Writes a UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        let len = s.len();
        if len <= 31 {
            self.buf.push(FIXSTR | len as u8);
        } else if len <= 0xff {
            self.buf.push(STR8);
            self.buf.push(len as u8);
        } else if len <= 0xffff {
            self.buf.push(STR16);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buf.push(STR32);
            self.buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Writes a binary blob.
    pub fn put_bin(&mut self, b: &[u8]) {
        let len = b.len();
        if len <= 0xff {
            self.buf.push(BIN8);
            self.buf.push(len as u8);
        } else if len <= 0xffff {
            self.buf.push(BIN16);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buf.push(BIN32);
            self.buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.buf.extend_from_slice(b);
    }

    /// Writes a map header for `count` key-value pairs.
    pub fn put_map(&mut self, count: usize) {
        if count <= 15 {
            self.buf.push(FIXMAP | count as u8);
        } else if count <= 0xffff {
            self.buf.push(MAP16);
            self.buf.extend_from_slice(&(count as u16).to_be_bytes());
        } else {
            self.buf.push(MAP32);
            self.buf.extend_from_slice(&(count as u32).to_be_bytes());
        }
    }

    /// Writes an array header for `count` elements.
    pub fn put_array(&mut self, count: usize) {
        if count <= 15 {
            self.buf.push(FIXARRAY | count as u8);
        } else if count <= 0xffff {
            self.buf.push(ARRAY16);
            self.buf.extend_from_slice(&(count as u16).to_be_bytes());
        } else {
            self.buf.push(ARRAY32);
            self.buf.extend_from_slice(&(count as u32).to_be_bytes());
        }
    }
}

/// Position-based reader over an encoded buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// True once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(Error::MalformedValue("length overflow"))?;
        if end > self.buf.len() {
            return Err(Error::MalformedValue("unexpected end of input"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64be(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads an unsigned integer of any width.
    pub fn read_uint(&mut self) -> Result<u64> {
        let tag = self.u8()?;
        match tag {
            0x00..=0x7f => Ok(u64::from(tag)),
            UINT8 => Ok(u64::from(self.u8()?)),
            UINT16 => Ok(u64::from(self.u16be()?)),
            UINT32 => Ok(u64::from(self.u32be()?)),
            UINT64 => self.u64be(),
            _ => Err(Error::MalformedValue("expected unsigned integer")),
        }
    }

    /// Reads a boolean.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.u8()? {
            TRUE => Ok(true),
            FALSE => Ok(false),
            _ => Err(Error::MalformedValue("expected boolean")),
        }
    }

    /// Reads a string of any width, borrowed from the buffer.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let tag = self.u8()?;
        let len = match tag {
            _ if tag & 0xe0 == FIXSTR => usize::from(tag & 0x1f),
            STR8 => usize::from(self.u8()?),
            STR16 => usize::from(self.u16be()?),
            STR32 => self.u32be()? as usize,
            _ => return Err(Error::MalformedValue("expected string")),
        };
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::MalformedValue("invalid utf-8 in string"))
    }

    /// Reads a binary blob of any width, borrowed from the buffer.
    pub fn read_bin(&mut self) -> Result<&'a [u8]> {
        let tag = self.u8()?;
        let len = match tag {
            BIN8 => usize::from(self.u8()?),
            BIN16 => usize::from(self.u16be()?),
            BIN32 => self.u32be()? as usize,
            _ => return Err(Error::MalformedValue("expected binary")),
        };
        self.take(len)
    }

    /// Reads a map header, returning the number of key-value pairs.
    pub fn read_map_header(&mut self) -> Result<usize> {
        let tag = self.u8()?;
        match tag {
            _ if tag & 0xf0 == FIXMAP => Ok(usize::from(tag & 0x0f)),
            MAP16 => Ok(usize::from(self.u16be()?)),
            MAP32 => Ok(self.u32be()? as usize),
            _ => Err(Error::MalformedValue("expected map")),
        }
    }

    /// Reads an array header, returning the element count.
    pub fn read_array_header(&mut self) -> Result<usize> {
        let tag = self.u8()?;
        match tag {
            _ if tag & 0xf0 == FIXARRAY => Ok(usize::from(tag & 0x0f)),
            ARRAY16 => Ok(usize::from(self.u16be()?)),
            ARRAY32 => Ok(self.u32be()? as usize),
            _ => Err(Error::MalformedValue("expected array")),
        }
    }

    /// Advances past exactly one well-formed value of any supported type.
    ///
    /// Used to tolerate unknown keys without understanding their values.
    pub fn skip_value(&mut self) -> Result<()> {
        let tag = self.u8()?;
        match tag {
            0x00..=0x7f | NIL | FALSE | TRUE => Ok(()),
            _ if tag & 0xe0 == FIXSTR => {
                self.take(usize::from(tag & 0x1f))?;
                Ok(())
            }
            _ if tag & 0xf0 == FIXMAP => self.skip_pairs(usize::from(tag & 0x0f)),
            _ if tag & 0xf0 == FIXARRAY => self.skip_values(usize::from(tag & 0x0f)),
            UINT8 => self.take(1).map(|_| ()),
            UINT16 => self.take(2).map(|_| ()),
            UINT32 => self.take(4).map(|_| ()),
            UINT64 => self.take(8).map(|_| ()),
            STR8 | BIN8 => {
                let len = usize::from(self.u8()?);
                self.take(len).map(|_| ())
            }
            STR16 | BIN16 => {
                let len = usize::from(self.u16be()?);
                self.take(len).map(|_| ())
            }
            STR32 | BIN32 => {
                let len = self.u32be()? as usize;
                self.take(len).map(|_| ())
            }
            ARRAY16 => {
                let count = usize::from(self.u16be()?);
                self.skip_values(count)
            }
            ARRAY32 => {
                let count = self.u32be()? as usize;
                self.skip_values(count)
            }
            MAP16 => {
                let count = usize::from(self.u16be()?);
                self.skip_pairs(count)
            }
            MAP32 => {
                let count = self.u32be()? as usize;
                self.skip_pairs(count)
            }
            _ => Err(Error::MalformedValue("unsupported type tag")),
        }
    }

    fn skip_values(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.skip_value()?;
        }
        Ok(())
    }

    fn skip_pairs(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.skip_value()?;
            self.skip_value()?;
        }
        Ok(())
    }

    /// Returns the raw bytes spanning exactly one value, advancing past it.
    pub fn value_bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        self.skip_value()?;
        Ok(&self.buf[start..self.pos])
    }
}

/// Looks up a string value by key in an encoded map.
///
/// A present key with a non-string value counts as absent; other entries
/// are skipped whatever their type.
pub fn map_get_str(raw: &[u8], key: &str) -> Result<Option<String>> {
    map_get(raw, key, |r: &mut Reader<'_>| Ok(r.read_str()?.to_owned()))
}

/// Looks up an unsigned integer value by key in an encoded map.
pub fn map_get_uint(raw: &[u8], key: &str) -> Result<Option<u64>> {
    map_get(raw, key, |r: &mut Reader<'_>| r.read_uint())
}

/// Looks up a binary value by key in an encoded map.
pub fn map_get_bin(raw: &[u8], key: &str) -> Result<Option<Vec<u8>>> {
    map_get(raw, key, |r: &mut Reader<'_>| Ok(r.read_bin()?.to_vec()))
}

/// Looks up a boolean value by key in an encoded map.
pub fn map_get_bool(raw: &[u8], key: &str) -> Result<Option<bool>> {
    map_get(raw, key, |r: &mut Reader<'_>| r.read_bool())
}

fn map_get<T>(
    raw: &[u8],
    key: &str,
    read: impl Fn(&mut Reader<'_>) -> Result<T>,
) -> Result<Option<T>> {
    let mut r = Reader::new(raw);
    let count = r.read_map_header()?;
    for _ in 0..count {
        let k = r.read_str()?;
        if k == key {
            // A wrong-typed value for the wanted key is treated as absent.
            let mut probe = Reader {
                buf: r.buf,
                pos: r.pos,
            };
            match read(&mut probe) {
                Ok(v) => return Ok(Some(v)),
                Err(_) => {
                    r.skip_value()?;
                    continue;
                }
            }
        }
        r.skip_value()?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_minimum_width_at_boundaries() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0xcc, 0x80]),
            (255, &[0xcc, 0xff]),
            (256, &[0xcd, 0x01, 0x00]),
            (65535, &[0xcd, 0xff, 0xff]),
            (65536, &[0xce, 0x00, 0x01, 0x00, 0x00]),
            (u64::from(u32::MAX), &[0xce, 0xff, 0xff, 0xff, 0xff]),
            (
                u64::from(u32::MAX) + 1,
                &[0xcf, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
            ),
        ];
        for (v, expected) in cases {
            let mut w = Writer::new();
            w.put_uint(*v);
            assert_eq!(w.as_bytes(), *expected, "encoding of {v}");

            let mut r = Reader::new(w.as_bytes());
            assert_eq!(r.read_uint().unwrap(), *v);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn uint_accepts_every_wider_encoding() {
        // 5 encoded five ways; a decoder must accept all of them.
        let encodings: &[&[u8]] = &[
            &[0x05],
            &[0xcc, 0x05],
            &[0xcd, 0x00, 0x05],
            &[0xce, 0x00, 0x00, 0x00, 0x05],
            &[0xcf, 0, 0, 0, 0, 0, 0, 0, 0x05],
        ];
        for enc in encodings {
            let mut r = Reader::new(enc);
            assert_eq!(r.read_uint().unwrap(), 5);
        }
    }

    #[test]
    fn str_length_boundaries() {
        for (len, header_len) in [(0, 1), (31, 1), (32, 2), (255, 2), (256, 3), (65535, 3), (65536, 5)] {
            let s = "x".repeat(len);
            let mut w = Writer::new();
            w.put_str(&s);
            assert_eq!(w.as_bytes().len(), header_len + len, "string of {len}");

            let mut r = Reader::new(w.as_bytes());
            assert_eq!(r.read_str().unwrap(), s);
        }
    }

    #[test]
    fn bin_length_boundaries() {
        for (len, header_len) in [(0, 2), (255, 2), (256, 3), (65535, 3), (65536, 5)] {
            let b = vec![0xaa; len];
            let mut w = Writer::new();
            w.put_bin(&b);
            assert_eq!(w.as_bytes().len(), header_len + len, "bin of {len}");

            let mut r = Reader::new(w.as_bytes());
            assert_eq!(r.read_bin().unwrap(), &b[..]);
        }
    }

    #[test]
    fn map_and_array_header_boundaries() {
        for (count, map_hdr, array_hdr) in [(0, 1, 1), (15, 1, 1), (16, 3, 3), (65535, 3, 3), (65536, 5, 5)] {
            let mut w = Writer::new();
            w.put_map(count);
            assert_eq!(w.as_bytes().len(), map_hdr, "map of {count}");
            let mut r = Reader::new(w.as_bytes());
            assert_eq!(r.read_map_header().unwrap(), count);

            let mut w = Writer::new();
            w.put_array(count);
            assert_eq!(w.as_bytes().len(), array_hdr, "array of {count}");
            let mut r = Reader::new(w.as_bytes());
            assert_eq!(r.read_array_header().unwrap(), count);
        }
    }

    #[test]
    fn bool_and_nil_roundtrip() {
        let mut w = Writer::new();
        w.put_bool(true);
        w.put_bool(false);
        w.put_nil();
        assert_eq!(w.as_bytes(), &[0xc3, 0xc2, 0xc0]);

        let mut r = Reader::new(w.as_bytes());
        assert!(r.read_bool().unwrap());
        assert!(!r.read_bool().unwrap());
        r.skip_value().unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn skip_value_crosses_nested_containers() {
        let mut w = Writer::new();
        w.put_map(2);
        w.put_str("inner");
        w.put_array(3);
        w.put_uint(1);
        w.put_str("two");
        w.put_bin(&[3, 3, 3]);
        w.put_str("flag");
        w.put_bool(true);
        w.put_uint(42); // trailing value after the map

        let mut r = Reader::new(w.as_bytes());
        r.skip_value().unwrap();
        assert_eq!(r.read_uint().unwrap(), 42);
        assert!(r.is_empty());
    }

    #[test]
    fn unsupported_tag_is_malformed() {
        // 0xc1 is reserved in MessagePack; 0xd0 (int8) is outside the subset.
        for tag in [0xc1u8, 0xd0, 0xe5] {
            let bytes = [tag, 0x00];
            let mut r = Reader::new(&bytes);
            assert!(matches!(r.skip_value(), Err(Error::MalformedValue(_))));
        }
    }

    #[test]
    fn truncated_value_is_malformed() {
        // str8 declaring 10 bytes with only 2 present.
        let mut r = Reader::new(&[0xd9, 10, b'a', b'b']);
        assert!(matches!(r.read_str(), Err(Error::MalformedValue(_))));
    }

    #[test]
    fn map_get_finds_and_skips() {
        let mut w = Writer::new();
        w.put_map(4);
        w.put_str("name");
        w.put_str("busybox");
        w.put_str("size");
        w.put_uint(1024);
        w.put_str("raw");
        w.put_bin(&[1, 2, 3]);
        w.put_str("dir");
        w.put_bool(false);
        let raw = w.into_bytes();

        assert_eq!(map_get_str(&raw, "name").unwrap().as_deref(), Some("busybox"));
        assert_eq!(map_get_uint(&raw, "size").unwrap(), Some(1024));
        assert_eq!(map_get_bin(&raw, "raw").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(map_get_bool(&raw, "dir").unwrap(), Some(false));
        assert_eq!(map_get_str(&raw, "missing").unwrap(), None);
        // Present key, wrong type: treated as absent.
        assert_eq!(map_get_uint(&raw, "name").unwrap(), None);
    }

    #[test]
    fn value_bytes_spans_one_value() {
        let mut w = Writer::new();
        w.put_map(1);
        w.put_str("k");
        w.put_uint(7);
        w.put_str("after");
        let raw = w.into_bytes();

        let mut r = Reader::new(&raw);
        let map = r.value_bytes().unwrap();
        assert_eq!(map.len(), 1 + 2 + 1);
        assert_eq!(r.read_str().unwrap(), "after");
    }
}
