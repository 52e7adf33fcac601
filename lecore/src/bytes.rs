//! Encoding and decoding of over-the-air structures.
//!
//! Every PDU and PDU payload implements [`ToBytes`] and [`FromBytes`], which work on the cursor
//! types [`ByteWriter`] and [`ByteReader`]. All multi-octet fields in the link layer are
//! transmitted least significant octet first, so only little-endian helpers exist.
//!
//! [`ToBytes`]: trait.ToBytes.html
//! [`FromBytes`]: trait.FromBytes.html
//! [`ByteWriter`]: struct.ByteWriter.html
//! [`ByteReader`]: struct.ByteReader.html

use {
    crate::Error,
    byteorder::{ByteOrder, LittleEndian},
};

/// Cursor writing into a fixed byte buffer.
///
/// All `write_*` methods return `Error::Eof` without writing anything when the remaining space is
/// too small for the value.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    /// Creates a writer that will write to `buf`, starting at its first byte.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the number of bytes that can still be written.
    pub fn space_left(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns the bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8], Error> {
        if self.space_left() < len {
            return Err(Error::Eof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&mut self.buf[start..start + len])
    }

    /// Writes all of `other` to `self`.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        self.reserve(other.len())?.copy_from_slice(other);
        Ok(())
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.reserve(1)?[0] = byte;
        Ok(())
    }

    pub fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        LittleEndian::write_u16(self.reserve(2)?, value);
        Ok(())
    }

    /// Writes the lower 24 bits of `value` (eg. a CRC initialization value).
    pub fn write_u24_le(&mut self, value: u32) -> Result<(), Error> {
        LittleEndian::write_u24(self.reserve(3)?, value & 0xFF_FFFF);
        Ok(())
    }

    pub fn write_u32_le(&mut self, value: u32) -> Result<(), Error> {
        LittleEndian::write_u32(self.reserve(4)?, value);
        Ok(())
    }

    pub fn write_u64_le(&mut self, value: u64) -> Result<(), Error> {
        LittleEndian::write_u64(self.reserve(8)?, value);
        Ok(())
    }
}

/// Cursor reading from a byte slice.
#[derive(Copy, Clone)]
pub struct ByteReader<'a>(&'a [u8]);

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader(bytes)
    }

    /// Returns the number of bytes that can still be read.
    pub fn bytes_left(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.read_slice(len).map(|_| ())
    }

    /// Reads a slice of `len` bytes, borrowing from the underlying buffer.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.0.len() < len {
            return Err(Error::Eof);
        }
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    /// Reads a fixed-size byte array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut arr = [0; N];
        arr.copy_from_slice(self.read_slice(N)?);
        Ok(arr)
    }

    /// Reads all remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.0;
        self.0 = &[];
        rest
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_slice(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        Ok(LittleEndian::read_u16(self.read_slice(2)?))
    }

    /// Reads a 24-bit value into the low bits of a `u32`.
    pub fn read_u24_le(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u24(self.read_slice(3)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u32(self.read_slice(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, Error> {
        Ok(LittleEndian::read_u64(self.read_slice(8)?))
    }

    /// Fails with `Error::IncompleteParse` if any bytes are left over.
    pub fn finish(&self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::IncompleteParse)
        }
    }
}

/// Trait for encoding a value into a byte buffer.
pub trait ToBytes {
    /// Converts `self` to bytes and writes them into `writer`, advancing `writer` to point past the
    /// encoded value.
    ///
    /// If `writer` does not contain enough space, an error is returned and the contents of the
    /// buffer are unspecified.
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error>;
}

/// Trait for decoding values from a byte slice.
pub trait FromBytes<'a>: Sized {
    /// Decodes a `Self` from a byte slice, advancing `bytes` to point past the data that was read.
    ///
    /// If `bytes` contains data not valid for the target type, or contains an insufficient number
    /// of bytes, an error will be returned and the state of `bytes` is unspecified.
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error>;
}

impl ToBytes for [u8] {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(self)
    }
}

impl<'a> FromBytes<'a> for u8 {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        bytes.read_u8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_refuses_partial_writes() {
        let mut buf = [0; 3];
        let mut w = ByteWriter::new(&mut buf);
        w.write_u16_le(0x1234).unwrap();
        assert_eq!(w.write_u16_le(0xffff), Err(Error::Eof));
        assert_eq!(w.position(), 2);
        w.write_u8(0xab).unwrap();
        assert_eq!(w.space_left(), 0);
        assert_eq!(buf, [0x34, 0x12, 0xab]);
    }

    #[test]
    fn reader_little_endian() {
        let data = [0x01, 0x02, 0x03, 0xd6, 0xbe, 0x89, 0x8e, 0xff];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_u24_le().unwrap(), 0x030201);
        assert_eq!(r.read_u32_le().unwrap(), 0x8e89bed6);
        assert_eq!(r.finish(), Err(Error::IncompleteParse));
        assert_eq!(r.read_array::<2>(), Err(Error::Eof));
        assert_eq!(r.read_u8().unwrap(), 0xff);
        assert!(r.finish().is_ok());
    }
}
