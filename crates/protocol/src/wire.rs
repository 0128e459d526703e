//! Primitive wire types: little-endian integers, length-prefixed strings and
//! byte-reversed IPv4 addresses.

use std::io::{self, Write};
use std::net::Ipv4Addr;

use crate::error::Error;

/// Types that can be written into a message payload.
pub trait Encodable {
    /// Encode `self` to the writer, returning the number of bytes written.
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Types that can be read back out of a [`PayloadCursor`].
pub trait Decodable: Sized {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error>;
}

/// Serialize a value into a fresh payload buffer.
pub fn serialize<T: Encodable + ?Sized>(data: &T) -> Vec<u8> {
    let mut encoder = Vec::new();
    let len = data
        .encode(&mut encoder)
        .expect("in-memory writers don't error");
    debug_assert_eq!(len, encoder.len());
    encoder
}

/// A bounds-checked cursor over a message payload.
///
/// Every read advances the cursor; a read that would pass the end of the
/// payload fails with [`Error::FrameMalformed`] carrying the offending
/// position.
#[derive(Debug)]
pub struct PayloadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read position within the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take the next `n` bytes off the payload.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::malformed(
                self.pos,
                format!("need {n} more bytes, {} left", self.remaining()),
            ));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_f32(&mut self) -> Result<f32, Error> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a `u32`-length-prefixed string.
    pub fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let start = self.pos;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::malformed(start, "string is not valid utf-8"))
    }

    /// Read a byte-reversed (high-to-low) IPv4 address.
    pub fn read_ipv4(&mut self) -> Result<Ipv4Addr, Error> {
        let raw = self.take(4)?;
        Ok(Ipv4Addr::new(raw[3], raw[2], raw[1], raw[0]))
    }
}

impl Encodable for u8 {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(&[*self])?;
        Ok(1)
    }
}

impl Encodable for u32 {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(&self.to_le_bytes())?;
        Ok(4)
    }
}

impl Encodable for u64 {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(&self.to_le_bytes())?;
        Ok(8)
    }
}

impl Encodable for f32 {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(&self.to_le_bytes())?;
        Ok(4)
    }
}

impl Encodable for bool {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        u8::from(*self).encode(writer)
    }
}

impl Encodable for str {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (self.len() as u32).encode(writer)?;
        writer.write_all(self.as_bytes())?;
        Ok(4 + self.len())
    }
}

impl Encodable for String {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(writer)
    }
}

impl Encodable for Ipv4Addr {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let octets = self.octets();
        writer.write_all(&[octets[3], octets[2], octets[1], octets[0]])?;
        Ok(4)
    }
}

impl Decodable for u8 {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        reader.read_u8()
    }
}

impl Decodable for u32 {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        reader.read_u32()
    }
}

impl Decodable for u64 {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        reader.read_u64()
    }
}

impl Decodable for f32 {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        reader.read_f32()
    }
}

impl Decodable for bool {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        reader.read_bool()
    }
}

impl Decodable for String {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        reader.read_string()
    }
}

impl Decodable for Ipv4Addr {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        reader.read_ipv4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(serialize(&0x0102_0304u32), vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(serialize(&1u8), vec![1]);
        assert_eq!(
            serialize(&0x0102_0304_0506_0708u64),
            vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn strings_are_length_prefixed() {
        let encoded = serialize("abc");
        assert_eq!(encoded, vec![3, 0, 0, 0, b'a', b'b', b'c']);

        let mut cursor = PayloadCursor::new(&encoded);
        assert_eq!(String::decode(&mut cursor).unwrap(), "abc");
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn ipv4_is_byte_reversed() {
        let ip = Ipv4Addr::new(192, 168, 1, 42);
        let encoded = serialize(&ip);
        assert_eq!(encoded, vec![42, 1, 168, 192]);

        let mut cursor = PayloadCursor::new(&encoded);
        assert_eq!(Ipv4Addr::decode(&mut cursor).unwrap(), ip);
    }

    #[test]
    fn bool_round_trip() {
        for value in [true, false] {
            let encoded = serialize(&value);
            let mut cursor = PayloadCursor::new(&encoded);
            assert_eq!(bool::decode(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn short_read_reports_position() {
        let mut cursor = PayloadCursor::new(&[1, 2]);
        cursor.read_u8().unwrap();

        let err = cursor.read_u32().unwrap_err();
        match err {
            Error::FrameMalformed { position, .. } => assert_eq!(position, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn string_longer_than_payload_fails() {
        // Length prefix says 10 bytes but only 2 follow.
        let payload = [10, 0, 0, 0, b'a', b'b'];
        let mut cursor = PayloadCursor::new(&payload);
        assert!(String::decode(&mut cursor).is_err());
    }
}
