//! Low-level record serialization helpers.
//!
//! Record varints are the Bitcoin Core form: base-128, most-significant group
//! first, continuation flag in the high bit, every non-terminal group
//! incremented by one.
//!
//! https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/serialize.h#L339

use crate::error::Error;
use bitcoin::consensus::{Decodable, Encodable};
use std::io::{self, Write};
use txoutset::var_int::VarInt;

/// Writes `value` as a varint.
pub(crate) fn write_varint<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    let mut data = Vec::new();
    VarInt::new(value).consensus_encode(&mut data)?;
    writer.write_all(&data)
}

/// Number of bytes [`write_varint`] produces for `value`.
pub(crate) fn varint_size(value: u64) -> usize {
    let mut len = 1;
    let mut n = value;
    while n > 0x7F {
        n = (n >> 7) - 1;
        len += 1;
    }
    len
}

/// Byte cursor over an encoded record.
///
/// Decoding is not purely sequential: the extended spent-field is skipped on
/// the first pass and read back by random index while the cursor walks the
/// compressed outputs behind it.
pub(crate) struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Cursor positioned at `pos`, for re-reading a known byte range.
    pub(crate) fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64, Error> {
        let mut remaining = &self.buf[self.pos..];
        let before = remaining.len();
        let value = VarInt::consensus_decode(&mut remaining)?;
        self.pos += before - remaining.len();
        Ok(u64::from(value))
    }

    pub(crate) fn read_u32_le(&mut self) -> Result<u32, Error> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(
            bytes.try_into().expect("read_bytes returned 4 bytes; qed"),
        ))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(Error::Truncated(self.pos))?;
        if end > self.buf.len() {
            return Err(Error::Truncated(self.pos));
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.read_bytes(len).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_varint(value: u64) -> Vec<u8> {
        let mut data = Vec::new();
        write_varint(&mut data, value).unwrap();
        data
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [
            0u64,
            1,
            0x7F,
            0x80,
            0x407F,
            0x4080,
            100,
            1000,
            5_000_000_000,
            u64::from(u32::MAX),
            1 << 40,
        ] {
            let data = encode_varint(value);
            assert_eq!(data.len(), varint_size(value), "size mismatch for {value}");

            let mut reader = RecordReader::new(&data);
            assert_eq!(reader.read_varint().unwrap(), value);
            assert_eq!(reader.position(), data.len());
        }
    }

    #[test]
    fn test_varint_known_vectors() {
        assert_eq!(encode_varint(0), [0x00]);
        assert_eq!(encode_varint(0x7F), [0x7F]);
        assert_eq!(encode_varint(0x80), [0x80, 0x00]);
        assert_eq!(encode_varint(1000), [0x86, 0x68]);
        assert_eq!(encode_varint(5_000_000_000), [0x91, 0xCF, 0x96, 0xE3, 0x00]);
    }

    #[test]
    fn test_reader_bounds() {
        let data = [0xAA, 0xBB, 0xCC, 0xDD];
        let mut reader = RecordReader::new(&data);
        assert_eq!(reader.read_u32_le().unwrap(), 0xDDCCBBAA);
        assert!(matches!(reader.read_bytes(1), Err(Error::Truncated(4))));

        let mut reader = RecordReader::at(&data, 2);
        assert_eq!(reader.read_bytes(2).unwrap(), &[0xCC, 0xDD]);
        assert!(matches!(reader.skip(1), Err(Error::Truncated(4))));
    }
}
