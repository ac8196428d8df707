//! Lazy handle for a single output inside an encoded record.

use crate::compress;
use crate::error::Error;
use crate::serialize::RecordReader;
use bitcoin::{Amount, ScriptBuf, TxOut};
use coindb_primitives::Coin;
use std::io::{self, Write};
use std::sync::Arc;

/// View into the parent record's backing buffer.
#[derive(Debug, Clone)]
struct RawView {
    buf: Arc<[u8]>,
    offset: usize,
    size: usize,
}

/// One output of a [`Coins`](crate::Coins) record.
///
/// An entry loaded from disk keeps a reference into the record's raw buffer
/// and is decompressed only when the output is actually read. Untouched
/// entries round-trip by byte copy on re-serialization, never through the
/// compressor.
#[derive(Debug, Clone)]
pub struct CoinEntry {
    output: Option<TxOut>,
    raw: Option<RawView>,
    spent: bool,
}

impl CoinEntry {
    /// Entry for a freshly created output.
    pub fn from_output(output: TxOut) -> Self {
        Self {
            output: Some(output),
            raw: None,
            spent: false,
        }
    }

    /// Entry for an output resurrected from a standalone coin.
    pub fn from_coin(coin: &Coin) -> Self {
        Self::from_output(TxOut {
            value: Amount::from_sat(coin.amount),
            script_pubkey: ScriptBuf::from_bytes(coin.script_pubkey.clone()),
        })
    }

    /// Entry referencing the compressed bytes at the reader's position.
    ///
    /// Walks past the compressed output to learn its extent; the bytes stay
    /// untouched until [`CoinEntry::output`] is called.
    pub(crate) fn from_reader(
        reader: &mut RecordReader<'_>,
        buf: Arc<[u8]>,
    ) -> Result<Self, Error> {
        let offset = reader.position();
        let size = compress::skip_output(reader)?;
        Ok(Self {
            output: None,
            raw: Some(RawView { buf, offset, size }),
            spent: false,
        })
    }

    /// The output, decompressed on first access.
    pub fn output(&mut self) -> Result<&TxOut, Error> {
        if self.output.is_none() {
            let raw = self
                .raw
                .as_ref()
                .expect("entry without a materialized output is backed by raw bytes; qed");
            let mut reader = RecordReader::at(&raw.buf, raw.offset);
            let output = compress::read_output(&mut reader)?;
            self.output = Some(output);
        }
        Ok(self
            .output
            .as_ref()
            .expect("output was materialized above; qed"))
    }

    /// Encoded size of this entry in bytes.
    pub fn size(&self) -> usize {
        match &self.raw {
            Some(raw) => raw.size,
            None => compress::output_size(
                self.output
                    .as_ref()
                    .expect("entry without raw bytes holds an output; qed"),
            ),
        }
    }

    /// Whether the entry has been marked spent.
    ///
    /// A spent entry keeps its index until the next serialization but is no
    /// longer emitted.
    pub fn is_spent(&self) -> bool {
        self.spent
    }

    pub(crate) fn mark_spent(&mut self) {
        self.spent = true;
    }

    /// Writes the compressed form: entries still backed by the record buffer
    /// byte-copy their slice, fresh ones go through the compressor.
    pub(crate) fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match &self.raw {
            Some(raw) => writer.write_all(&raw.buf[raw.offset..raw.offset + raw.size]),
            None => compress::write_output(
                writer,
                self.output
                    .as_ref()
                    .expect("entry without raw bytes holds an output; qed"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh_output(value: u64) -> TxOut {
        let mut script = vec![0x76, 0xa9, 20];
        script.extend_from_slice(&[0x11; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(script),
        }
    }

    #[test]
    fn test_lazy_materialization_is_idempotent() {
        let original = p2pkh_output(1234);
        let mut data = Vec::new();
        compress::write_output(&mut data, &original).unwrap();
        let buf: Arc<[u8]> = data.into();

        let mut reader = RecordReader::new(&buf);
        let mut entry = CoinEntry::from_reader(&mut reader, Arc::clone(&buf)).unwrap();
        assert_eq!(entry.size(), buf.len());

        assert_eq!(entry.output().unwrap(), &original);
        assert_eq!(entry.output().unwrap(), &original);
        // Materialization does not change the reported size.
        assert_eq!(entry.size(), buf.len());
    }

    #[test]
    fn test_write_prefers_byte_copy() {
        let original = p2pkh_output(99);
        let mut data = Vec::new();
        compress::write_output(&mut data, &original).unwrap();
        let buf: Arc<[u8]> = data.clone().into();

        let mut reader = RecordReader::new(&buf);
        let mut entry = CoinEntry::from_reader(&mut reader, Arc::clone(&buf)).unwrap();
        entry.output().unwrap();

        let mut reencoded = Vec::new();
        entry.write(&mut reencoded).unwrap();
        assert_eq!(reencoded, data);
    }

    #[test]
    fn test_fresh_entry_size_matches_write() {
        let entry = CoinEntry::from_output(p2pkh_output(5_000_000_000));
        let mut data = Vec::new();
        entry.write(&mut data).unwrap();
        assert_eq!(entry.size(), data.len());
    }
}
