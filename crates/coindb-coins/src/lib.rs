//! Per-transaction UTXO record codec.
//!
//! A [`Coins`] value holds the still-unspent outputs of one confirmed
//! transaction together with the metadata they share, and owns the compact
//! record format used to persist the UTXO set:
//!
//! ```text
//! varint    version
//! u32-le    height
//! varint    header code: coinbase flag, presence of outputs 0 and 1,
//!           size of the extended spent-field
//! [u8; S]   extended spent-field, bit j of byte i <=> output 2 + 8*i + j
//!           is unspent
//! ...       compressed outputs, ascending index order
//! ```
//!
//! Decoding is lazy: each entry records the byte range of its compressed
//! output inside the record buffer and decompresses only when read, so a
//! record that is decoded, partially spent and flushed again moves the
//! untouched outputs by byte copy. Callers that need a single output can
//! bypass the container entirely via [`Coins::parse_coin`].
//!
//! The transaction id is the database key; it is never written to the body
//! and is injected back on load. A record with no unspent outputs must be
//! deleted from the database, never serialized.

mod compress;
mod entry;
mod error;
mod serialize;

use crate::serialize::{varint_size, write_varint, RecordReader};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use coindb_primitives::{is_unspendable, UNCONFIRMED_HEIGHT};
use std::io::{self, Write};
use std::sync::Arc;

pub use crate::entry::CoinEntry;
pub use crate::error::Error;
pub use coindb_primitives::Coin;

/// Result type for record decoding.
pub type Result<T> = std::result::Result<T, Error>;

// Header code bit layout; everything above the three flag bits is the
// extended spent-field size.
const CODE_COINBASE: u64 = 1;
const CODE_FIRST_UNSPENT: u64 = 1 << 1;
const CODE_SECOND_UNSPENT: u64 = 1 << 2;

/// Unspent outputs of one transaction.
///
/// The output vector is sparse: a `None` slot is an output that was spent
/// (and pruned) or was unspendable from creation. Trailing gaps are trimmed
/// after every mutation, so `outputs.len()` is always one past the highest
/// live entry.
#[derive(Debug, Clone)]
pub struct Coins {
    /// Id of the containing transaction; reconstructed from the database key.
    pub txid: Txid,
    /// Version of the containing transaction.
    pub version: u32,
    /// Block height; [`UNCONFIRMED_HEIGHT`] until confirmed.
    pub height: i32,
    /// Whether the containing transaction is a coinbase.
    pub coinbase: bool,
    outputs: Vec<Option<CoinEntry>>,
}

impl Coins {
    /// Empty record for the given transaction metadata.
    pub fn new(txid: Txid, version: u32, height: i32, coinbase: bool) -> Self {
        Self {
            txid,
            version,
            height,
            coinbase,
            outputs: Vec::new(),
        }
    }

    /// Record holding all spendable outputs of a freshly confirmed
    /// transaction. Unspendable outputs become gaps from creation.
    pub fn from_tx(tx: &Transaction, height: i32) -> Self {
        let outputs = tx
            .output
            .iter()
            .map(|output| {
                if is_unspendable(&output.script_pubkey) {
                    tracing::trace!(script = %output.script_pubkey.as_script(), "Skipping unspendable output");
                    None
                } else {
                    Some(CoinEntry::from_output(output.clone()))
                }
            })
            .collect();

        let mut coins = Self {
            txid: tx.compute_txid(),
            version: tx.version.0 as u32,
            height,
            coinbase: tx.is_coinbase(),
            outputs,
        };
        coins.cleanup();
        coins
    }

    /// One past the index of the highest live entry, 0 for a bare record.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether no unspent output is left.
    ///
    /// An empty record must be deleted from the database instead of being
    /// serialized; spent-marked entries count as gone here even though they
    /// keep their index until the next flush.
    pub fn is_empty(&self) -> bool {
        self.outputs.iter().flatten().all(CoinEntry::is_spent)
    }

    /// Number of outputs that would survive a re-serialization.
    pub fn unspent_count(&self) -> usize {
        self.outputs
            .iter()
            .flatten()
            .filter(|entry| !entry.is_spent())
            .count()
    }

    /// Whether an entry exists at `index`, spent-marked or not.
    pub fn has(&self, index: u32) -> bool {
        matches!(self.outputs.get(index as usize), Some(Some(_)))
    }

    /// Whether the output at `index` exists and has not been spent.
    pub fn is_unspent(&self, index: u32) -> bool {
        matches!(
            self.outputs.get(index as usize),
            Some(Some(entry)) if !entry.is_spent()
        )
    }

    /// Inserts an entry at `index`, padding interior gaps as needed.
    ///
    /// Panics if the slot is already occupied.
    pub fn add(&mut self, index: u32, entry: CoinEntry) {
        let i = index as usize;
        if i >= self.outputs.len() {
            self.outputs.resize_with(i + 1, || None);
        }
        assert!(
            self.outputs[i].is_none(),
            "output {index} already occupied"
        );
        self.outputs[i] = Some(entry);
    }

    /// Inserts a freshly created output at `index`.
    ///
    /// Panics if the script is unspendable; such outputs never enter the
    /// UTXO set.
    pub fn add_output(&mut self, index: u32, output: TxOut) {
        assert!(
            !is_unspendable(&output.script_pubkey),
            "unspendable output must not enter the UTXO set"
        );
        self.add(index, CoinEntry::from_output(output));
    }

    /// Re-inserts a standalone coin, e.g. while rewinding a block.
    pub fn add_coin(&mut self, coin: &Coin) {
        assert!(
            !is_unspendable(bitcoin::Script::from_bytes(&coin.script_pubkey)),
            "unspendable output must not enter the UTXO set"
        );
        debug_assert_eq!(
            coin.outpoint.txid, self.txid,
            "coin belongs to another transaction"
        );
        self.add(coin.outpoint.vout, CoinEntry::from_coin(coin));
    }

    /// Marks the output at `index` spent and returns it for the undo log.
    ///
    /// The entry keeps its index until the next serialization. Returns
    /// `None` when the output is absent or already spent, leaving the record
    /// untouched.
    pub fn spend(&mut self, index: u32) -> Option<CoinEntry> {
        match self.outputs.get_mut(index as usize) {
            Some(Some(entry)) if !entry.is_spent() => {
                entry.mark_spent();
                Some(entry.clone())
            }
            _ => {
                tracing::trace!(index, "No-op spend of absent or already-spent output");
                None
            }
        }
    }

    /// Physically removes the entry at `index` and trims trailing gaps.
    pub fn remove(&mut self, index: u32) -> Option<CoinEntry> {
        let entry = self.outputs.get_mut(index as usize)?.take();
        self.cleanup();
        entry
    }

    /// Trims trailing gaps so that `len()` lands one past the highest live
    /// entry.
    pub fn cleanup(&mut self) {
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
    }

    /// The output at `index`, decompressing it on first access.
    pub fn get_output(&mut self, index: u32) -> Result<Option<&TxOut>> {
        match self.outputs.get_mut(index as usize) {
            Some(Some(entry)) => entry.output().map(Some),
            _ => Ok(None),
        }
    }

    /// The output at `index` projected as a standalone coin.
    pub fn get_coin(&mut self, index: u32) -> Result<Option<Coin>> {
        let (txid, version, height, coinbase) =
            (self.txid, self.version, self.height, self.coinbase);

        let Some(Some(entry)) = self.outputs.get_mut(index as usize) else {
            return Ok(None);
        };
        let output = entry.output()?;

        Ok(Some(Coin {
            outpoint: OutPoint { txid, vout: index },
            version,
            height,
            is_coinbase: coinbase,
            amount: output.value.to_sat(),
            script_pubkey: output.script_pubkey.as_bytes().to_vec(),
        }))
    }

    fn field_size(&self) -> usize {
        // One bit per output at index >= 2, rounded up to whole bytes.
        (self.outputs.len() + 5) / 8
    }

    fn header_code(&self, field_size: usize) -> u64 {
        assert!(
            u32::try_from(field_size).is_ok(),
            "spent-field size exceeds the practical varint range"
        );

        let first = self.is_unspent(0);
        let second = self.is_unspent(1);
        // With both low outputs spent the flag bits alone would make the
        // code collide with an empty record, which is never written; the
        // field size is stored off by one to keep the code distinct.
        let correction = u64::from(!first && !second);

        ((field_size as u64 - correction) << 3)
            | u64::from(self.coinbase) * CODE_COINBASE
            | u64::from(first) * CODE_FIRST_UNSPENT
            | u64::from(second) * CODE_SECOND_UNSPENT
    }

    /// Total encoded size of the record in bytes.
    ///
    /// Panics if the record is empty, like [`Coins::encode`].
    pub fn encoded_size(&self) -> usize {
        assert!(!self.is_empty(), "cannot serialize fully-spent coins");

        let field_size = self.field_size();
        let mut size = varint_size(self.version as u64)
            + 4
            + varint_size(self.header_code(field_size))
            + field_size;
        for entry in self.outputs.iter().flatten() {
            if !entry.is_spent() {
                size += entry.size();
            }
        }
        size
    }

    /// Serializes the record.
    ///
    /// Panics if no unspent output is left; callers must delete the database
    /// key instead of writing an empty record.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.encoded_size());
        self.encode_to(&mut data)
            .expect("writing a record to a Vec cannot fail; qed");
        data
    }

    /// Serializes the record into `writer`.
    pub fn encode_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        assert!(!self.is_empty(), "cannot serialize fully-spent coins");
        debug_assert!(
            self.height != UNCONFIRMED_HEIGHT,
            "unconfirmed records must not be persisted"
        );

        let field_size = self.field_size();

        write_varint(writer, self.version as u64)?;
        writer.write_all(&(self.height as u32).to_le_bytes())?;
        write_varint(writer, self.header_code(field_size))?;

        for i in 0..field_size {
            let mut bits = 0u8;
            for j in 0..8 {
                if self.is_unspent((2 + 8 * i + j) as u32) {
                    bits |= 1 << j;
                }
            }
            writer.write_all(&[bits])?;
        }

        for entry in self.outputs.iter().flatten() {
            if !entry.is_spent() {
                entry.write(writer)?;
            }
        }

        Ok(())
    }

    /// Deserializes a record, taking ownership of the buffer.
    ///
    /// The buffer becomes the shared backing store of the lazy entries; no
    /// output is decompressed here. `txid` comes from the database key.
    pub fn decode(txid: Txid, raw: Vec<u8>) -> Result<Self> {
        let buf: Arc<[u8]> = raw.into();
        let mut reader = RecordReader::new(&buf);
        let header = RecordHeader::read(&mut reader)?;

        let mut outputs = Vec::with_capacity(2 + header.field_size * 8);
        for present in [header.first, header.second] {
            if present {
                outputs.push(Some(CoinEntry::from_reader(&mut reader, Arc::clone(&buf))?));
            } else {
                outputs.push(None);
            }
        }
        for i in 0..header.field_size {
            let bits = buf[header.field_offset + i];
            for j in 0..8 {
                if bits & (1 << j) != 0 {
                    outputs.push(Some(CoinEntry::from_reader(&mut reader, Arc::clone(&buf))?));
                } else {
                    outputs.push(None);
                }
            }
        }

        let mut coins = Self {
            txid,
            version: header.version,
            height: header.height,
            coinbase: header.coinbase,
            outputs,
        };
        coins.cleanup();

        if coins.outputs.is_empty() {
            // Such a record must never have been written; see `encode`.
            return Err(Error::EmptyRecord);
        }

        Ok(coins)
    }

    /// Extracts the output at `index` straight from an encoded record.
    ///
    /// Walks the encoding without building the container: compressed outputs
    /// in front of the wanted one are skipped, everything behind it is never
    /// touched. `Ok(None)` means the record holds no unspent output at
    /// `index`.
    pub fn parse_coin(raw: &[u8], txid: Txid, index: u32) -> Result<Option<Coin>> {
        let mut reader = RecordReader::new(raw);
        let header = RecordHeader::read(&mut reader)?;

        let wanted = index as usize;
        if wanted >= 2 + header.field_size * 8 {
            return Ok(None);
        }

        let is_present = |slot: usize| match slot {
            0 => header.first,
            1 => header.second,
            _ => raw[header.field_offset + (slot - 2) / 8] & (1 << ((slot - 2) % 8)) != 0,
        };

        for slot in 0..wanted {
            if is_present(slot) {
                compress::skip_output(&mut reader)?;
            }
        }
        if !is_present(wanted) {
            return Ok(None);
        }

        let output = compress::read_output(&mut reader)?;
        Ok(Some(Coin {
            outpoint: OutPoint { txid, vout: index },
            version: header.version,
            height: header.height,
            is_coinbase: header.coinbase,
            amount: output.value.to_sat(),
            script_pubkey: output.script_pubkey.as_bytes().to_vec(),
        }))
    }
}

/// Decoded record header, with the reader left at the first compressed
/// output.
struct RecordHeader {
    version: u32,
    height: i32,
    coinbase: bool,
    /// Output 0 is unspent.
    first: bool,
    /// Output 1 is unspent.
    second: bool,
    /// Extended spent-field size in bytes.
    field_size: usize,
    /// Byte offset of the extended spent-field, for random-index access.
    field_offset: usize,
}

impl RecordHeader {
    fn read(reader: &mut RecordReader<'_>) -> Result<Self> {
        let version = u32::try_from(reader.read_varint()?)
            .map_err(|_| Error::FieldOutOfRange("version"))?;
        let height = reader.read_u32_le()? as i32;
        let code = reader.read_varint()?;

        let coinbase = code & CODE_COINBASE != 0;
        let first = code & CODE_FIRST_UNSPENT != 0;
        let second = code & CODE_SECOND_UNSPENT != 0;

        let mut field_size = usize::try_from(code >> 3)
            .map_err(|_| Error::FieldOutOfRange("spent-field size"))?;
        if code & (CODE_FIRST_UNSPENT | CODE_SECOND_UNSPENT) == 0 {
            // The size is stored off by one when both low outputs are spent;
            // see `Coins::header_code`.
            field_size += 1;
        }

        let field_offset = reader.position();
        reader.skip(field_size)?;

        Ok(Self {
            version,
            height,
            coinbase,
            first,
            second,
            field_size,
            field_offset,
        })
    }
}
