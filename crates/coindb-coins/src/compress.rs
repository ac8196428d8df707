//! Output compression for the UTXO record format.
//!
//! Four well-known script templates collapse to a one-byte prefix plus a
//! fixed payload; everything else is stored raw behind a length prefix.
//! Monetary values are written as plain varints.
//!
//! https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/compressor.cpp

use crate::error::Error;
use crate::serialize::{varint_size, write_varint, RecordReader};
use bitcoin::hashes::Hash;
use bitcoin::script::ScriptBuf;
use bitcoin::{opcodes, Amount, PubkeyHash, ScriptHash, TxOut};
use coindb_primitives::MAX_SCRIPT_SIZE;
use std::io::{self, Write};

// Constants for opcodes
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;

/// First prefix value carrying a raw script; the script length is the prefix
/// minus this base. Prefixes between the last template (0x05) and the base
/// are reserved and rejected on read.
const RAW_SCRIPT_BASE: u64 = 0x10;

fn to_key_id(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        Some(script[3..23].try_into().expect("Size must be 20; qed"))
    } else {
        None
    }
}

fn to_script_id(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        Some(script[2..22].try_into().expect("Size must be 20; qed"))
    } else {
        None
    }
}

enum PublicKey {
    Compressed([u8; 33]),
    Uncompressed([u8; 65]),
}

fn to_pub_key(script: &[u8]) -> Option<PublicKey> {
    if script.len() == 35
        && script[0] == 33
        && script[34] == OP_CHECKSIG
        && (script[1] == 0x02 || script[1] == 0x03)
    {
        Some(PublicKey::Compressed(
            script[1..34].try_into().expect("Size must be 33; qed"),
        ))
    } else if script.len() == 67
        && script[0] == 65
        && script[66] == OP_CHECKSIG
        && script[1] == 0x04
    {
        // If not fully valid, it would not be compressible.
        let is_fully_valid = bitcoin::Script::from_bytes(script)
            .p2pk_public_key()
            .is_some();
        if is_fully_valid {
            Some(PublicKey::Uncompressed(
                script[1..66].try_into().expect("Size must be 65; qed"),
            ))
        } else {
            None
        }
    } else {
        None
    }
}

fn compress_script(script: &[u8]) -> Option<Vec<u8>> {
    if let Some(hash) = to_key_id(script) {
        let mut out = Vec::with_capacity(21);
        out.push(0x00);
        out.extend(hash);
        return Some(out);
    }

    if let Some(hash) = to_script_id(script) {
        let mut out = Vec::with_capacity(21);
        out.push(0x01);
        out.extend(hash);
        return Some(out);
    }

    if let Some(public_key) = to_pub_key(script) {
        let mut out = Vec::with_capacity(33);

        match public_key {
            PublicKey::Compressed(compressed) => {
                // The parity byte doubles as the template prefix.
                out.extend(compressed);
            }
            PublicKey::Uncompressed(uncompressed) => {
                out.push(0x04 | (uncompressed[64] & 0x01));
                out.extend_from_slice(&uncompressed[1..33]);
            }
        }

        return Some(out);
    }

    None
}

/// Writes the compressed form of one output: the value as a plain varint,
/// then the script under its template prefix.
pub(crate) fn write_output<W: Write>(writer: &mut W, output: &TxOut) -> io::Result<()> {
    write_varint(writer, output.value.to_sat())?;

    let script = output.script_pubkey.as_bytes();
    if let Some(compressed) = compress_script(script) {
        return writer.write_all(&compressed);
    }
    write_varint(writer, script.len() as u64 + RAW_SCRIPT_BASE)?;
    writer.write_all(script)
}

/// Number of bytes [`write_output`] would produce, without writing.
pub(crate) fn output_size(output: &TxOut) -> usize {
    let script = output.script_pubkey.as_bytes();
    let script_size = match compress_script(script) {
        Some(compressed) => compressed.len(),
        None => varint_size(script.len() as u64 + RAW_SCRIPT_BASE) + script.len(),
    };
    varint_size(output.value.to_sat()) + script_size
}

/// Reads one compressed output, reconstructing the script in canonical form.
pub(crate) fn read_output(reader: &mut RecordReader<'_>) -> Result<TxOut, Error> {
    let value = reader.read_varint()?;
    let script_pubkey = read_script(reader)?;
    Ok(TxOut {
        value: Amount::from_sat(value),
        script_pubkey,
    })
}

fn read_script(reader: &mut RecordReader<'_>) -> Result<ScriptBuf, Error> {
    let prefix = reader.read_varint()?;

    match prefix {
        0x00 => {
            let bytes = reader.read_bytes(20)?;
            let pubkey_hash = PubkeyHash::from_slice(bytes).expect("Slice length is 20; qed");
            Ok(ScriptBuf::new_p2pkh(&pubkey_hash))
        }
        0x01 => {
            let bytes = reader.read_bytes(20)?;
            let script_hash = ScriptHash::from_slice(bytes).expect("Slice length is 20; qed");
            Ok(ScriptBuf::new_p2sh(&script_hash))
        }
        0x02 | 0x03 => {
            let bytes = reader.read_bytes(32)?;

            let mut script_bytes = Vec::with_capacity(35);
            script_bytes.push(opcodes::all::OP_PUSHBYTES_33.to_u8());
            script_bytes.push(prefix as u8);
            script_bytes.extend_from_slice(bytes);
            script_bytes.push(opcodes::all::OP_CHECKSIG.to_u8());

            Ok(ScriptBuf::from(script_bytes))
        }
        0x04 | 0x05 => {
            let bytes = reader.read_bytes(32)?;

            let mut compressed_pubkey = Vec::with_capacity(33);
            compressed_pubkey.push(prefix as u8 - 2);
            compressed_pubkey.extend_from_slice(bytes);

            let pubkey = bitcoin::PublicKey::from_slice(&compressed_pubkey)
                .map_err(|_| Error::InvalidPublicKey)?;
            let uncompressed = pubkey.inner.serialize_uncompressed();

            let mut script_bytes = Vec::with_capacity(67);
            script_bytes.push(opcodes::all::OP_PUSHBYTES_65.to_u8());
            script_bytes.extend_from_slice(&uncompressed);
            script_bytes.push(opcodes::all::OP_CHECKSIG.to_u8());

            Ok(ScriptBuf::from(script_bytes))
        }
        0x06..=0x0F => Err(Error::ReservedScriptPrefix(prefix as u8)),
        _ => {
            let len = prefix - RAW_SCRIPT_BASE;
            if len > MAX_SCRIPT_SIZE as u64 {
                return Err(Error::OversizedScript(len));
            }
            let bytes = reader.read_bytes(len as usize)?;
            Ok(ScriptBuf::from_bytes(bytes.to_vec()))
        }
    }
}

/// Advances past one compressed output without materializing it, returning
/// the number of bytes consumed.
pub(crate) fn skip_output(reader: &mut RecordReader<'_>) -> Result<usize, Error> {
    let start = reader.position();

    reader.read_varint()?; // value
    let prefix = reader.read_varint()?;
    let payload = match prefix {
        0x00 | 0x01 => 20,
        0x02..=0x05 => 32,
        0x06..=0x0F => return Err(Error::ReservedScriptPrefix(prefix as u8)),
        _ => {
            let len = prefix - RAW_SCRIPT_BASE;
            if len > MAX_SCRIPT_SIZE as u64 {
                return Err(Error::OversizedScript(len));
            }
            len as usize
        }
    };
    reader.skip(payload)?;

    Ok(reader.position() - start)
}
