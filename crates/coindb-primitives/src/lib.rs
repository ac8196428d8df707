//! Core UTXO value types shared across CoinDB components.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Script, Txid};

/// 1 BTC in satoshis.
pub const COIN: u64 = 100_000_000;

/// Maximum amount of money in circulation, in satoshis.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Maximum serialized script size in bytes.
///
/// Anything larger is consensus-unspendable and never enters the UTXO set.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Block height of a transaction that has not been confirmed yet.
///
/// In-memory only; persisted records always carry a real height.
pub const UNCONFIRMED_HEIGHT: i32 = -1;

/// Unspent transaction output projected as a standalone value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Coin {
    /// Location of the output within the blockchain.
    pub outpoint: OutPoint,
    /// Version of the containing transaction.
    pub version: u32,
    /// Block height at which the containing transaction was included.
    pub height: i32,
    /// Whether the coin is from a coinbase transaction.
    pub is_coinbase: bool,
    /// Transfer value in satoshis.
    pub amount: u64,
    /// Spending condition of the output.
    pub script_pubkey: Vec<u8>,
}

/// Returns true if the script can provably never be spent.
///
/// Mirrors `CScript::IsUnspendable`: an OP_RETURN lead opcode or a script
/// exceeding the consensus size limit.
pub fn is_unspendable(script: &Script) -> bool {
    script.is_op_return() || script.len() > MAX_SCRIPT_SIZE
}

/// Convert a transaction id to its UTXO record storage key (32 bytes, raw).
pub fn txid_to_key(txid: &Txid) -> [u8; 32] {
    txid.to_byte_array()
}

/// Parse a storage key back to a transaction id.
pub fn key_to_txid(key: &[u8; 32]) -> Txid {
    Txid::from_byte_array(*key)
}
