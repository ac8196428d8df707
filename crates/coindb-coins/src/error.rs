//! Decode errors for UTXO records.

use coindb_primitives::MAX_SCRIPT_SIZE;

/// Errors raised while decoding a UTXO record.
///
/// Any of these marks the record as corrupt; there is no partial recovery.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer ended before the structure described by the header.
    #[error("record truncated at offset {0}")]
    Truncated(usize),

    /// Script compression prefix in the reserved band.
    #[error("reserved script compression prefix {0:#04x}")]
    ReservedScriptPrefix(u8),

    /// Raw script length above the consensus limit.
    #[error("raw script of {0} bytes exceeds {MAX_SCRIPT_SIZE}")]
    OversizedScript(u64),

    /// Payload under prefix 0x04/0x05 is not a valid curve point.
    #[error("invalid public key in compressed p2pk script")]
    InvalidPublicKey,

    /// A header field decoded outside its representable range.
    #[error("{0} out of range")]
    FieldOutOfRange(&'static str),

    /// The record describes no unspent output; it should have been deleted.
    #[error("record contains no unspent outputs")]
    EmptyRecord,

    /// Varint decode failure.
    #[error(transparent)]
    VarInt(#[from] bitcoin::consensus::encode::Error),
}
