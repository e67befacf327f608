use primitive_types::U256;
use utxod_consensus::ConsensusParams;
use utxod_primitives::block::BlockHeader;

use crate::difficulty::{compact_to_u256, hash_meets_target, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Expands `header.bits` and checks it against the network limit.
pub fn header_target(header: &BlockHeader, params: &ConsensusParams) -> Result<U256, PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }
    let pow_limit = compact_to_u256(params.pow_limit_bits)?;
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }
    Ok(target)
}

/// Context-free proof-of-work check of a header against its own `bits`.
/// Whether `bits` is the value the chain requires is checked by the caller
/// once the parent is known.
pub fn validate_pow_header(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    let target = header_target(header, params)?;
    if !hash_meets_target(&header.hash(), &target) {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}
