//! Difficulty and compact target utilities.

use primitive_types::U256;
use utxod_consensus::{ConsensusParams, Hash256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    /// A retarget boundary was reached without the window's first timestamp.
    MissingWindowStart,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::MissingWindowStart => write!(f, "retarget window start unknown"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The parts of a connected header the retarget rule looks at.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: u32,
    pub time: u32,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    if (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }
    if word == 0 {
        return Ok(U256::zero());
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
        U256::from(word) << (8 * (size - 3))
    };

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    // Keep the mantissa positive: the 0x00800000 bit is a sign flag.
    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

/// Reads the hash as a big-endian integer and compares it with `target`.
pub fn hash_meets_target(hash: &Hash256, target: &U256) -> bool {
    U256::from_big_endian(hash) <= *target
}

/// Expected number of hashes to find a block at `bits`: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::one();
    Ok((!target / (target + one)) + one)
}

pub fn pow_limit(params: &ConsensusParams) -> Result<U256, CompactError> {
    compact_to_u256(params.pow_limit_bits)
}

/// Whether the block at `height` starts a new difficulty period.
pub fn is_retarget_height(height: u32, params: &ConsensusParams) -> bool {
    !params.pow_no_retargeting && height > 0 && height % params.retarget_interval() == 0
}

/// Height of the first block of the window that feeds the retarget for the
/// block at `height`, or `None` when `height` keeps its parent's bits.
pub fn retarget_window_start(height: u32, params: &ConsensusParams) -> Option<u32> {
    if is_retarget_height(height, params) {
        Some(height - params.retarget_interval())
    } else {
        None
    }
}

/// Compact target required for the child of `last`.
///
/// `window_start_time` is the timestamp of the block at
/// `retarget_window_start(last.height + 1)`; it is only read on a retarget
/// boundary.
pub fn next_work_required(
    last: &HeaderInfo,
    window_start_time: Option<u32>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let next_height = last.height.saturating_add(1);
    if !is_retarget_height(next_height, params) {
        return Ok(last.bits);
    }
    let first_time = window_start_time.ok_or(DifficultyError::MissingWindowStart)?;

    let actual_timespan = (i64::from(last.time) - i64::from(first_time))
        .clamp(params.min_actual_timespan(), params.max_actual_timespan());

    let limit = pow_limit(params)?;
    let old_target = compact_to_u256(last.bits)?;
    let (scaled, overflow) = old_target.overflowing_mul(U256::from(actual_timespan as u64));
    let mut next = if overflow {
        limit
    } else {
        scaled / U256::from(params.pow_target_timespan as u64)
    };
    if next > limit {
        next = limit;
    }

    Ok(u256_to_compact(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_consensus::params::{consensus_params, Network};

    fn retarget(last_height: u32, last_time: u32, first_time: u32, bits: u32) -> u32 {
        let params = consensus_params(Network::Mainnet);
        let last = HeaderInfo {
            height: last_height,
            time: last_time,
            bits,
        };
        next_work_required(&last, Some(first_time), &params).expect("retarget")
    }

    #[test]
    fn retarget_vectors() {
        assert_eq!(retarget(32_255, 1_262_152_739, 1_261_130_161, 0x1d00_ffff), 0x1d00_d86a);
        // Capped at the pow limit.
        assert_eq!(retarget(2_015, 1_233_061_996, 1_231_006_505, 0x1d00_ffff), 0x1d00_ffff);
        // Lower clamp: blocks came far too fast.
        assert_eq!(retarget(68_543, 1_279_297_671, 1_279_008_237, 0x1c05_a3f4), 0x1c01_68fd);
        // Upper clamp: blocks came far too slow.
        assert_eq!(retarget(46_367, 1_269_211_443, 1_263_163_443, 0x1c38_7f6f), 0x1d00_e1fd);
    }

    #[test]
    fn off_boundary_keeps_parent_bits() {
        let params = consensus_params(Network::Mainnet);
        let last = HeaderInfo {
            height: 100,
            time: 1_300_000_000,
            bits: 0x1c05_a3f4,
        };
        assert_eq!(next_work_required(&last, None, &params), Ok(0x1c05_a3f4));
    }

    #[test]
    fn boundary_without_window_is_an_error() {
        let params = consensus_params(Network::Mainnet);
        let last = HeaderInfo {
            height: 2_015,
            time: 1_300_000_000,
            bits: 0x1d00_ffff,
        };
        assert_eq!(
            next_work_required(&last, None, &params),
            Err(DifficultyError::MissingWindowStart)
        );
        assert_eq!(retarget_window_start(2_016, &params), Some(0));
        assert_eq!(retarget_window_start(2_017, &params), None);
    }

    #[test]
    fn regtest_never_retargets() {
        let params = consensus_params(Network::Regtest);
        let last = HeaderInfo {
            height: params.retarget_interval() - 1,
            time: 1,
            bits: 0x207f_ffff,
        };
        assert_eq!(next_work_required(&last, None, &params), Ok(0x207f_ffff));
    }

    #[test]
    fn block_proof_of_easiest_targets() {
        // Regtest target is just under 2^255.
        assert_eq!(block_proof(0x207f_ffff).expect("proof"), U256::from(2u64));
        assert_eq!(block_proof(0).expect("proof"), U256::zero());
        assert_eq!(block_proof(0x2300_ffff), Err(CompactError::Overflow));
        assert_eq!(block_proof(0x0480_0001), Err(CompactError::Negative));
    }
}
