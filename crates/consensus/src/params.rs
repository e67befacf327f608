//! Consensus parameter definitions.

use crate::constants::{DEFAULT_MAX_ORPHAN_BLOCKS, DEFAULT_ORPHAN_TTL_SECS, MAX_BLOCK_SIZE};
use crate::money::{Amount, COIN};
use crate::{Hash256, PubKeyHash};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Self::Mainnet),
            "test" | "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

/// Definition of the block at height 0. The block itself is rebuilt from
/// these fields on first start; its hash is whatever they encode to.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub reward: Amount,
    pub recipient: PubKeyHash,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub genesis: GenesisParams,
    /// Easiest allowed target, in compact form.
    pub pow_limit_bits: u32,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_no_retargeting: bool,
    pub coinbase_maturity: u32,
    pub initial_subsidy: Amount,
    pub subsidy_halving_interval: u32,
    pub max_block_size: u32,
}

impl ConsensusParams {
    /// Number of blocks between difficulty adjustments.
    pub fn retarget_interval(&self) -> u32 {
        (self.pow_target_timespan / self.pow_target_spacing).max(1) as u32
    }

    pub fn min_actual_timespan(&self) -> i64 {
        self.pow_target_timespan / crate::constants::RETARGET_CLAMP_FACTOR
    }

    pub fn max_actual_timespan(&self) -> i64 {
        self.pow_target_timespan * crate::constants::RETARGET_CLAMP_FACTOR
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub conf_file_name: &'static str,
    /// Deepest rollback a reorg may perform before the branch is left aside.
    pub max_reorg_depth: u32,
    pub max_orphan_blocks: usize,
    pub orphan_ttl_secs: u64,
}

pub fn chain_params(network: Network) -> ChainParams {
    ChainParams {
        network,
        consensus: consensus_params(network),
        conf_file_name: "utxod.conf",
        max_reorg_depth: match network {
            Network::Regtest => 1_000,
            _ => 288,
        },
        max_orphan_blocks: DEFAULT_MAX_ORPHAN_BLOCKS,
        orphan_ttl_secs: DEFAULT_ORPHAN_TTL_SECS,
    }
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

// hash160 of the uncompressed satoshi genesis key; nobody is expected to spend it.
const GENESIS_RECIPIENT: PubKeyHash = [
    0x62, 0xe9, 0x07, 0xb1, 0x5c, 0xbf, 0x27, 0xd5, 0x42, 0x53, 0x99, 0xeb, 0xf6, 0xf0, 0xfb,
    0x50, 0xeb, 0xb8, 0x8f, 0x18,
];

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        genesis: GenesisParams {
            version: 1,
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
            reward: 50 * COIN,
            recipient: GENESIS_RECIPIENT,
        },
        pow_limit_bits: 0x1d00_ffff,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_no_retargeting: false,
        coinbase_maturity: 100,
        initial_subsidy: 50 * COIN,
        subsidy_halving_interval: 210_000,
        max_block_size: MAX_BLOCK_SIZE,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        genesis: GenesisParams {
            version: 1,
            time: 1_296_688_602,
            bits: 0x1d00_ffff,
            nonce: 414_098_458,
            reward: 50 * COIN,
            recipient: GENESIS_RECIPIENT,
        },
        pow_limit_bits: 0x1d00_ffff,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_no_retargeting: false,
        coinbase_maturity: 100,
        initial_subsidy: 50 * COIN,
        subsidy_halving_interval: 210_000,
        max_block_size: MAX_BLOCK_SIZE,
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        genesis: GenesisParams {
            version: 1,
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce: 2,
            reward: 50 * COIN,
            recipient: GENESIS_RECIPIENT,
        },
        pow_limit_bits: 0x207f_ffff,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_no_retargeting: true,
        coinbase_maturity: 0,
        initial_subsidy: 50 * COIN,
        subsidy_halving_interval: 150,
        max_block_size: MAX_BLOCK_SIZE,
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (byte-reversed) hash, left-padding short input.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }

    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();

    Ok(bytes)
}

/// Formats a hash in display order (byte-reversed).
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
