//! Consensus constants, parameters, and subsidy schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams,
    ConsensusParams, GenesisParams, Network,
};
pub use rewards::block_subsidy;

/// 32-byte digest in internal (serialization) byte order.
pub type Hash256 = [u8; 32];

/// Locking condition of an output: `ripemd160(sha256(pubkey))`.
pub type PubKeyHash = [u8; 20];
