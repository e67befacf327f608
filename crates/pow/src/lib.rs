//! Proof-of-work: compact targets, chain work, retargeting and mining.

pub mod difficulty;
pub mod miner;
pub mod validation;

pub use difficulty::{block_proof, compact_to_u256, hash_meets_target, u256_to_compact};
pub use miner::{mine, MineOutcome};
pub use validation::{validate_pow_header, PowError};
