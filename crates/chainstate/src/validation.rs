//! Block and transaction checks.
//!
//! `prevalidate_block` needs nothing but the block and the chain parameters,
//! so it runs outside the engine lock on any thread. The contextual checks
//! take values the engine reads from the header index.

use std::collections::HashSet;

use utxod_consensus::constants::{MAX_FUTURE_BLOCK_TIME, MIN_BLOCK_VERSION};
use utxod_consensus::params::ConsensusParams;
use utxod_consensus::Hash256;
use utxod_pow::validation::{validate_pow_header, PowError};
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::Transaction;
use utxod_script::{verify_input, SignatureError};
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBlock(&'static str),
    InvalidHeader(&'static str),
    InvalidTransaction(&'static str),
    ValueOutOfRange,
    DuplicateInput,
    DuplicateTransaction,
    MerkleMismatch,
    MutatedMerkle,
    Pow(PowError),
    Signature {
        tx_index: usize,
        input_index: usize,
        error: SignatureError,
    },
}

impl ValidationError {
    /// Short static description used in rejections.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::InvalidBlock(message)
            | ValidationError::InvalidHeader(message)
            | ValidationError::InvalidTransaction(message) => *message,
            ValidationError::ValueOutOfRange => "value out of money range",
            ValidationError::DuplicateInput => "outpoint spent twice in block",
            ValidationError::DuplicateTransaction => "duplicate transaction",
            ValidationError::MerkleMismatch => "merkle root mismatch",
            ValidationError::MutatedMerkle => "mutated merkle tree",
            ValidationError::Pow(PowError::InvalidBits(message)) => *message,
            ValidationError::Pow(PowError::HashMismatch) => "proof of work does not meet target",
            ValidationError::Pow(PowError::Compact(_)) => "invalid compact target",
            ValidationError::Signature { .. } => "invalid input signature",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Pow(err) => write!(f, "{err}"),
            ValidationError::Signature {
                tx_index,
                input_index,
                error,
            } => write!(f, "transaction {tx_index} input {input_index}: {error}"),
            other => write!(f, "{}", other.reason()),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

/// A block that passed every check that does not need chain context.
#[derive(Clone, Debug)]
pub struct PrevalidatedBlock {
    pub block: Block,
    pub hash: Hash256,
    pub txids: Vec<Hash256>,
    pub size: usize,
}

pub fn prevalidate_block(
    block: Block,
    params: &ConsensusParams,
) -> Result<PrevalidatedBlock, ValidationError> {
    prevalidate_block_with_size(block, None, params)
}

/// Like `prevalidate_block`; `block_size` skips re-encoding when the caller
/// still has the wire bytes.
pub fn prevalidate_block_with_size(
    block: Block,
    block_size: Option<usize>,
    params: &ConsensusParams,
) -> Result<PrevalidatedBlock, ValidationError> {
    if block.header.version < MIN_BLOCK_VERSION {
        return Err(ValidationError::InvalidHeader("block version too low"));
    }
    validate_pow_header(&block.header, params)?;

    if block.transactions.is_empty() {
        return Err(ValidationError::InvalidBlock(
            "block must contain at least one transaction",
        ));
    }
    let size = block_size.unwrap_or_else(|| block.consensus_encode().len());
    if size > params.max_block_size as usize {
        return Err(ValidationError::InvalidBlock("block size too large"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::InvalidBlock(
            "first transaction is not coinbase",
        ));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::InvalidBlock("more than one coinbase"));
    }
    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let txids = block.txids();
    let (root, mutated) = utxod_primitives::merkle_root(&txids);
    if root != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch);
    }
    if mutated {
        return Err(ValidationError::MutatedMerkle);
    }
    let mut seen_txids = HashSet::with_capacity(txids.len());
    for txid in &txids {
        if !seen_txids.insert(*txid) {
            return Err(ValidationError::DuplicateTransaction);
        }
    }

    let mut seen_inputs: HashSet<OutPoint> = HashSet::new();
    for tx in &block.transactions[1..] {
        for input in &tx.vin {
            if !seen_inputs.insert(input.prevout) {
                return Err(ValidationError::DuplicateInput);
            }
        }
    }

    verify_block_signatures(&block)?;

    Ok(PrevalidatedBlock {
        hash: block.hash(),
        block,
        txids,
        size,
    })
}

/// Checks a transaction on its own: outputs present and in money range, no
/// outpoint spent twice.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vout.is_empty() {
        return Err(ValidationError::InvalidTransaction(
            "transaction has no outputs",
        ));
    }
    if tx.total_output_value().is_none() {
        return Err(ValidationError::ValueOutOfRange);
    }
    if tx.vin.len() > 1 {
        let mut seen = HashSet::with_capacity(tx.vin.len());
        for input in &tx.vin {
            if !seen.insert(input.prevout) {
                return Err(ValidationError::DuplicateInput);
            }
        }
    }
    Ok(())
}

/// Verifies every input signature of `tx`.
pub fn verify_transaction_signatures(tx: &Transaction) -> Result<(), ValidationError> {
    (0..tx.vin.len()).try_for_each(|input_index| {
        verify_input(tx, input_index).map_err(|error| ValidationError::Signature {
            tx_index: 0,
            input_index,
            error,
        })
    })
}

fn verify_block_signatures(block: &Block) -> Result<(), ValidationError> {
    let checks: Vec<(usize, usize)> = block
        .transactions
        .iter()
        .enumerate()
        .skip(1)
        .flat_map(|(tx_index, tx)| (0..tx.vin.len()).map(move |input| (tx_index, input)))
        .collect();
    checks.par_iter().try_for_each(|&(tx_index, input_index)| {
        verify_input(&block.transactions[tx_index], input_index).map_err(|error| {
            ValidationError::Signature {
                tx_index,
                input_index,
                error,
            }
        })
    })
}

/// Header checks that depend on the parent: the retarget result, the median
/// time past of the preceding blocks and the local clock.
pub fn check_contextual_header(
    header: &BlockHeader,
    expected_bits: u32,
    median_time_past: u32,
    now: i64,
) -> Result<(), ValidationError> {
    if header.bits != expected_bits {
        return Err(ValidationError::InvalidHeader("incorrect proof of work bits"));
    }
    if header.time <= median_time_past {
        return Err(ValidationError::InvalidHeader(
            "block time not after median time past",
        ));
    }
    if i64::from(header.time) > now + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationError::InvalidHeader("block time too far in future"));
    }
    Ok(())
}

pub fn check_coinbase_height(block: &Block, height: u32) -> Result<(), ValidationError> {
    match block.transactions.first() {
        Some(coinbase) if coinbase.lock_time == height => Ok(()),
        _ => Err(ValidationError::InvalidBlock("coinbase height mismatch")),
    }
}

/// Median of up to eleven timestamps; the upper middle for even counts.
pub fn median_time_past(times: &[u32]) -> u32 {
    let mut sorted = times.to_vec();
    sorted.sort_unstable();
    sorted.get(sorted.len() / 2).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_primitives::transaction::{TxIn, TxOut};

    fn header(time: u32, bits: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time,
            bits,
            nonce: 0,
        }
    }

    #[test]
    fn median_of_window() {
        assert_eq!(median_time_past(&[5, 1, 3]), 3);
        assert_eq!(median_time_past(&[10, 1, 2, 9, 3, 8, 4, 7, 5, 6, 11]), 6);
        assert_eq!(median_time_past(&[]), 0);
    }

    #[test]
    fn contextual_header_rules() {
        let now = 1_700_000_000;
        assert!(check_contextual_header(&header(1_000, 7), 7, 999, now).is_ok());
        assert_eq!(
            check_contextual_header(&header(1_000, 8), 7, 999, now),
            Err(ValidationError::InvalidHeader("incorrect proof of work bits"))
        );
        assert!(check_contextual_header(&header(1_000, 7), 7, 1_000, now).is_err());
        let future = (now + MAX_FUTURE_BLOCK_TIME + 1) as u32;
        assert!(check_contextual_header(&header(future, 7), 7, 999, now).is_err());
        let edge = (now + MAX_FUTURE_BLOCK_TIME) as u32;
        assert!(check_contextual_header(&header(edge, 7), 7, 999, now).is_ok());
    }

    #[test]
    fn transaction_checks() {
        let mut tx = Transaction {
            version: 1,
            vin: vec![
                TxIn::unsigned(OutPoint::new([1u8; 32], 0)),
                TxIn::unsigned(OutPoint::new([1u8; 32], 0)),
            ],
            vout: vec![TxOut {
                value: 10,
                lock: [0u8; 20],
            }],
            lock_time: 0,
        };
        assert_eq!(check_transaction(&tx), Err(ValidationError::DuplicateInput));
        tx.vin.pop();
        assert!(check_transaction(&tx).is_ok());
        tx.vout[0].value = -1;
        assert_eq!(check_transaction(&tx), Err(ValidationError::ValueOutOfRange));
        tx.vout.clear();
        assert!(matches!(
            check_transaction(&tx),
            Err(ValidationError::InvalidTransaction(_))
        ));
    }
}
