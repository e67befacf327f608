//! Nonce search with cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};

use utxod_consensus::ConsensusParams;
use utxod_primitives::block::BlockHeader;

use crate::difficulty::hash_meets_target;
use crate::validation::{header_target, PowError};

/// Hashes tried between two reads of the cancellation flag.
pub const CANCEL_POLL_INTERVAL: u64 = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MineOutcome {
    Found(BlockHeader),
    Cancelled,
    /// The nonce space ran out and the roll hook could not change the header.
    Exhausted,
}

/// Searches for a nonce starting at `header.nonce`, advancing `time` by one
/// second each time the nonce wraps.
pub fn mine(
    header: BlockHeader,
    params: &ConsensusParams,
    cancel: &AtomicBool,
) -> Result<MineOutcome, PowError> {
    mine_with_roll(header, params, cancel, roll_time)
}

/// Like `mine`, but `roll` is called when the nonce wraps. It may alter any
/// header field other than the nonce (the caller's template logic decides
/// which) and returns `false` when there is nothing left to change.
pub fn mine_with_roll<F>(
    mut header: BlockHeader,
    params: &ConsensusParams,
    cancel: &AtomicBool,
    mut roll: F,
) -> Result<MineOutcome, PowError>
where
    F: FnMut(&mut BlockHeader) -> bool,
{
    let target = header_target(&header, params)?;
    let mut attempts: u64 = 0;
    loop {
        if attempts % CANCEL_POLL_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Ok(MineOutcome::Cancelled);
        }
        attempts = attempts.wrapping_add(1);

        if hash_meets_target(&header.hash(), &target) {
            return Ok(MineOutcome::Found(header));
        }

        match header.nonce.checked_add(1) {
            Some(next) => header.nonce = next,
            None => {
                if !roll(&mut header) {
                    return Ok(MineOutcome::Exhausted);
                }
                header.nonce = 0;
            }
        }
    }
}

fn roll_time(header: &mut BlockHeader) -> bool {
    match header.time.checked_add(1) {
        Some(time) => {
            header.time = time;
            true
        }
        None => false,
    }
}
