use std::sync::atomic::AtomicBool;

use utxod_consensus::params::{consensus_params, Network};
use utxod_pow::difficulty::compact_to_u256;
use utxod_pow::miner::{mine, mine_with_roll, MineOutcome};
use utxod_pow::validation::{validate_pow_header, PowError};
use utxod_primitives::block::BlockHeader;

fn template(bits: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: [0x11; 32],
        merkle_root: [0x22; 32],
        time: 1_700_000_000,
        bits,
        nonce: 0,
    }
}

#[test]
fn mines_regtest_header() {
    let params = consensus_params(Network::Regtest);
    let cancel = AtomicBool::new(false);
    let outcome = mine(template(params.pow_limit_bits), &params, &cancel).expect("mine");
    let header = match outcome {
        MineOutcome::Found(header) => header,
        other => panic!("expected a solution, got {other:?}"),
    };
    validate_pow_header(&header, &params).expect("solution validates");
}

#[test]
fn cancelled_before_first_hash() {
    let params = consensus_params(Network::Mainnet);
    let cancel = AtomicBool::new(true);
    let outcome = mine(template(params.pow_limit_bits), &params, &cancel).expect("mine");
    assert_eq!(outcome, MineOutcome::Cancelled);
}

#[test]
fn exhausted_when_roll_refuses() {
    let params = consensus_params(Network::Mainnet);
    let cancel = AtomicBool::new(false);
    let mut header = template(params.pow_limit_bits);
    header.nonce = u32::MAX - 8;
    let mut rolls = 0;
    let outcome = mine_with_roll(header, &params, &cancel, |_| {
        rolls += 1;
        false
    })
    .expect("mine");
    assert_eq!(outcome, MineOutcome::Exhausted);
    assert_eq!(rolls, 1);
}

#[test]
fn roll_hook_changes_header_after_wrap() {
    let params = consensus_params(Network::Regtest);
    let cancel = AtomicBool::new(false);
    let target = compact_to_u256(params.pow_limit_bits).expect("target");

    // Find a start nonce at u32::MAX that fails, so the wrap path is taken.
    let mut header = template(params.pow_limit_bits);
    header.nonce = u32::MAX;
    while utxod_pow::hash_meets_target(&header.hash(), &target) {
        header.time += 1;
    }
    let start_time = header.time;
    let outcome = mine_with_roll(header, &params, &cancel, |h| {
        h.merkle_root[0] ^= 0xff;
        true
    })
    .expect("mine");
    let found = match outcome {
        MineOutcome::Found(header) => header,
        other => panic!("expected a solution, got {other:?}"),
    };
    assert_eq!(found.time, start_time);
    assert_eq!(found.merkle_root[0], 0x22 ^ 0xff);
}

#[test]
fn rejects_target_above_limit() {
    let params = consensus_params(Network::Mainnet);
    let header = template(0x207f_ffff);
    assert_eq!(
        validate_pow_header(&header, &params),
        Err(PowError::InvalidBits("pow target above limit"))
    );
}
