#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use utxod_chainstate::{BlockAcceptance, ChainState, ChainStateOptions};
use utxod_consensus::money::Amount;
use utxod_consensus::params::{consensus_params, Network};
use utxod_consensus::{block_subsidy, ConsensusParams, Hash256, PubKeyHash};
use utxod_pow::{mine, MineOutcome};
use utxod_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_script::{lock_for_pubkey, sign_input};
use utxod_storage::memory::MemoryStore;
use utxod_storage::KeyValueStore;

pub const BLOCK_SPACING: u32 = 60;

pub fn regtest() -> ConsensusParams {
    consensus_params(Network::Regtest)
}

pub fn secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).expect("secret key")
}

pub fn lock_of(secret: &SecretKey) -> PubKeyHash {
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), secret);
    lock_for_pubkey(&pubkey.serialize())
}

pub fn open_memory(
    params: &ConsensusParams,
    options: ChainStateOptions,
) -> (Arc<MemoryStore>, ChainState<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = ChainState::open(Arc::clone(&store), params.clone(), options).expect("open");
    (store, state)
}

/// The block a test block is built on.
#[derive(Clone, Copy, Debug)]
pub struct Parent {
    pub hash: Hash256,
    pub height: u32,
    pub time: u32,
}

impl Parent {
    pub fn tip_of<S: KeyValueStore>(state: &ChainState<S>) -> Self {
        let tip = state.tip().expect("tip");
        let entry = state
            .header_entry(&tip.hash)
            .expect("header read")
            .expect("tip header");
        Self {
            hash: tip.hash,
            height: tip.height,
            time: entry.time,
        }
    }

    pub fn of(block: &Block, height: u32) -> Self {
        Self {
            hash: block.hash(),
            height,
            time: block.header.time,
        }
    }
}

pub fn coinbase(height: u32, lock: PubKeyHash, value: Amount) -> Transaction {
    Transaction::coinbase(height, vec![TxOut { value, lock }])
}

pub fn reward_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Builds and signs a transaction spending `inputs`.
pub fn spend(inputs: &[(OutPoint, &SecretKey)], outputs: Vec<TxOut>) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        vin: inputs
            .iter()
            .map(|(outpoint, _)| TxIn::unsigned(*outpoint))
            .collect(),
        vout: outputs,
        lock_time: 0,
    };
    for (index, (_, key)) in inputs.iter().enumerate() {
        sign_input(&mut tx, index, key).expect("sign");
    }
    tx
}

pub fn header_on(params: &ConsensusParams, parent: Parent) -> BlockHeader {
    BlockHeader {
        version: CURRENT_VERSION,
        prev_block: parent.hash,
        merkle_root: [0u8; 32],
        time: parent.time + BLOCK_SPACING,
        bits: params.pow_limit_bits,
        nonce: 0,
    }
}

/// Fills in the merkle root and searches a nonce for `header`.
pub fn seal(params: &ConsensusParams, header: BlockHeader, transactions: Vec<Transaction>) -> Block {
    let mut block = Block {
        header,
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    match mine(block.header.clone(), params, &AtomicBool::new(false)).expect("mine") {
        MineOutcome::Found(header) => block.header = header,
        other => panic!("mining failed: {other:?}"),
    }
    block
}

/// A block on `parent` whose coinbase pays subsidy plus `fees` to `miner`.
pub fn build_block(
    params: &ConsensusParams,
    parent: Parent,
    miner: PubKeyHash,
    fees: Amount,
    txs: Vec<Transaction>,
) -> Block {
    let height = parent.height + 1;
    let mut transactions = vec![coinbase(height, miner, block_subsidy(height, params) + fees)];
    transactions.extend(txs);
    seal(params, header_on(params, parent), transactions)
}

/// Builds `count` empty blocks on `parent`, each paying `miner`.
pub fn build_chain(
    params: &ConsensusParams,
    parent: Parent,
    miner: PubKeyHash,
    count: u32,
) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut parent = parent;
    for _ in 0..count {
        let block = build_block(params, parent, miner, 0, Vec::new());
        parent = Parent::of(&block, parent.height + 1);
        blocks.push(block);
    }
    blocks
}

pub fn submit<S: KeyValueStore>(state: &ChainState<S>, block: &Block) -> BlockAcceptance {
    state
        .submit_block(&block.consensus_encode())
        .expect("submit block")
}

pub fn connected(block: &Block, height: u32) -> BlockAcceptance {
    BlockAcceptance::Connected {
        hash: block.hash(),
        height,
    }
}

pub fn side_branch(block: &Block, height: u32) -> BlockAcceptance {
    BlockAcceptance::SideBranch {
        hash: block.hash(),
        height,
    }
}
