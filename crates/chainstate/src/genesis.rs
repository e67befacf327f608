use utxod_consensus::ConsensusParams;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::transaction::{Transaction, TxOut};

/// Rebuilds the height-0 block from the network's genesis definition.
///
/// The genesis header is never checked against its own target, so its hash
/// is simply whatever these fields encode to.
pub fn build_genesis_block(params: &ConsensusParams) -> Block {
    let genesis = &params.genesis;
    let coinbase = Transaction::coinbase(
        0,
        vec![TxOut {
            value: genesis.reward,
            lock: genesis.recipient,
        }],
    );
    let header = BlockHeader {
        version: genesis.version,
        prev_block: [0u8; 32],
        merkle_root: coinbase.txid(),
        time: genesis.time,
        bits: genesis.bits,
        nonce: genesis.nonce,
    };
    Block {
        header,
        transactions: vec![coinbase],
    }
}
