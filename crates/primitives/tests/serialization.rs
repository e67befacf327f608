use utxod_consensus::Hash256;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::encoding::DecodeError;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};

fn seq_hash(start: u8) -> Hash256 {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn push_seq(buffer: &mut Vec<u8>, start: u8, len: usize) {
    for byte in 0..len {
        buffer.push(start.wrapping_add(byte as u8));
    }
}

fn sample_header() -> BlockHeader {
    BlockHeader {
        version: 2,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x0102_0304,
        bits: 0x1d00_ffff,
        nonce: 0x0a0b_0c0d,
    }
}

#[test]
fn header_layout_is_eighty_bytes_little_endian() {
    let header = sample_header();
    let encoded = header.consensus_encode();

    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    push_seq(&mut expected, 0x00, 32);
    push_seq(&mut expected, 0x20, 32);
    expected.extend_from_slice(&0x0102_0304u32.to_le_bytes());
    expected.extend_from_slice(&0x1d00_ffffu32.to_le_bytes());
    expected.extend_from_slice(&0x0a0b_0c0du32.to_le_bytes());

    assert_eq!(encoded.len(), 80);
    assert_eq!(encoded.as_slice(), expected.as_slice());

    let decoded = BlockHeader::consensus_decode(&encoded).expect("decode header");
    assert_eq!(decoded, header);
}

#[test]
fn header_decode_requires_exact_length() {
    let encoded = sample_header().consensus_encode();
    assert_eq!(
        BlockHeader::consensus_decode(&encoded[..79]),
        Err(DecodeError::UnexpectedEof)
    );
    let mut long = encoded.to_vec();
    long.push(0);
    assert_eq!(
        BlockHeader::consensus_decode(&long),
        Err(DecodeError::TrailingBytes)
    );
}

#[test]
fn mainnet_genesis_header_hash() {
    let header = BlockHeader {
        version: 1,
        prev_block: [0u8; 32],
        merkle_root: utxod_consensus::hash256_from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("merkle hex"),
        time: 1_231_006_505,
        bits: 0x1d00_ffff,
        nonce: 2_083_236_893,
    };
    assert_eq!(
        utxod_consensus::hash256_to_hex(&header.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
}

#[test]
fn transaction_layout() {
    let tx = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new(seq_hash(0x10), 1),
            signature: vec![0x30, 0x01],
            pubkey: vec![0x02, 0x03, 0x04],
            sequence: 0xffff_fffe,
        }],
        vout: vec![TxOut {
            value: 50,
            lock: [0x44; 20],
        }],
        lock_time: 7,
    };

    let encoded = tx.consensus_encode();
    let mut expected = Vec::new();
    expected.extend_from_slice(&1i32.to_le_bytes());
    expected.push(1);
    push_seq(&mut expected, 0x10, 32);
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(&[2, 0x30, 0x01]);
    expected.extend_from_slice(&[3, 0x02, 0x03, 0x04]);
    expected.extend_from_slice(&0xffff_fffeu32.to_le_bytes());
    expected.push(1);
    expected.extend_from_slice(&50i64.to_le_bytes());
    expected.extend_from_slice(&[0x44; 20]);
    expected.extend_from_slice(&7u32.to_le_bytes());

    assert_eq!(encoded, expected);
    assert_eq!(Transaction::consensus_decode(&encoded).expect("decode tx"), tx);
}

#[test]
fn block_round_trip_and_trailing_bytes() {
    let coinbase = Transaction::coinbase(
        3,
        vec![TxOut {
            value: 1_000,
            lock: [9u8; 20],
        }],
    );
    let mut header = sample_header();
    header.merkle_root = coinbase.txid();
    let block = Block {
        header,
        transactions: vec![coinbase],
    };

    let encoded = block.consensus_encode();
    let decoded = Block::consensus_decode(&encoded).expect("decode block");
    assert_eq!(decoded, block);
    assert_eq!(decoded.compute_merkle_root(), (block.header.merkle_root, false));

    let mut padded = encoded.clone();
    padded.push(0xff);
    assert_eq!(
        Block::consensus_decode(&padded),
        Err(DecodeError::TrailingBytes)
    );
    assert!(Block::consensus_decode(&encoded[..encoded.len() - 1]).is_err());
}

#[test]
fn block_with_absurd_tx_count_is_rejected() {
    let mut bytes = sample_header().consensus_encode().to_vec();
    bytes.extend_from_slice(&[0xfe, 0x00, 0x00, 0x10, 0x00]);
    assert!(Block::consensus_decode(&bytes).is_err());
}
