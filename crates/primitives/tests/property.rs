use utxod_consensus::Hash256;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::encoding::{decode, encode};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u8(&mut self) -> u8 {
        (self.next_u64() >> 56) as u8
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn random_hash(rng: &mut Lcg) -> Hash256 {
    std::array::from_fn(|_| rng.next_u8())
}

fn random_vec(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    (0..len).map(|_| rng.next_u8()).collect()
}

fn random_header(rng: &mut Lcg) -> BlockHeader {
    BlockHeader {
        version: rng.next_u32() as i32,
        prev_block: random_hash(rng),
        merkle_root: random_hash(rng),
        time: rng.next_u32(),
        bits: rng.next_u32(),
        nonce: rng.next_u32(),
    }
}

fn random_tx(rng: &mut Lcg) -> Transaction {
    let vin = (0..rng.gen_range(4))
        .map(|_| TxIn {
            prevout: OutPoint::new(random_hash(rng), rng.next_u32()),
            signature: random_vec(rng, 72),
            pubkey: random_vec(rng, 65),
            sequence: rng.next_u32(),
        })
        .collect();
    let vout = (0..rng.gen_range(4))
        .map(|_| TxOut {
            value: rng.next_u64() as i64,
            lock: std::array::from_fn(|_| rng.next_u8()),
        })
        .collect();
    Transaction {
        version: rng.next_u32() as i32,
        vin,
        vout,
        lock_time: rng.next_u32(),
    }
}

#[test]
fn header_decode_inverts_encode() {
    let mut rng = Lcg::new(0x5eed_0001);
    for _ in 0..512 {
        let header = random_header(&mut rng);
        let bytes = header.consensus_encode();
        let decoded = BlockHeader::consensus_decode(&bytes).expect("decode header");
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }
}

#[test]
fn block_decode_inverts_encode() {
    let mut rng = Lcg::new(0x5eed_0002);
    for _ in 0..64 {
        let transactions = (0..1 + rng.gen_range(5)).map(|_| random_tx(&mut rng)).collect();
        let block = Block {
            header: random_header(&mut rng),
            transactions,
        };
        let bytes = encode(&block);
        let decoded: Block = decode(&bytes).expect("decode block");
        assert_eq!(decoded, block);
        assert_eq!(decoded.txids(), block.txids());
    }
}

#[test]
fn truncated_blocks_never_decode() {
    let mut rng = Lcg::new(0x5eed_0003);
    for _ in 0..32 {
        let block = Block {
            header: random_header(&mut rng),
            transactions: vec![random_tx(&mut rng), random_tx(&mut rng)],
        };
        let bytes = block.consensus_encode();
        let cut = rng.gen_range(bytes.len());
        assert!(Block::consensus_decode(&bytes[..cut]).is_err());
    }
}
