//! Block header and block types.

use utxod_consensus::constants::HEADER_SIZE;
use utxod_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::merkle::merkle_root;
use crate::transaction::Transaction;

pub const CURRENT_VERSION: i32 = 1;

const MIN_TX_SIZE: usize = 4 + 1 + 1 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_block);
        out[36..68].copy_from_slice(&self.merkle_root);
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Decodes a standalone header; the input must be exactly 80 bytes.
    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::UnexpectedEof);
        }
        if bytes.len() > HEADER_SIZE {
            return Err(DecodeError::TrailingBytes);
        }
        crate::encoding::decode(bytes)
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&BlockHeader::consensus_encode(self));
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE + 1 + self.transactions.len() * 128);
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Merkle root over this block's transactions and the mutation flag.
    pub fn compute_merkle_root(&self) -> (Hash256, bool) {
        merkle_root(&self.txids())
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        Encodable::consensus_encode(&self.header, encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            Encodable::consensus_encode(tx, encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = <BlockHeader as Decodable>::consensus_decode(decoder)?;
        let count = decoder.read_count(MIN_TX_SIZE)?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(<Transaction as Decodable>::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}
