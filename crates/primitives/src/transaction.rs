//! Transaction types and serialization.

use utxod_consensus::money::{money_range, Amount};
use utxod_consensus::{Hash256, PubKeyHash};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::{OutPoint, OUTPOINT_SIZE};

pub const CURRENT_TX_VERSION: i32 = 1;
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

const MIN_TXIN_SIZE: usize = OUTPOINT_SIZE + 1 + 1 + 4;
const TXOUT_SIZE: usize = 8 + 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    /// DER-encoded ECDSA signature over the input's signature hash.
    pub signature: Vec<u8>,
    /// Serialized secp256k1 public key whose hash160 must match the spent lock.
    pub pubkey: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn unsigned(prevout: OutPoint) -> Self {
        Self {
            prevout,
            signature: Vec::new(),
            pubkey: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.signature);
        encoder.write_var_bytes(&self.pubkey);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let signature = decoder.read_var_bytes()?;
        let pubkey = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            signature,
            pubkey,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub lock: PubKeyHash,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_bytes(&self.lock);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let lock = decoder.read_fixed::<20>()?;
        Ok(Self { value, lock })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Builds the reward transaction for `height`. The height goes into
    /// `lock_time` so that two coinbases paying the same outputs still get
    /// distinct txids.
    pub fn coinbase(height: u32, outputs: Vec<TxOut>) -> Self {
        Self {
            version: CURRENT_TX_VERSION,
            vin: Vec::new(),
            vout: outputs,
            lock_time: height,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.is_empty()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    /// Sum of output values, `None` if any value or the running total leaves
    /// the money range.
    pub fn total_output_value(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_count(MIN_TXIN_SIZE)?;
        let mut vin = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_count(TXOUT_SIZE)?;
        let mut vout = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_consensus::money::{COIN, MAX_MONEY};

    #[test]
    fn coinbase_txids_differ_by_height() {
        let outputs = vec![TxOut {
            value: 50 * COIN,
            lock: [7u8; 20],
        }];
        let first = Transaction::coinbase(1, outputs.clone());
        let second = Transaction::coinbase(2, outputs);
        assert!(first.is_coinbase());
        assert_ne!(first.txid(), second.txid());
    }

    #[test]
    fn output_total_rejects_overflow() {
        let mut tx = Transaction::coinbase(
            0,
            vec![
                TxOut {
                    value: MAX_MONEY,
                    lock: [0u8; 20],
                },
                TxOut {
                    value: 1,
                    lock: [0u8; 20],
                },
            ],
        );
        assert_eq!(tx.total_output_value(), None);
        tx.vout.pop();
        assert_eq!(tx.total_output_value(), Some(MAX_MONEY));
        tx.vout[0].value = -1;
        assert_eq!(tx.total_output_value(), None);
    }
}
