use utxod_consensus::money::Amount;
use utxod_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use utxod_primitives::outpoint::{OutPoint, OUTPOINT_SIZE};

use crate::utxo::{UtxoEntry, UTXO_ENTRY_LEN};

const BLOCK_UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    /// Entry as it was before the block spent it.
    pub entry: UtxoEntry,
}

/// What connecting one block changed in the UTXO set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UndoRecord {
    pub spent: Vec<SpentOutput>,
    pub created: Vec<OutPoint>,
    pub fees: Amount,
}

impl UndoRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(
            1 + 8
                + 10
                + self.spent.len() * (OUTPOINT_SIZE + UTXO_ENTRY_LEN)
                + self.created.len() * OUTPOINT_SIZE,
        );
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_i64_le(self.fees);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            encoder.write_bytes(&spent.entry.encode());
        }
        encoder.write_varint(self.created.len() as u64);
        for outpoint in &self.created {
            outpoint.consensus_encode(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let fees = decoder.read_i64_le()?;

        let spent_count = decoder.read_count(OUTPOINT_SIZE + UTXO_ENTRY_LEN)?;
        let mut spent = Vec::with_capacity(spent_count);
        for _ in 0..spent_count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let entry_bytes = decoder.read_fixed::<UTXO_ENTRY_LEN>()?;
            let entry = UtxoEntry::decode(&entry_bytes)?;
            spent.push(SpentOutput { outpoint, entry });
        }

        let created_count = decoder.read_count(OUTPOINT_SIZE)?;
        let mut created = Vec::with_capacity(created_count);
        for _ in 0..created_count {
            created.push(OutPoint::consensus_decode(&mut decoder)?);
        }

        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            spent,
            created,
            fees,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UndoRecord {
        UndoRecord {
            spent: vec![SpentOutput {
                outpoint: OutPoint::new([3u8; 32], 1),
                entry: UtxoEntry {
                    value: 5_000,
                    lock: [9u8; 20],
                    height: 7,
                    is_coinbase: true,
                    spent: false,
                },
            }],
            created: vec![OutPoint::new([4u8; 32], 0), OutPoint::new([4u8; 32], 1)],
            fees: 250,
        }
    }

    #[test]
    fn undo_roundtrip() {
        let undo = sample();
        let bytes = undo.encode();
        assert_eq!(bytes[0], BLOCK_UNDO_VERSION);
        assert_eq!(UndoRecord::decode(&bytes).expect("decode"), undo);
    }

    #[test]
    fn undo_rejects_unknown_version() {
        let mut bytes = sample().encode();
        bytes[0] = 9;
        assert!(matches!(
            UndoRecord::decode(&bytes),
            Err(DecodeError::InvalidData(_))
        ));
    }

    #[test]
    fn undo_rejects_truncation() {
        let bytes = sample().encode();
        assert!(UndoRecord::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
