//! Signature message for transaction inputs.

use utxod_consensus::Hash256;
use utxod_primitives::encoding::{Encodable, Encoder};
use utxod_primitives::hash::sha256d;
use utxod_primitives::transaction::Transaction;

/// The only supported hash type: every input and output is committed.
pub const SIGHASH_ALL: u32 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashError {
    InputIndexOutOfRange,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for SighashError {}

/// `sha256d(tx_without_authorization || input_index_le || SIGHASH_ALL_le)`.
///
/// Every input's signature and pubkey are emptied before encoding, so the
/// digest is the same whichever inputs are already signed.
pub fn signature_hash(tx: &Transaction, input_index: usize) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }
    let index = u32::try_from(input_index).map_err(|_| SighashError::InputIndexOutOfRange)?;

    let mut stripped = tx.clone();
    for input in &mut stripped.vin {
        input.signature.clear();
        input.pubkey.clear();
    }

    let mut encoder = Encoder::new();
    Encodable::consensus_encode(&stripped, &mut encoder);
    encoder.write_u32_le(index);
    encoder.write_u32_le(SIGHASH_ALL);
    Ok(sha256d(&encoder.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_primitives::outpoint::OutPoint;
    use utxod_primitives::transaction::{TxIn, TxOut};

    fn two_input_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![
                TxIn::unsigned(OutPoint::new([1u8; 32], 0)),
                TxIn::unsigned(OutPoint::new([2u8; 32], 1)),
            ],
            vout: vec![TxOut {
                value: 10,
                lock: [3u8; 20],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn digest_ignores_existing_authorization() {
        let tx = two_input_tx();
        let before = signature_hash(&tx, 1).expect("sighash");
        let mut signed = tx.clone();
        signed.vin[0].signature = vec![0x30; 70];
        signed.vin[0].pubkey = vec![0x02; 33];
        assert_eq!(signature_hash(&signed, 1).expect("sighash"), before);
    }

    #[test]
    fn digest_commits_to_index_and_outputs() {
        let tx = two_input_tx();
        let first = signature_hash(&tx, 0).expect("sighash");
        let second = signature_hash(&tx, 1).expect("sighash");
        assert_ne!(first, second);

        let mut changed = tx.clone();
        changed.vout[0].value += 1;
        assert_ne!(signature_hash(&changed, 0).expect("sighash"), first);
    }

    #[test]
    fn out_of_range_index() {
        assert_eq!(
            signature_hash(&two_input_tx(), 2),
            Err(SighashError::InputIndexOutOfRange)
        );
    }
}
