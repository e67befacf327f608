use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey};
use utxod_consensus::PubKeyHash;
use utxod_primitives::hash::hash160;
use utxod_primitives::transaction::Transaction;

use crate::secp::{secp256k1_full, secp256k1_verify};
use crate::sighash::{signature_hash, SighashError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Sighash(SighashError),
    SignatureEncoding,
    /// S above half the curve order; the low-S twin is the only accepted form.
    HighS,
    PubkeyEncoding,
    Invalid,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Sighash(err) => write!(f, "{err}"),
            SignatureError::SignatureEncoding => write!(f, "signature is not valid DER"),
            SignatureError::HighS => write!(f, "signature s value is not low"),
            SignatureError::PubkeyEncoding => write!(f, "pubkey is not a valid secp256k1 point"),
            SignatureError::Invalid => write!(f, "signature does not verify"),
        }
    }
}

impl std::error::Error for SignatureError {}

impl From<SighashError> for SignatureError {
    fn from(err: SighashError) -> Self {
        SignatureError::Sighash(err)
    }
}

/// Locking condition an output must carry to be spendable with `pubkey`.
pub fn lock_for_pubkey(pubkey: &[u8]) -> PubKeyHash {
    hash160(pubkey)
}

/// Checks the signature of input `input_index` against its own pubkey.
///
/// Whether that pubkey is the one the spent output was locked to is checked
/// when the input is resolved against the UTXO set.
pub fn verify_input(tx: &Transaction, input_index: usize) -> Result<(), SignatureError> {
    let sighash = signature_hash(tx, input_index)?;
    let input = &tx.vin[input_index];

    let sig = Signature::from_der(&input.signature).map_err(|_| {
        utxod_log::log_trace!(
            "invalid DER signature on input {input_index} (len {})",
            input.signature.len()
        );
        SignatureError::SignatureEncoding
    })?;
    let mut normalized = sig;
    normalized.normalize_s();
    if normalized != sig {
        return Err(SignatureError::HighS);
    }

    let pubkey = PublicKey::from_slice(&input.pubkey).map_err(|_| SignatureError::PubkeyEncoding)?;
    let msg = Message::from_digest(sighash);
    secp256k1_verify()
        .verify_ecdsa(&msg, &sig, &pubkey)
        .map_err(|_| SignatureError::Invalid)
}

/// Signs input `input_index` with `secret`, filling in its DER signature and
/// compressed pubkey.
pub fn sign_input(
    tx: &mut Transaction,
    input_index: usize,
    secret: &SecretKey,
) -> Result<(), SignatureError> {
    let sighash = signature_hash(tx, input_index)?;
    let secp = secp256k1_full();
    let msg = Message::from_digest(sighash);
    let sig = secp.sign_ecdsa(&msg, secret);
    let pubkey = PublicKey::from_secret_key(secp, secret);

    let input = &mut tx.vin[input_index];
    input.signature = sig.serialize_der().to_vec();
    input.pubkey = pubkey.serialize().to_vec();
    Ok(())
}
