//! Input authorization: signature hashing and secp256k1 checks.

mod secp;
pub mod sighash;
pub mod verify;

pub use sighash::{signature_hash, SighashError, SIGHASH_ALL};
pub use verify::{lock_for_pubkey, sign_input, verify_input, SignatureError};
