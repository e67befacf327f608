//! Block, transaction and outpoint types with their consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use encoding::{decode, encode, DecodeError};
pub use hash::{hash160, sha256, sha256d};
pub use merkle::merkle_root;
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
