use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::Sha256;
use utxod_consensus::{Hash256, PubKeyHash};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let second = Sha256::digest(Sha256::digest(data));
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Double hash of two concatenated 32-byte nodes.
pub fn sha256d_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let second = Sha256::digest(hasher.finalize());
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// `ripemd160(sha256(data))`, the locking condition derived from a public key.
pub fn hash160(data: &[u8]) -> PubKeyHash {
    let digest = Ripemd160::digest(sha256(data));
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}
