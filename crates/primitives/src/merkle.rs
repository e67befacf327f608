//! Transaction merkle tree.

use utxod_consensus::Hash256;

use crate::hash::sha256d_pair;

/// Computes the merkle root over `txids`, pairing the last node with itself on
/// odd layers. The flag reports a layer whose final pair holds two identical
/// nodes: such a tree has the same root as a shorter transaction list, so a
/// block carrying it must be rejected without marking the hash as invalid.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        for start in (0..size).step_by(2) {
            let left = &layer[start];
            let right = if start + 1 < size {
                if start + 2 == size && layer[start] == layer[start + 1] {
                    mutated = true;
                }
                &layer[start + 1]
            } else {
                left
            };
            next.push(sha256d_pair(left, right));
        }
        layer = next;
    }
    (layer[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::merkle_root;
    use crate::hash::sha256d_pair;

    fn hash(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn single_txid_is_its_own_root() {
        let (root, mutated) = merkle_root(&[hash(7)]);
        assert_eq!(root, hash(7));
        assert!(!mutated);
    }

    #[test]
    fn odd_layer_duplicates_last() {
        let (root, _) = merkle_root(&[hash(1), hash(2), hash(3)]);
        let expected = sha256d_pair(
            &sha256d_pair(&hash(1), &hash(2)),
            &sha256d_pair(&hash(3), &hash(3)),
        );
        assert_eq!(root, expected);
    }

    #[test]
    fn mutation_only_on_last_pair() {
        let (_, mutated) = merkle_root(&[hash(1), hash(1), hash(2), hash(3)]);
        assert!(!mutated, "non-terminal duplicate should not mark mutation");
    }

    #[test]
    fn mutation_detects_terminal_pair() {
        let (_, mutated) = merkle_root(&[hash(1), hash(2), hash(3), hash(3)]);
        assert!(mutated, "terminal duplicate should mark mutation");
    }

    #[test]
    fn mutated_tree_collides_with_odd_tree() {
        let (short, short_mutated) = merkle_root(&[hash(1), hash(2), hash(3)]);
        let (long, long_mutated) = merkle_root(&[hash(1), hash(2), hash(3), hash(3)]);
        assert_eq!(short, long);
        assert!(!short_mutated);
        assert!(long_mutated);
    }
}
