//! Merkle branch construction for Stratum jobs.
//!
//! Miners only ever see the coinbase transaction, so jobs carry the sibling
//! hashes needed to fold a coinbase hash up to the merkle root. The coinbase
//! slot is tracked as a placeholder while the tree is reduced; odd layers
//! duplicate their last element, per consensus rules.

use crate::encoding::double_sha256;

/// Build the merkle branches for the coinbase slot from the non-coinbase
/// transaction hashes (header byte order).
pub fn coinbase_branches(txid_leaves: &[[u8; 32]]) -> Vec<[u8; 32]> {
    if txid_leaves.is_empty() {
        return Vec::new();
    }

    let mut layer: Vec<Option<[u8; 32]>> = Vec::with_capacity(txid_leaves.len() + 1);
    layer.push(None);
    layer.extend(txid_leaves.iter().copied().map(Some));

    let mut branches = Vec::new();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = layer[layer.len() - 1];
            layer.push(last);
        }

        // The placeholder stays at index 0, so its sibling is always index 1.
        if let Some(sibling) = layer[1] {
            branches.push(sibling);
        }

        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks(2) {
            next.push(match (pair[0], pair[1]) {
                (Some(left), Some(right)) => Some(hash_pair(&left, &right)),
                _ => None,
            });
        }
        layer = next;
    }
    branches
}

/// Fold a coinbase transaction hash up to the merkle root using
/// previously built branches.
pub fn root_from_branches(coinbase_hash: [u8; 32], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut hash = coinbase_hash;
    for branch in branches {
        hash = hash_pair(&hash, branch);
    }
    hash
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    double_sha256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference full-tree computation over all transactions, coinbase
    // included, with standard odd-layer duplication.
    fn full_tree_root(hashes: &[[u8; 32]]) -> [u8; 32] {
        let mut layer: Vec<[u8; 32]> = hashes.to_vec();
        while layer.len() > 1 {
            if layer.len() % 2 == 1 {
                let last = layer[layer.len() - 1];
                layer.push(last);
            }
            layer = layer
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
        }
        layer[0]
    }

    fn leaf(n: u8) -> [u8; 32] {
        double_sha256(&[n])
    }

    #[test]
    fn empty_tree_has_no_branches() {
        assert!(coinbase_branches(&[]).is_empty());
        let coinbase = leaf(0);
        assert_eq!(root_from_branches(coinbase, &[]), coinbase);
    }

    #[test]
    fn branches_reproduce_full_tree_root() {
        let coinbase = leaf(0xcb);
        for count in 1..=9usize {
            let leaves: Vec<[u8; 32]> = (1..=count as u8).map(leaf).collect();
            let branches = coinbase_branches(&leaves);

            let mut all = vec![coinbase];
            all.extend_from_slice(&leaves);
            let expected = full_tree_root(&all);

            assert_eq!(
                root_from_branches(coinbase, &branches),
                expected,
                "mismatch at {count} leaves"
            );
        }
    }

    #[test]
    fn single_leaf_branch_is_the_leaf() {
        let only = leaf(7);
        assert_eq!(coinbase_branches(&[only]), vec![only]);
    }
}
