use thiserror::Error;

use crate::collapsed::CollapsedTree;
use crate::hash::{hash_branch, TreeHash};

/// The ways a consistency proof can fail to verify.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyError {
    /// The old tree is larger than the new tree.
    #[error("old tree size {old_size} exceeds new tree size {new_size}")]
    SizesOutOfOrder { old_size: u64, new_size: u64 },

    /// The proof does not contain the number of hashes the two sizes
    /// require.
    #[error("proof between sizes {old_size} and {new_size} requires {expected} hashes, found {found}")]
    WrongLength {
        old_size: u64,
        new_size: u64,
        expected: usize,
        found: usize,
    },

    /// The proof recomputes an old root other than the one committed
    /// to by the old tree head.
    #[error("proof computes old root {computed}, expected {expected}")]
    OldRootMismatch {
        computed: TreeHash,
        expected: TreeHash,
    },

    /// The proof recomputes a new root other than the one committed
    /// to by the new tree head.
    #[error("proof computes new root {computed}, expected {expected}")]
    NewRootMismatch {
        computed: TreeHash,
        expected: TreeHash,
    },
}

/// Verifies an RFC 6962 consistency proof between two tree heads.
///
/// Both roots are recomputed from the proof (section 2.1.4): the proof
/// is accepted only if it reproduces `old_root` from the old tree's
/// balanced subtrees and `new_root` from those subtrees plus the proof
/// hashes covering the new entries. When `old_size == 0` or the sizes
/// are equal the proof must be empty and only root equality is checked.
pub fn verify_consistency(
    old_size: u64,
    new_size: u64,
    old_root: &TreeHash,
    new_root: &TreeHash,
    proof: &[TreeHash],
) -> Result<(), ConsistencyError> {
    if let Some(trivial) = trivial_case(old_size, new_size, old_root, new_root, proof)? {
        return trivial;
    }

    let walk = Walk::decompose(old_size, new_size, old_root, proof)?;

    let computed = walk.old_root();
    if computed != *old_root {
        return Err(ConsistencyError::OldRootMismatch {
            computed,
            expected: *old_root,
        });
    }

    let computed = walk.new_root();
    if computed != *new_root {
        return Err(ConsistencyError::NewRootMismatch {
            computed,
            expected: *new_root,
        });
    }

    Ok(())
}

impl CollapsedTree {
    /// Verifies a consistency proof and rebuilds the collapsed tree of
    /// the *old* head from it.
    ///
    /// The hashes a proof consumes while recomputing the old root are
    /// exactly the old tree's balanced subtree roots, so a verified
    /// proof from a trusted old head yields the spine needed to resume
    /// appending from `old_size`. Used to recover a download position
    /// that was bootstrapped from a bare signed tree head.
    pub fn from_consistency_proof(
        old_size: u64,
        new_size: u64,
        old_root: &TreeHash,
        new_root: &TreeHash,
        proof: &[TreeHash],
    ) -> Result<Self, ConsistencyError> {
        verify_consistency(old_size, new_size, old_root, new_root, proof)?;

        if old_size == 0 {
            return Ok(CollapsedTree::new());
        }
        if old_size == new_size {
            // The proof is empty; the only spine it can witness is a
            // single balanced subtree.
            return CollapsedTree::from_parts(vec![*old_root], old_size).map_err(|_| {
                ConsistencyError::WrongLength {
                    old_size,
                    new_size,
                    expected: old_size.count_ones() as usize,
                    found: 1,
                }
            });
        }

        let walk = Walk::decompose(old_size, new_size, old_root, proof)?;
        let spine = walk.old_spine();
        // The walk consumes one hash per set bit of old_size.
        Ok(CollapsedTree::from_parts(spine, old_size)
            .expect("a verified walk yields one subtree root per set bit of the old size"))
    }
}

fn trivial_case(
    old_size: u64,
    new_size: u64,
    old_root: &TreeHash,
    new_root: &TreeHash,
    proof: &[TreeHash],
) -> Result<Option<Result<(), ConsistencyError>>, ConsistencyError> {
    if new_size < old_size {
        return Err(ConsistencyError::SizesOutOfOrder { old_size, new_size });
    }
    if old_size == new_size || old_size == 0 {
        if !proof.is_empty() {
            return Err(ConsistencyError::WrongLength {
                old_size,
                new_size,
                expected: 0,
                found: proof.len(),
            });
        }
        if old_size == new_size && old_root != new_root {
            return Ok(Some(Err(ConsistencyError::OldRootMismatch {
                computed: *new_root,
                expected: *old_root,
            })));
        }
        return Ok(Some(Ok(())));
    }
    Ok(None)
}

/// A decomposed consistency proof: the seed subtree plus the proof
/// hashes split at the boundary between the nodes inside the new
/// tree's path to the old head and the old tree's remaining border
/// subtrees.
struct Walk<'a> {
    seed: TreeHash,
    inner: &'a [TreeHash],
    border: &'a [TreeHash],
    /// Path bits of the old head above the seed subtree: a set bit
    /// means the corresponding inner node sits to the *left* of the
    /// path and belongs to the old tree.
    mask: u64,
}

impl<'a> Walk<'a> {
    fn decompose(
        old_size: u64,
        new_size: u64,
        old_root: &TreeHash,
        proof: &'a [TreeHash],
    ) -> Result<Self, ConsistencyError> {
        let index = old_size - 1;
        let shift = old_size.trailing_zeros();
        // Number of levels below the lowest node shared by the paths
        // to the old and new heads.
        let inner_total = u64::BITS - (index ^ (new_size - 1)).leading_zeros();
        let inner = (inner_total - shift) as usize;
        let border = index.checked_shr(inner_total).unwrap_or(0).count_ones() as usize;

        // When the old tree is a single balanced subtree its root is
        // the seed and the proof does not repeat it.
        let power_of_two = old_size == 1u64 << shift;
        let start = usize::from(!power_of_two);

        if proof.len() != start + inner + border {
            return Err(ConsistencyError::WrongLength {
                old_size,
                new_size,
                expected: start + inner + border,
                found: proof.len(),
            });
        }

        let seed = if power_of_two { *old_root } else { proof[0] };
        let rest = &proof[start..];

        Ok(Self {
            seed,
            inner: &rest[..inner],
            border: &rest[inner..],
            mask: index >> shift,
        })
    }

    /// Recomputes the old root: fold in the inner nodes on the old
    /// side of the path, then every border subtree.
    fn old_root(&self) -> TreeHash {
        let mut hash = self.seed;
        for (level, node) in self.inner.iter().enumerate() {
            if (self.mask >> level) & 1 == 1 {
                hash = hash_branch(node, &hash);
            }
        }
        for node in self.border {
            hash = hash_branch(node, &hash);
        }
        hash
    }

    /// Recomputes the new root: fold in every inner node on the side
    /// the path bit dictates, then every border subtree.
    fn new_root(&self) -> TreeHash {
        let mut hash = self.seed;
        for (level, node) in self.inner.iter().enumerate() {
            if (self.mask >> level) & 1 == 1 {
                hash = hash_branch(node, &hash);
            } else {
                hash = hash_branch(&hash, node);
            }
        }
        for node in self.border {
            hash = hash_branch(node, &hash);
        }
        hash
    }

    /// The old tree's balanced subtree roots, tallest first: the
    /// hashes folded into the old root, in reverse consumption order,
    /// ending with the seed.
    fn old_spine(&self) -> Vec<TreeHash> {
        let mut lefts: Vec<TreeHash> = self
            .inner
            .iter()
            .enumerate()
            .filter(|(level, _)| (self.mask >> level) & 1 == 1)
            .map(|(_, node)| *node)
            .collect();
        lefts.extend_from_slice(self.border);
        lefts.reverse();
        lefts.push(self.seed);
        lefts
    }
}
