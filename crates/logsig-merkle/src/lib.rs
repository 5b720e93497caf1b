// crates/logsig-merkle/src/lib.rs

//! Incremental Merkle aggregation over a stream of log records.
//!
//! Every record becomes one blinded leaf:
//! - record hash `r = H(record)`
//! - mask `m = H(imprint(x_prev) || IV)` where `x_prev` is the previous leaf
//!   (or the previous block's closing hash for the first leaf)
//! - leaf `x = H(0x01 || imprint(m) || imprint(r))`
//!
//! Leaves go into a [`Forest`] that behaves like a binary counter: slot `j`
//! holds the root of a perfect subtree of `2^j` leaves, and inserting a leaf
//! carries upward through occupied slots. Combining two roots in slot `j`
//! yields `H(j + 2 || imprint(left) || imprint(right))`; the level byte keeps
//! nodes from different depths from being swapped for one another.
//!
//! [`Aggregator::close`] folds the surviving roots, lowest slot first, into the
//! block's final root.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

use logsig_core::{LogSigError, Result};
use logsig_crypto::{HashAlgorithm, Imprint};

/// Slots in a forest; bounds a block to `2^64 - 1` leaves.
pub const MAX_ROOTS: usize = 64;

/// Level byte of a leaf.
pub const LEAF_LEVEL: u8 = 1;

/// Domain prefix for block IV derivation.
pub const IV_DOMAIN: &[u8] = b"LOGSIG-IV";

/// Blinding IV for a block, derived from the previous block's last hash.
#[must_use]
pub fn derive_iv(alg: HashAlgorithm, prev_last_hash: &Imprint) -> Vec<u8> {
    let mut h = alg.hasher();
    h.update(IV_DOMAIN);
    h.update_imprint(prev_last_hash);
    h.finalize().digest
}

/// `m = H(imprint(x_prev) || iv)`.
#[must_use]
pub fn mask_hash(alg: HashAlgorithm, x_prev: &Imprint, iv: &[u8]) -> Imprint {
    let mut h = alg.hasher();
    h.update_imprint(x_prev);
    h.update(iv);
    h.finalize()
}

/// `H(level || imprint(left) || imprint(right))`.
#[must_use]
pub fn node_hash(alg: HashAlgorithm, level: u8, left: &Imprint, right: &Imprint) -> Imprint {
    let mut h = alg.hasher();
    h.update(&[level]);
    h.update_imprint(left);
    h.update_imprint(right);
    h.finalize()
}

/// Blinded leaf over a mask and a record hash.
#[must_use]
pub fn leaf_hash(alg: HashAlgorithm, mask: &Imprint, record_hash: &Imprint) -> Imprint {
    node_hash(alg, LEAF_LEVEL, mask, record_hash)
}

/// Level byte of a node produced in `slot`.
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn slot_level(slot: usize) -> u8 {
    // slot < MAX_ROOTS, so this fits
    (slot + 2) as u8
}

/// Bounded set of perfect-subtree roots, one per level.
///
/// Invariant: bit `j` of [`occupancy`](Self::occupancy) is set iff slot `j`
/// holds a root, and after `n` inserts into an empty forest `occupancy == n`.
#[derive(Clone, Debug)]
pub struct Forest {
    slots: [Option<Imprint>; MAX_ROOTS],
    occupied: u64,
}

impl Default for Forest {
    fn default() -> Self {
        Self::new()
    }
}

impl Forest {
    /// Empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            occupied: 0,
        }
    }

    /// Bitmask of occupied slots.
    #[must_use]
    pub const fn occupancy(&self) -> u64 {
        self.occupied
    }

    /// Number of live roots.
    #[must_use]
    pub const fn live_roots(&self) -> u32 {
        self.occupied.count_ones()
    }

    /// No roots held.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Root held in `slot`, if any.
    #[must_use]
    pub fn root(&self, slot: usize) -> Option<&Imprint> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Occupied `(slot, root)` pairs, lowest slot first.
    pub fn roots(&self) -> impl Iterator<Item = (usize, &Imprint)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(j, r)| r.as_ref().map(|r| (j, r)))
    }

    /// Insert a leaf, appending every interior node created on the way up to
    /// `nodes` (lowest first).
    ///
    /// # Errors
    /// [`LogSigError::ResourceExhausted`] if all slots are occupied.
    pub fn insert(
        &mut self,
        alg: HashAlgorithm,
        leaf: Imprint,
        nodes: &mut Vec<Imprint>,
    ) -> Result<()> {
        if self.occupied == u64::MAX {
            return Err(LogSigError::ResourceExhausted(format!(
                "merkle forest holds {MAX_ROOTS} roots"
            )));
        }
        let mut carry = leaf;
        for (j, slot) in self.slots.iter_mut().enumerate() {
            match slot.take() {
                None => {
                    *slot = Some(carry);
                    self.occupied |= 1 << j;
                    return Ok(());
                }
                Some(left) => {
                    self.occupied &= !(1 << j);
                    carry = node_hash(alg, slot_level(j), &left, &carry);
                    nodes.push(carry.clone());
                }
            }
        }
        Err(LogSigError::ResourceExhausted("merkle forest overflow".into()))
    }

    /// Merge all roots into one and empty the forest. `None` if it was empty.
    pub fn close(&mut self, alg: HashAlgorithm) -> Option<Imprint> {
        let mut acc: Option<Imprint> = None;
        for (j, slot) in self.slots.iter_mut().enumerate() {
            let Some(root) = slot.take() else { continue };
            acc = Some(match acc {
                None => root,
                Some(newer) => node_hash(alg, slot_level(j), &root, &newer),
            });
        }
        self.occupied = 0;
        acc
    }

    /// Drop every root.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.occupied = 0;
    }
}

/// Hashes produced by folding one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldStep {
    /// `H(record)`.
    pub record_hash: Imprint,
    /// Blinding mask used for this leaf.
    pub mask: Imprint,
    /// Blinded leaf.
    pub leaf: Imprint,
    /// Interior nodes created while carrying the leaf upward.
    pub nodes: Vec<Imprint>,
}

impl FoldStep {
    /// Leaf followed by the new nodes, in the order they are stored as tree hashes.
    pub fn tree_hashes(&self) -> impl Iterator<Item = &Imprint> + '_ {
        std::iter::once(&self.leaf).chain(self.nodes.iter())
    }
}

/// Per-block aggregation state: forest, IV and the chaining value.
#[derive(Clone, Debug)]
pub struct Aggregator {
    alg: HashAlgorithm,
    iv: Vec<u8>,
    x_prev: Imprint,
    forest: Forest,
    leaves: u64,
}

impl Aggregator {
    /// Aggregator with an explicit IV (as read back from a block signature).
    #[must_use]
    pub fn new(alg: HashAlgorithm, iv: Vec<u8>, x_prev: Imprint) -> Self {
        Self {
            alg,
            iv,
            x_prev,
            forest: Forest::new(),
            leaves: 0,
        }
    }

    /// Aggregator for a new block chained to `carry` (the previous block's
    /// last hash, or the zero imprint for a fresh chain).
    #[must_use]
    pub fn for_block(alg: HashAlgorithm, carry: &Imprint) -> Self {
        Self::new(alg, derive_iv(alg, carry), carry.clone())
    }

    /// Fold one record into the forest.
    ///
    /// # Errors
    /// [`LogSigError::ResourceExhausted`] once `u64::MAX` leaves are held.
    pub fn fold(&mut self, record: &[u8]) -> Result<FoldStep> {
        if self.leaves == u64::MAX {
            return Err(LogSigError::ResourceExhausted(
                "block leaf counter exhausted".into(),
            ));
        }
        let record_hash = self.alg.digest(record);
        let mask = mask_hash(self.alg, &self.x_prev, &self.iv);
        let leaf = leaf_hash(self.alg, &mask, &record_hash);
        let mut nodes = Vec::new();
        self.forest.insert(self.alg, leaf.clone(), &mut nodes)?;
        self.x_prev = leaf.clone();
        self.leaves += 1;
        Ok(FoldStep {
            record_hash,
            mask,
            leaf,
            nodes,
        })
    }

    /// Final root of the block. The forest is emptied and the root becomes
    /// the chaining value for whatever follows. `None` if nothing was folded.
    pub fn close(&mut self) -> Option<Imprint> {
        let root = self.forest.close(self.alg)?;
        self.x_prev = root.clone();
        self.leaves = 0;
        Some(root)
    }

    /// Hash algorithm in use.
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.alg
    }

    /// Blinding IV of this block.
    #[must_use]
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Current chaining value.
    #[must_use]
    pub const fn x_prev(&self) -> &Imprint {
        &self.x_prev
    }

    /// Leaves folded since the block started.
    #[must_use]
    pub const fn leaf_count(&self) -> u64 {
        self.leaves
    }

    /// Read-only view of the forest.
    #[must_use]
    pub const fn forest(&self) -> &Forest {
        &self.forest
    }
}
