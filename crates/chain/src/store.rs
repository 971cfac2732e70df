//! The block DAG store.

use crate::{ChainScore, ConsensusRules, ValidationError};
use forksim_types::{Block, Hash};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Result of offering a block to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Linked into the DAG.
    Accepted,

    /// Parent unknown; the block is parked in the pending pool and the
    /// missing parent should be requested from peers.
    Orphaned { missing_parent: Hash },

    /// Already stored (or already parked).
    Duplicate,

    /// Failed validation and was discarded.
    Invalid { reason: ValidationError },
}

/// Tip movement caused by an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipChange {
    pub old: Hash,
    pub new: Hash,
    pub new_score: ChainScore,
}

/// A tip change that switched branches rather than extending the old tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorg {
    /// Height of the lowest common ancestor of the old and new tips.
    pub ancestor_height: u64,
    pub old_tip: Hash,
    pub new_tip: Hash,
}

/// Everything that happened during one insert.
#[derive(Debug, Clone)]
pub struct InsertReport {
    pub outcome: InsertOutcome,
    pub tip_change: Option<TipChange>,
    pub reorg: Option<Reorg>,
    /// Heights finalised by this insert, ascending.
    pub finalized: Vec<(u64, Hash)>,
    /// Orphans adopted from the pending pool.
    pub resolved_orphans: usize,
}

impl InsertReport {
    fn of(outcome: InsertOutcome) -> Self {
        Self {
            outcome,
            tip_change: None,
            reorg: None,
            finalized: Vec::new(),
            resolved_orphans: 0,
        }
    }
}

/// Two distinct blocks recorded as final at the same height.
///
/// This is the one fatal invariant breach: the node must log it, flush its
/// event log and exit non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("finality conflict at height {height}: {existing} vs {incoming}")]
pub struct SafetyViolation {
    pub height: u64,
    pub existing: Hash,
    pub incoming: Hash,
}

/// Append-only DAG of blocks with score-driven tip selection and k-deep
/// finality tracking.
///
/// All mutation goes through [`ChainStore::insert`]; callers are expected to
/// serialise access behind a single lock.
pub struct ChainStore {
    rules: Arc<dyn ConsensusRules>,
    finality_depth: u64,

    /// hash -> block, append-only.
    blocks: HashMap<Hash, Block>,

    /// Exact inverse of `prev_hash`.
    children: HashMap<Hash, BTreeSet<Hash>>,

    /// Orphans keyed by the parent hash they are waiting for.
    pending: HashMap<Hash, Vec<Block>>,

    /// Hashes with no known children.
    tips: BTreeSet<Hash>,

    best_tip: Hash,
    genesis_hash: Hash,

    /// height -> hash for every finalised height. Monotone, never rewritten.
    finalized: BTreeMap<u64, Hash>,
    final_height: u64,
}

impl ChainStore {
    /// Create a store seeded with the genesis block.
    pub fn new(rules: Arc<dyn ConsensusRules>, finality_depth: u64) -> Self {
        let genesis = Block::genesis();
        let genesis_hash = genesis.hash;

        let mut blocks = HashMap::new();
        blocks.insert(genesis_hash, genesis);

        let mut tips = BTreeSet::new();
        tips.insert(genesis_hash);

        let mut finalized = BTreeMap::new();
        finalized.insert(0, genesis_hash);

        Self {
            rules,
            finality_depth,
            blocks,
            children: HashMap::new(),
            pending: HashMap::new(),
            tips,
            best_tip: genesis_hash,
            genesis_hash,
            finalized,
            final_height: 0,
        }
    }

    /// Offer a block to the store.
    ///
    /// On acceptance the pending pool is drained for any orphans waiting on
    /// the new block (iteratively, so a whole parked branch is adopted at
    /// once), the best tip is recomputed and the finalised prefix advanced.
    pub fn insert(&mut self, block: Block) -> Result<InsertReport, SafetyViolation> {
        if self.blocks.contains_key(&block.hash) {
            return Ok(InsertReport::of(InsertOutcome::Duplicate));
        }

        let Some(parent) = self.blocks.get(&block.prev_hash) else {
            let missing_parent = block.prev_hash;
            let parked = self.pending.entry(missing_parent).or_default();
            if parked.iter().any(|b| b.hash == block.hash) {
                return Ok(InsertReport::of(InsertOutcome::Duplicate));
            }
            debug!(block = %block.hash.short(), parent = %missing_parent.short(), "parking orphan");
            parked.push(block);
            return Ok(InsertReport::of(InsertOutcome::Orphaned { missing_parent }));
        };

        if let Err(reason) = self.rules.validate(&block, parent) {
            return Ok(InsertReport::of(InsertOutcome::Invalid { reason }));
        }

        let mut report = InsertReport::of(InsertOutcome::Accepted);
        self.link(block.clone());

        // Adopt any orphans that were waiting on this block, depth-first
        // through a worklist rather than recursion.
        let mut worklist = vec![block.hash];
        while let Some(parent_hash) = worklist.pop() {
            let Some(orphans) = self.pending.remove(&parent_hash) else {
                continue;
            };
            for orphan in orphans {
                let parent = self
                    .blocks
                    .get(&parent_hash)
                    .expect("worklist entries are linked");
                match self.rules.validate(&orphan, parent) {
                    Ok(()) => {
                        let hash = orphan.hash;
                        self.link(orphan);
                        report.resolved_orphans += 1;
                        worklist.push(hash);
                    }
                    Err(reason) => {
                        warn!(block = %orphan.hash.short(), %reason, "dropping invalid orphan");
                    }
                }
            }
        }

        let old_tip = self.best_tip;
        let (new_tip, new_score) = self.select_best_tip();
        if new_tip != old_tip {
            self.best_tip = new_tip;
            report.tip_change = Some(TipChange {
                old: old_tip,
                new: new_tip,
                new_score,
            });
            report.reorg = self.describe_reorg(old_tip, new_tip);
            report.finalized = self.advance_finality()?;
        }

        Ok(report)
    }

    fn link(&mut self, block: Block) {
        self.tips.remove(&block.prev_hash);
        self.tips.insert(block.hash);
        self.children
            .entry(block.prev_hash)
            .or_default()
            .insert(block.hash);
        self.blocks.insert(block.hash, block);
    }

    fn select_best_tip(&self) -> (Hash, ChainScore) {
        self.tips
            .iter()
            .filter_map(|tip| {
                let chain = self.chain_to(tip)?;
                Some((*tip, self.rules.score(&chain)))
            })
            .max_by_key(|(_, score)| *score)
            .expect("tip set is never empty")
    }

    fn describe_reorg(&self, old_tip: Hash, new_tip: Hash) -> Option<Reorg> {
        let new_chain = self.chain_to(&new_tip)?;
        if new_chain.iter().any(|b| b.hash == old_tip) {
            // Pure extension of the previous tip.
            return None;
        }
        let old_chain = self.chain_to(&old_tip)?;
        let shared = old_chain
            .iter()
            .zip(new_chain.iter())
            .take_while(|(a, b)| a.hash == b.hash)
            .count();
        let ancestor_height = old_chain[shared - 1].height;
        Some(Reorg {
            ancestor_height,
            old_tip,
            new_tip,
        })
    }

    /// Record every block on the best chain buried at least `finality_depth`
    /// deep. Returns newly finalised heights, ascending.
    fn advance_finality(&mut self) -> Result<Vec<(u64, Hash)>, SafetyViolation> {
        let chain = self
            .chain_to(&self.best_tip)
            .expect("best tip is always linked");
        let tip_height = chain.last().map(|b| b.height).unwrap_or(0);
        if tip_height < self.finality_depth {
            return Ok(Vec::new());
        }
        let cutoff = tip_height - self.finality_depth;

        let mut newly = Vec::new();
        for block in chain.iter().rev() {
            if block.height > cutoff {
                continue;
            }
            match self.finalized.get(&block.height) {
                Some(existing) if *existing == block.hash => break,
                Some(existing) => {
                    return Err(SafetyViolation {
                        height: block.height,
                        existing: *existing,
                        incoming: block.hash,
                    });
                }
                None => {
                    self.finalized.insert(block.height, block.hash);
                    newly.push((block.height, block.hash));
                }
            }
        }
        newly.reverse();
        if cutoff > self.final_height {
            self.final_height = cutoff;
        }
        Ok(newly)
    }

    /// Hash of the current best tip.
    pub fn current_tip(&self) -> Hash {
        self.best_tip
    }

    /// The current best tip block.
    pub fn tip_block(&self) -> &Block {
        self.blocks
            .get(&self.best_tip)
            .expect("best tip is always stored")
    }

    /// Score of the current best chain.
    pub fn tip_score(&self) -> ChainScore {
        let chain = self
            .chain_to(&self.best_tip)
            .expect("best tip is always linked");
        self.rules.score(&chain)
    }

    /// Ordered chain from genesis to the given hash, if fully linked.
    pub fn chain_to(&self, hash: &Hash) -> Option<Vec<Block>> {
        let mut chain = Vec::new();
        let mut cursor = *hash;
        loop {
            let block = self.blocks.get(&cursor)?;
            let prev = block.prev_hash;
            let genesis = block.is_genesis();
            chain.push(block.clone());
            if genesis {
                break;
            }
            cursor = prev;
        }
        chain.reverse();
        Some(chain)
    }

    /// The current best chain from genesis.
    pub fn best_chain(&self) -> Vec<Block> {
        self.chain_to(&self.best_tip)
            .expect("best tip is always linked")
    }

    /// Hash finalised at the given height, if any.
    pub fn finalized_at(&self, height: u64) -> Option<Hash> {
        self.finalized.get(&height).copied()
    }

    /// Greatest finalised height. Monotonically non-decreasing.
    pub fn final_height(&self) -> u64 {
        self.final_height
    }

    /// All finalised heights with their hashes, ascending.
    pub fn finalized_entries(&self) -> impl Iterator<Item = (u64, Hash)> + '_ {
        self.finalized.iter().map(|(h, hash)| (*h, *hash))
    }

    /// Look up a stored block.
    pub fn get(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// Whether the block is linked into the DAG.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Known children of a block, in hash order.
    pub fn children_of(&self, hash: &Hash) -> Vec<Hash> {
        self.children
            .get(hash)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of linked blocks, including genesis.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of parked orphans.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Hash of the genesis block.
    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Longest-chain rules with only structural validation, enough to
    /// exercise the store without a full engine.
    struct LengthRules;

    impl ConsensusRules for LengthRules {
        fn validate(&self, block: &Block, parent: &Block) -> Result<(), ValidationError> {
            if !block.verify_hash() {
                return Err(ValidationError::HashMismatch);
            }
            if block.height != parent.height + 1 {
                return Err(ValidationError::NonSequentialHeight {
                    parent: parent.height,
                    got: block.height,
                });
            }
            Ok(())
        }

        fn score(&self, chain: &[Block]) -> ChainScore {
            let tip = chain.last().expect("non-empty chain");
            ChainScore::new(tip.height, tip.height, tip.hash)
        }
    }

    fn store(depth: u64) -> ChainStore {
        ChainStore::new(Arc::new(LengthRules), depth)
    }

    fn child_of(parent: &Block, proposer: u32, nonce: u64) -> Block {
        Block::assemble(
            parent.height + 1,
            parent.hash,
            vec![],
            proposer,
            parent.timestamp_ms + 100,
            nonce,
        )
    }

    #[test]
    fn extends_the_chain_and_moves_the_tip() {
        let mut store = store(4);
        let b1 = child_of(store.tip_block(), 0, 0);
        let report = store.insert(b1.clone()).unwrap();
        assert_eq!(report.outcome, InsertOutcome::Accepted);
        let change = report.tip_change.unwrap();
        assert_eq!(change.new, b1.hash);
        assert!(report.reorg.is_none());
        assert_eq!(store.current_tip(), b1.hash);
        assert_eq!(store.best_chain().len(), 2);
    }

    #[test]
    fn duplicate_blocks_are_reported() {
        let mut store = store(4);
        let b1 = child_of(store.tip_block(), 0, 0);
        store.insert(b1.clone()).unwrap();
        let report = store.insert(b1).unwrap();
        assert_eq!(report.outcome, InsertOutcome::Duplicate);
    }

    #[test]
    fn orphans_wait_for_their_parent() {
        let mut store = store(4);
        let b1 = child_of(store.tip_block(), 0, 0);
        let b2 = child_of(&b1, 1, 0);

        let report = store.insert(b2.clone()).unwrap();
        assert_eq!(
            report.outcome,
            InsertOutcome::Orphaned {
                missing_parent: b1.hash
            }
        );
        assert_eq!(store.pending_count(), 1);

        let report = store.insert(b1).unwrap();
        assert_eq!(report.outcome, InsertOutcome::Accepted);
        assert_eq!(report.resolved_orphans, 1);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.current_tip(), b2.hash);
    }

    #[test]
    fn invalid_blocks_are_discarded() {
        let mut store = store(4);
        let genesis = store.tip_block().clone();
        let wrong_height = Block::assemble(5, genesis.hash, vec![], 0, 100, 0);
        let report = store.insert(wrong_height).unwrap();
        assert!(matches!(report.outcome, InsertOutcome::Invalid { .. }));
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn longer_branch_triggers_a_reorg() {
        let mut store = store(10);
        let genesis = store.tip_block().clone();

        let a1 = child_of(&genesis, 0, 1);
        store.insert(a1.clone()).unwrap();

        let b1 = child_of(&genesis, 1, 2);
        let b2 = child_of(&b1, 1, 3);
        store.insert(b1.clone()).unwrap();
        let report = store.insert(b2.clone()).unwrap();

        let change = report.tip_change.expect("tip should move to longer branch");
        assert_eq!(change.new, b2.hash);
        if change.old == a1.hash {
            let reorg = report.reorg.expect("branch switch is a reorg");
            assert_eq!(reorg.ancestor_height, 0);
            assert_eq!(reorg.old_tip, a1.hash);
        }
        assert_eq!(store.current_tip(), b2.hash);
        // The losing branch stays in the index.
        assert!(store.contains(&a1.hash));
    }

    #[test]
    fn equal_length_tie_breaks_to_smaller_hash() {
        let mut store = store(10);
        let genesis = store.tip_block().clone();
        let a = child_of(&genesis, 0, 10);
        let b = child_of(&genesis, 1, 20);
        let winner = if a.hash < b.hash { a.hash } else { b.hash };
        store.insert(a).unwrap();
        store.insert(b).unwrap();
        assert_eq!(store.current_tip(), winner);
    }

    #[test]
    fn finality_advances_k_deep_and_is_monotone() {
        let mut store = store(2);
        let mut parent = store.tip_block().clone();
        let mut hashes = vec![parent.hash];
        let mut observed_final_heights = vec![store.final_height()];

        for i in 0..5 {
            let block = child_of(&parent, 0, i);
            hashes.push(block.hash);
            store.insert(block.clone()).unwrap();
            observed_final_heights.push(store.final_height());
            parent = block;
        }

        // Tip height 5, depth 2: heights 0..=3 are final.
        assert_eq!(store.final_height(), 3);
        for h in 0..=3u64 {
            assert_eq!(store.finalized_at(h), Some(hashes[h as usize]));
        }
        assert_eq!(store.finalized_at(4), None);
        assert!(observed_final_heights.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn conflicting_finalization_is_a_safety_violation() {
        // Depth 0 finalises every tip immediately, so a fork that wins at an
        // already-finalised height must trip the invariant.
        let mut store = store(0);
        let genesis = store.tip_block().clone();

        let a = child_of(&genesis, 0, 1);
        let b = child_of(&genesis, 1, 2);
        let (first, second) = if a.hash < b.hash { (b, a) } else { (a, b) };

        store.insert(first).unwrap();
        // `second` has the smaller hash and wins the tie break, forcing a
        // re-finalisation of height 1 with a different block.
        let violation = store.insert(second).unwrap_err();
        assert_eq!(violation.height, 1);
        // The store refused; the original finalisation stands.
        assert_eq!(store.final_height(), 1);
    }

    #[test]
    fn chain_to_unknown_hash_is_none() {
        let store = store(4);
        assert!(store.chain_to(&Hash::digest(b"missing")).is_none());
    }

    #[test]
    fn children_index_is_the_inverse_of_prev_hash() {
        let mut store = store(10);
        let genesis = store.tip_block().clone();
        let a = child_of(&genesis, 0, 1);
        let b = child_of(&genesis, 1, 2);
        let c = child_of(&a, 0, 3);
        for block in [a.clone(), b.clone(), c.clone()] {
            store.insert(block).unwrap();
        }

        let mut genesis_children = store.children_of(&genesis.hash);
        genesis_children.sort();
        let mut expected = vec![a.hash, b.hash];
        expected.sort();
        assert_eq!(genesis_children, expected);
        assert_eq!(store.children_of(&a.hash), vec![c.hash]);
        assert!(store.children_of(&c.hash).is_empty());
    }
}
