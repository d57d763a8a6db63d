use std::sync::Arc;

use im::OrdMap;
use types::{
    containers::{BlockRecord, Checkpoint, StateRecord},
    fork_choice::{ForkChoiceDag, ForkChoiceNode},
    primitives::{Slot, H256},
};

use crate::store_config::StoreConfig;

/// Incremented on every mutation of [`RecentChainData`].
///
/// [`RecentChainData`]: crate::RecentChainData
pub type Generation = u64;

/// Immutable view of recent chain data at one generation.
///
/// Cloning is cheap. All collections are persistent.
#[derive(Clone, Debug)]
pub struct Store {
    generation: Generation,
    head: H256,
    justified: Checkpoint,
    finalized: Checkpoint,
    fork_choice: ForkChoiceDag,
    // Recent blocks and states by block root and state root respectively.
    // The head and the finalized block are never evicted.
    blocks: OrdMap<H256, Arc<BlockRecord>>,
    states: OrdMap<H256, Arc<StateRecord>>,
}

impl Store {
    pub(crate) fn new(
        generation: Generation,
        finalized_block: BlockRecord,
        justified: Checkpoint,
        finalized: Checkpoint,
    ) -> Self {
        let root_node = ForkChoiceNode::new(
            finalized_block.root,
            finalized_block.parent_root,
            finalized_block.slot,
            0,
        );

        Self {
            generation,
            head: finalized_block.root,
            justified,
            finalized,
            fork_choice: ForkChoiceDag::new(root_node),
            blocks: OrdMap::unit(finalized_block.root, Arc::new(finalized_block)),
            states: OrdMap::new(),
        }
    }

    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub const fn head(&self) -> H256 {
        self.head
    }

    #[must_use]
    pub const fn justified_checkpoint(&self) -> Checkpoint {
        self.justified
    }

    #[must_use]
    pub const fn finalized_checkpoint(&self) -> Checkpoint {
        self.finalized
    }

    #[must_use]
    pub fn finalized_slot(&self) -> Slot {
        self.fork_choice.root_node().slot
    }

    #[must_use]
    pub const fn fork_choice(&self) -> &ForkChoiceDag {
        &self.fork_choice
    }

    #[must_use]
    pub fn head_node(&self) -> Option<&ForkChoiceNode> {
        self.fork_choice.get(self.head)
    }

    #[must_use]
    pub fn block(&self, block_root: H256) -> Option<&Arc<BlockRecord>> {
        self.blocks.get(&block_root)
    }

    #[must_use]
    pub fn state(&self, state_root: H256) -> Option<&Arc<StateRecord>> {
        self.states.get(&state_root)
    }

    #[must_use]
    pub fn state_by_block_root(&self, block_root: H256) -> Option<&Arc<StateRecord>> {
        let block = self.blocks.get(&block_root)?;
        self.states.get(&block.state_root)
    }

    #[must_use]
    pub fn recent_block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn recent_state_count(&self) -> usize {
        self.states.len()
    }

    /// Root of the block at `slot` on the chain ending at the head.
    ///
    /// Returns `None` for slots before the finalized block and for empty slots.
    #[must_use]
    pub fn canonical_root_at_slot(&self, slot: Slot) -> Option<H256> {
        self.fork_choice
            .ancestors(self.head)
            .take_while(|node| node.slot >= slot)
            .find(|node| node.slot == slot)
            .map(|node| node.root)
    }

    /// Nodes of the chain ending at the head with slots in `start..end`, in ascending slot order.
    #[must_use]
    pub fn canonical_nodes(&self, start: Slot, end: Slot) -> Vec<ForkChoiceNode> {
        let mut nodes = self
            .fork_choice
            .ancestors(self.head)
            .take_while(|node| node.slot >= start)
            .filter(|node| node.slot < end)
            .copied()
            .collect::<Vec<_>>();

        nodes.reverse();
        nodes
    }

    /// Returns `None` if the block is unknown to this generation.
    #[must_use]
    pub fn is_canonical(&self, block_root: H256) -> Option<bool> {
        self.fork_choice
            .contains(block_root)
            .then(|| self.fork_choice.is_descendant(block_root, self.head))
    }

    pub(crate) fn next_generation(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }

    pub(crate) fn set_head(&mut self, head: H256) {
        self.head = head;
    }

    pub(crate) fn set_checkpoints(&mut self, justified: Checkpoint, finalized: Checkpoint) {
        self.justified = justified;
        self.finalized = finalized;
    }

    pub(crate) fn set_fork_choice(&mut self, fork_choice: ForkChoiceDag) {
        self.fork_choice = fork_choice;
    }

    pub(crate) fn fork_choice_mut(&mut self) -> &mut ForkChoiceDag {
        &mut self.fork_choice
    }

    pub(crate) fn insert_block(&mut self, block: BlockRecord) {
        self.blocks.insert(block.root, Arc::new(block));
    }

    pub(crate) fn insert_state(&mut self, state: StateRecord) {
        self.states.insert(state.state_root, Arc::new(state));
    }

    // Drops blocks and states that are no longer in the fork-choice DAG
    // and then the oldest ones beyond the limits in `config`.
    pub(crate) fn trim(&mut self, config: &StoreConfig) {
        let fork_choice = &self.fork_choice;

        self.blocks.retain(|root, _| fork_choice.contains(*root));
        self.states
            .retain(|_, state| fork_choice.contains(state.block_root));

        let protected_blocks = [self.head, self.finalized.root];

        evict_oldest(
            &mut self.blocks,
            config.max_recent_blocks + protected_blocks.len(),
            |block| block.slot,
            |root| protected_blocks.contains(root),
        );

        let protected_states = protected_blocks
            .iter()
            .filter_map(|root| self.blocks.get(root))
            .map(|block| block.state_root)
            .collect::<Vec<_>>();

        evict_oldest(
            &mut self.states,
            config.max_recent_states + protected_states.len(),
            |state| state.slot,
            |root| protected_states.contains(root),
        );
    }
}

fn evict_oldest<V>(
    map: &mut OrdMap<H256, Arc<V>>,
    limit: usize,
    slot: impl Fn(&V) -> Slot,
    protected: impl Fn(&H256) -> bool,
) {
    while map.len() > limit {
        let oldest = map
            .iter()
            .filter(|(root, _)| !protected(root))
            .min_by_key(|(root, value)| (slot(value), **root))
            .map(|(root, _)| *root);

        let Some(root) = oldest else {
            return;
        };

        map.remove(&root);
    }
}
