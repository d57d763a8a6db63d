use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use chain_storage::PruneSummary;
use recent_chain_data::RecentChainData;
use types::{
    config::Config,
    consts::{GENESIS_SLOT, ZERO_ROOT},
    containers::{AnchorState, BlockRecord, Checkpoint, StateRecord},
    primitives::{Epoch, Slot, H256},
};

/// Deterministically generates a chain of blocks and states.
///
/// Chains built with the same `fork` and the same slots consist of identical records.
/// Forks of one chain share their common prefix and differ after it.
#[derive(Clone, Debug)]
pub struct ChainBuilder {
    config: Arc<Config>,
    fork: u64,
    blocks: Vec<(BlockRecord, StateRecord)>,
}

impl ChainBuilder {
    /// Starts a chain with a genesis block at slot 0.
    #[must_use]
    pub fn genesis(config: Arc<Config>) -> Self {
        let (block, state) = generate(ZERO_ROOT, GENESIS_SLOT, 0);

        Self {
            config,
            fork: 0,
            blocks: vec![(block, state)],
        }
    }

    /// Copies the chain. Blocks generated on the copy differ from blocks generated on `self`.
    #[must_use]
    pub fn fork(&self, fork: u64) -> Self {
        Self {
            fork,
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn anchor(&self) -> Result<AnchorState> {
        let (block, state) = self.blocks[0].clone();
        AnchorState::new(block, state)
    }

    #[must_use]
    pub fn latest(&self) -> &BlockRecord {
        let (block, _) = self.latest_pair();
        block
    }

    #[must_use]
    pub fn latest_state(&self) -> &StateRecord {
        let (_, state) = self.latest_pair();
        state
    }

    #[must_use]
    pub fn block_at_slot(&self, slot: Slot) -> Option<&BlockRecord> {
        self.blocks
            .iter()
            .map(|(block, _)| block)
            .find(|block| block.slot == slot)
    }

    /// The latest block at or before `slot`.
    #[must_use]
    pub fn block_at_or_before_slot(&self, slot: Slot) -> Option<&BlockRecord> {
        self.blocks
            .iter()
            .map(|(block, _)| block)
            .take_while(|block| block.slot <= slot)
            .last()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.iter().map(|(block, _)| block)
    }

    /// Appends a block at `slot` on top of the latest block.
    pub fn generate_block_at_slot(&mut self, slot: Slot) -> Result<(BlockRecord, StateRecord)> {
        let parent = self.latest();

        ensure!(
            slot > parent.slot,
            "block at slot {slot} cannot follow block at slot {}",
            parent.slot,
        );

        let pair = generate(parent.root, slot, self.fork);
        self.blocks.push(pair.clone());

        Ok(pair)
    }

    pub fn generate_next_block(&mut self) -> Result<(BlockRecord, StateRecord)> {
        self.generate_block_at_slot(self.latest().slot + 1)
    }

    /// Appends a block at every slot after the latest block up to and including `slot`.
    pub fn generate_blocks_up_to_slot(
        &mut self,
        slot: Slot,
    ) -> Result<Vec<(BlockRecord, StateRecord)>> {
        let start = self.latest().slot + 1;

        (start..=slot)
            .map(|slot| self.generate_block_at_slot(slot))
            .collect()
    }

    fn latest_pair(&self) -> &(BlockRecord, StateRecord) {
        self.blocks
            .last()
            .expect("chain always contains at least the genesis block")
    }
}

/// Feeds blocks generated by a [`ChainBuilder`] into [`RecentChainData`].
///
/// Every imported block weighs as much as its slot, so the latest block on the longest chain
/// is always the heaviest.
pub struct ChainUpdater {
    recent_chain_data: Arc<RecentChainData>,
    chain_builder: ChainBuilder,
}

impl ChainUpdater {
    #[must_use]
    pub const fn new(recent_chain_data: Arc<RecentChainData>, chain_builder: ChainBuilder) -> Self {
        Self {
            recent_chain_data,
            chain_builder,
        }
    }

    #[must_use]
    pub const fn chain_builder(&self) -> &ChainBuilder {
        &self.chain_builder
    }

    pub fn initialize_genesis(&self) -> Result<()> {
        self.recent_chain_data
            .initialize_from_anchor(&self.chain_builder.anchor()?)
    }

    /// Generates and imports a block at `slot` and makes it the head if it outweighs the head.
    pub fn advance_chain(&mut self, slot: Slot) -> Result<BlockRecord> {
        let (block, state) = self.chain_builder.generate_block_at_slot(slot)?;
        self.save_block(block.clone(), state)?;
        Ok(block)
    }

    pub fn advance_chain_until(&mut self, slot: Slot) -> Result<Vec<BlockRecord>> {
        let start = self.chain_builder.latest().slot + 1;

        (start..=slot)
            .map(|slot| self.advance_chain(slot))
            .collect()
    }

    /// Imports a block generated elsewhere, such as on a fork of the builder.
    pub fn save_block(&self, block: BlockRecord, state: StateRecord) -> Result<()> {
        let root = block.root;
        let weight = block.slot;

        self.recent_chain_data
            .import_block(block, Some(state), weight)?;
        self.recent_chain_data.update_head(root)?;

        Ok(())
    }

    /// Finalizes the latest block at or before the start of `epoch`.
    ///
    /// The justified checkpoint is moved to the same block.
    pub fn finalize_epoch(&self, epoch: Epoch) -> Result<PruneSummary> {
        let checkpoint = self.checkpoint_at_epoch(epoch)?;

        self.recent_chain_data
            .apply_checkpoints(checkpoint, checkpoint)
    }

    pub fn checkpoint_at_epoch(&self, epoch: Epoch) -> Result<Checkpoint> {
        let start_slot = self.chain_builder.config().start_slot(epoch);

        let block = self
            .chain_builder
            .block_at_or_before_slot(start_slot)
            .ok_or_else(|| anyhow!("no block at or before slot {start_slot}"))?;

        Ok(Checkpoint::new(epoch, block.root))
    }
}

fn generate(parent_root: H256, slot: Slot, fork: u64) -> (BlockRecord, StateRecord) {
    let payload = [fork.to_le_bytes(), slot.to_le_bytes()].concat();
    let state_payload = [parent_root.as_bytes(), payload.as_slice()].concat();
    let state_root = StateRecord::compute_root(slot, &state_payload);
    let block = BlockRecord::new(parent_root, slot, state_root, payload);
    let state = StateRecord::new(block.root, slot, state_payload);
    (block, state)
}
