use core::ops::Range;
use std::sync::Arc;

use anyhow::Result;
use chain_storage::{Error as StorageError, Storage};
use types::{
    containers::{BlockRecord, Checkpoint, StateRecord},
    primitives::{Slot, H256},
};

use crate::{
    recent_chain_data::RecentChainData,
    store::{Generation, Store},
};

/// A query result along with the generation of the snapshot it was computed from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WithGeneration<T> {
    pub value: T,
    pub generation: Generation,
}

impl<T> WithGeneration<T> {
    #[must_use]
    pub const fn new(value: T, generation: Generation) -> Self {
        Self { value, generation }
    }

    pub fn map<U>(self, function: impl FnOnce(T) -> U) -> WithGeneration<U> {
        WithGeneration {
            value: function(self.value),
            generation: self.generation,
        }
    }
}

/// Read-only queries over recent chain data and storage.
///
/// Each query loads one [`Store`] snapshot and answers relative to it.
/// Data behind the finalized block of that snapshot is read from storage.
/// Anything newer that the snapshot does not know about is treated as absent.
#[derive(Clone)]
pub struct CombinedChainDataClient {
    recent_chain_data: Arc<RecentChainData>,
    storage: Storage,
}

impl CombinedChainDataClient {
    #[must_use]
    pub const fn new(recent_chain_data: Arc<RecentChainData>, storage: Storage) -> Self {
        Self {
            recent_chain_data,
            storage,
        }
    }

    #[must_use]
    pub const fn recent_chain_data(&self) -> &Arc<RecentChainData> {
        &self.recent_chain_data
    }

    pub fn generation(&self) -> Result<Generation> {
        Ok(self.recent_chain_data.store_snapshot()?.generation())
    }

    pub fn head_root(&self) -> Result<WithGeneration<H256>> {
        let store = self.recent_chain_data.store_snapshot()?;
        Ok(WithGeneration::new(store.head(), store.generation()))
    }

    pub fn justified_checkpoint(&self) -> Result<WithGeneration<Checkpoint>> {
        let store = self.recent_chain_data.store_snapshot()?;
        Ok(WithGeneration::new(
            store.justified_checkpoint(),
            store.generation(),
        ))
    }

    pub fn finalized_checkpoint(&self) -> Result<WithGeneration<Checkpoint>> {
        let store = self.recent_chain_data.store_snapshot()?;
        Ok(WithGeneration::new(
            store.finalized_checkpoint(),
            store.generation(),
        ))
    }

    pub fn head_block(&self) -> Result<WithGeneration<Arc<BlockRecord>>> {
        let store = self.recent_chain_data.store_snapshot()?;
        let block = self.required_block(&store, store.head())?;
        Ok(WithGeneration::new(block, store.generation()))
    }

    pub fn finalized_block(&self) -> Result<WithGeneration<Arc<BlockRecord>>> {
        let store = self.recent_chain_data.store_snapshot()?;
        let block = self.required_block(&store, store.finalized_checkpoint().root)?;
        Ok(WithGeneration::new(block, store.generation()))
    }

    pub fn block_by_root(
        &self,
        block_root: H256,
    ) -> Result<WithGeneration<Option<Arc<BlockRecord>>>> {
        let store = self.recent_chain_data.store_snapshot()?;
        let block = self.block_in(&store, block_root)?;
        Ok(WithGeneration::new(block, store.generation()))
    }

    pub fn state_by_state_root(
        &self,
        state_root: H256,
    ) -> Result<WithGeneration<Option<Arc<StateRecord>>>> {
        let store = self.recent_chain_data.store_snapshot()?;

        if let Some(state) = store.state(state_root) {
            return Ok(WithGeneration::new(Some(Arc::clone(state)), store.generation()));
        }

        let state = self
            .storage
            .get_state(state_root)?
            .filter(|state| is_known_to(&store, state.block_root, state.slot))
            .map(Arc::new);

        Ok(WithGeneration::new(state, store.generation()))
    }

    pub fn state_by_block_root(
        &self,
        block_root: H256,
    ) -> Result<WithGeneration<Option<Arc<StateRecord>>>> {
        let store = self.recent_chain_data.store_snapshot()?;

        if let Some(state) = store.state_by_block_root(block_root) {
            return Ok(WithGeneration::new(Some(Arc::clone(state)), store.generation()));
        }

        let state = self
            .storage
            .state_by_block_root(block_root)?
            .filter(|state| is_known_to(&store, state.block_root, state.slot))
            .map(Arc::new);

        Ok(WithGeneration::new(state, store.generation()))
    }

    /// Block at `slot` on the chain ending at the head. Empty slots have no block.
    pub fn block_at_slot(&self, slot: Slot) -> Result<WithGeneration<Option<Arc<BlockRecord>>>> {
        let store = self.recent_chain_data.store_snapshot()?;

        let block = if slot >= store.finalized_slot() {
            store
                .canonical_root_at_slot(slot)
                .map(|block_root| self.required_block(&store, block_root))
                .transpose()?
        } else {
            self.storage
                .block_root_by_slot(slot)?
                .map(|block_root| self.required_block(&store, block_root))
                .transpose()?
        };

        Ok(WithGeneration::new(block, store.generation()))
    }

    /// Blocks on the chain ending at the head with slots in `range`, in ascending slot order.
    pub fn blocks_by_slot_range(
        &self,
        range: Range<Slot>,
    ) -> Result<WithGeneration<Vec<Arc<BlockRecord>>>> {
        let store = self.recent_chain_data.store_snapshot()?;
        let Range { start, end } = range;
        let finalized_slot = store.finalized_slot();

        let mut blocks = self
            .storage
            .stream_blocks_by_slot_range(start..end.min(finalized_slot))
            .map(|result| result.map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        for node in store.canonical_nodes(start.max(finalized_slot), end) {
            blocks.push(self.required_block(&store, node.root)?);
        }

        Ok(WithGeneration::new(blocks, store.generation()))
    }

    /// Returns `None` if the block is unknown.
    pub fn is_canonical(&self, block_root: H256) -> Result<WithGeneration<Option<bool>>> {
        let store = self.recent_chain_data.store_snapshot()?;

        if let Some(canonical) = store.is_canonical(block_root) {
            return Ok(WithGeneration::new(Some(canonical), store.generation()));
        }

        let canonical = match self.storage.get_block(block_root)? {
            Some(block) if is_known_to(&store, block.root, block.slot) => Some(
                block.slot < store.finalized_slot()
                    && self.storage.block_root_by_slot(block.slot)? == Some(block_root),
            ),
            _ => None,
        };

        Ok(WithGeneration::new(canonical, store.generation()))
    }

    fn block_in(&self, store: &Store, block_root: H256) -> Result<Option<Arc<BlockRecord>>> {
        if let Some(block) = store.block(block_root) {
            return Ok(Some(Arc::clone(block)));
        }

        let block = self
            .storage
            .get_block(block_root)?
            .filter(|block| is_known_to(store, block.root, block.slot))
            .map(Arc::new);

        Ok(block)
    }

    fn required_block(&self, store: &Store, block_root: H256) -> Result<Arc<BlockRecord>> {
        self.block_in(store, block_root)?
            .ok_or_else(|| StorageError::BlockNotFound { block_root }.into())
    }
}

// Blocks after the finalized block of `store` must be in its fork-choice DAG.
// Anything else was stored after `store` was published.
fn is_known_to(store: &Store, block_root: H256, slot: Slot) -> bool {
    slot < store.finalized_slot() || store.fork_choice().contains(block_root)
}

#[cfg(test)]
mod tests {
    use chain_storage::{BlockRetention, StorageMode};
    use database::InMemoryLocation;
    use unwrap_none::UnwrapNone as _;

    use crate::fixtures;

    use super::*;

    // Archive chain with blocks at slots 1..=12, the head at slot 12 and slot 8 finalized.
    fn finalized_chain(
        location: &InMemoryLocation,
    ) -> Result<(CombinedChainDataClient, Storage, Vec<BlockRecord>)> {
        let storage = fixtures::open_storage(location, StorageMode::Archive)?;
        let (recent_chain_data, _) = fixtures::recent_chain_data(storage.clone(), 0);
        let anchor = fixtures::genesis()?;

        recent_chain_data.initialize_from_anchor(&anchor)?;

        let chain = fixtures::import_chain(&recent_chain_data, anchor.block(), 1..=12, 1)?;
        let finalized = fixtures::checkpoint(&chain[7]);

        recent_chain_data.update_head(chain[11].root)?;
        recent_chain_data.apply_checkpoints(finalized, finalized)?;

        let client = CombinedChainDataClient::new(recent_chain_data, storage.clone());

        Ok((client, storage, chain))
    }

    #[test]
    fn test_slot_queries_span_storage_and_recent_data() -> Result<()> {
        let location = InMemoryLocation::new();
        let (client, _, chain) = finalized_chain(&location)?;
        let generation = client.generation()?;

        let blocks = client.blocks_by_slot_range(2..11)?;

        assert_eq!(blocks.generation, generation);
        assert_eq!(
            blocks.value.iter().map(|block| block.slot).collect::<Vec<_>>(),
            (2..=10).collect::<Vec<_>>(),
        );

        assert_eq!(
            client.block_at_slot(3)?.value.map(|block| block.root),
            Some(chain[2].root),
        );
        assert_eq!(
            client.block_at_slot(10)?.value.map(|block| block.root),
            Some(chain[9].root),
        );

        client.block_at_slot(20)?.value.unwrap_none();

        assert_eq!(client.head_block()?.value.root, chain[11].root);
        assert_eq!(client.finalized_block()?.value.root, chain[7].root);
        assert_eq!(client.is_canonical(chain[1].root)?.value, Some(true));
        assert_eq!(client.is_canonical(chain[10].root)?.value, Some(true));
        assert_eq!(
            client
                .state_by_block_root(chain[2].root)?
                .value
                .map(|state| state.slot),
            Some(3),
        );

        Ok(())
    }

    #[test]
    fn test_blocks_stored_after_snapshot_are_hidden() -> Result<()> {
        let location = InMemoryLocation::new();
        let (client, storage, chain) = finalized_chain(&location)?;
        let (late, late_state) = fixtures::records(chain[11].root, 13, 9);

        storage.store_block(late.clone(), BlockRetention::Transient)?;

        let generation = client.generation()?;
        let result = client.block_by_root(late.root)?;

        assert_eq!(result.generation, generation);

        result.value.unwrap_none();
        client.is_canonical(late.root)?.value.unwrap_none();
        client.state_by_state_root(late_state.state_root)?.value.unwrap_none();

        client
            .recent_chain_data()
            .import_block(late.clone(), Some(late_state), 13)?;

        let result = client.block_by_root(late.root)?;

        assert!(result.generation > generation);
        assert_eq!(result.value.map(|block| block.slot), Some(13));
        assert_eq!(client.is_canonical(late.root)?.value, Some(false));

        Ok(())
    }
}
