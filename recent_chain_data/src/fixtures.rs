use std::sync::Arc;

use anyhow::Result;
use chain_storage::{Storage, StorageMode};
use database::{Database, InMemoryLocation};
use tokio::sync::broadcast::Receiver;
use types::{
    config::Config,
    consts::{GENESIS_SLOT, ZERO_ROOT},
    containers::{AnchorState, BlockRecord, Checkpoint, StateRecord},
    primitives::{Slot, H256},
};

use crate::{
    events::{Event, EventChannels},
    recent_chain_data::RecentChainData,
    store::Generation,
    store_config::StoreConfig,
};

pub fn open_storage(location: &InMemoryLocation, mode: StorageMode) -> Result<Storage> {
    Storage::open(
        Arc::new(Config::minimal()),
        Database::in_memory_at(location)?,
        mode,
    )
}

pub fn records(parent_root: H256, slot: Slot, tag: u8) -> (BlockRecord, StateRecord) {
    let state_payload = vec![tag, 0xee];
    let state_root = StateRecord::compute_root(slot, &state_payload);
    let block = BlockRecord::new(parent_root, slot, state_root, vec![tag]);
    let state = StateRecord::new(block.root, slot, state_payload);
    (block, state)
}

pub fn genesis() -> Result<AnchorState> {
    let (block, state) = records(ZERO_ROOT, GENESIS_SLOT, 0);
    AnchorState::new(block, state)
}

pub fn checkpoint(block: &BlockRecord) -> Checkpoint {
    Checkpoint::new(Config::minimal().epoch_at_slot(block.slot), block.root)
}

pub fn recent_chain_data(
    storage: Storage,
    base_generation: Generation,
) -> (Arc<RecentChainData>, Arc<EventChannels>) {
    let event_channels = Arc::new(EventChannels::default());

    let recent_chain_data = Arc::new(RecentChainData::new(
        StoreConfig::minimal(),
        storage,
        Arc::clone(&event_channels),
        base_generation,
    ));

    (recent_chain_data, event_channels)
}

/// Imports blocks at `slots` on top of `parent`. Weights are equal to slots.
pub fn import_chain(
    recent_chain_data: &RecentChainData,
    parent: &BlockRecord,
    slots: impl IntoIterator<Item = Slot>,
    tag: u8,
) -> Result<Vec<BlockRecord>> {
    let mut parent_root = parent.root;
    let mut blocks = vec![];

    for slot in slots {
        let (block, state) = records(parent_root, slot, tag);
        recent_chain_data.import_block(block.clone(), Some(state), slot)?;

        parent_root = block.root;
        blocks.push(block);
    }

    Ok(blocks)
}

pub fn drain(receiver: &mut Receiver<Event>) -> Vec<Event> {
    core::iter::from_fn(|| receiver.try_recv().ok()).collect()
}
