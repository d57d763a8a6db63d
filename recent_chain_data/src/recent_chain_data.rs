use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use arc_swap::ArcSwapOption;
use chain_storage::{BlockRetention, Error as StorageError, PruneSummary, Storage, StoredChain};
use log::{debug, info, warn};
use parking_lot::Mutex;
use types::{
    containers::{AnchorState, BlockRecord, Checkpoint, StateRecord},
    fork_choice::{self, ForkChoiceDag, ForkChoiceNode},
    primitives::{Weight, H256},
};

use crate::{
    error::Error,
    events::{ChainReorgEvent, EventChannels},
    store::{Generation, Store},
    store_config::StoreConfig,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    Uninitialized,
    Ready,
    Closed,
}

struct Lifecycle {
    status: Status,
    // Dropped when the cache is closed.
    storage: Option<Storage>,
}

impl Lifecycle {
    fn storage(&self, expected: Status) -> Result<&Storage> {
        match (self.status, self.storage.as_ref()) {
            (status, Some(storage)) if status == expected => Ok(storage),
            (Status::Closed, _) => bail!(Error::Closed),
            (Status::Uninitialized, _) => bail!(Error::Uninitialized),
            (Status::Ready, _) => bail!(Error::AlreadyInitialized),
        }
    }
}

/// In-memory view of the current chain backed by [`Storage`].
///
/// Every mutation is written to storage first, then published as a new [`Store`] snapshot,
/// then announced through [`EventChannels`]. Mutations are serialized. Reads never block.
pub struct RecentChainData {
    store_config: StoreConfig,
    event_channels: Arc<EventChannels>,
    base_generation: Generation,
    lifecycle: Mutex<Lifecycle>,
    store_snapshot: ArcSwapOption<Store>,
    closed: AtomicBool,
}

impl RecentChainData {
    /// Generations of the new cache start after `base_generation`.
    #[must_use]
    pub fn new(
        store_config: StoreConfig,
        storage: Storage,
        event_channels: Arc<EventChannels>,
        base_generation: Generation,
    ) -> Self {
        Self {
            store_config,
            event_channels,
            base_generation,
            lifecycle: Mutex::new(Lifecycle {
                status: Status::Uninitialized,
                storage: Some(storage),
            }),
            store_snapshot: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.lifecycle.lock().status
    }

    #[must_use]
    pub const fn store_config(&self) -> &StoreConfig {
        &self.store_config
    }

    #[must_use]
    pub const fn event_channels(&self) -> &Arc<EventChannels> {
        &self.event_channels
    }

    pub fn store_snapshot(&self) -> Result<Arc<Store>> {
        if self.closed.load(Ordering::Acquire) {
            bail!(Error::Closed);
        }

        self.store_snapshot
            .load_full()
            .ok_or_else(|| Error::Uninitialized.into())
    }

    /// Generation of the latest snapshot, including after the cache is closed.
    #[must_use]
    pub fn last_generation(&self) -> Generation {
        self.store_snapshot
            .load_full()
            .map_or(self.base_generation, |store| store.generation())
    }

    /// Starts a new chain at `anchor`. Storage must not contain a chain yet.
    pub fn initialize_from_anchor(&self, anchor: &AnchorState) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let storage = lifecycle.storage(Status::Uninitialized)?.clone();

        let checkpoints = storage.store_anchor(anchor)?;
        let (block, state) = anchor.clone().into_parts();

        let mut store = Store::new(
            self.base_generation + 1,
            block,
            checkpoints.justified,
            checkpoints.finalized,
        );

        store.insert_state(state);

        storage
            .fork_choice_snapshots()
            .save(store.fork_choice(), checkpoints.finalized)?;

        info!(
            "initialized recent chain data from anchor {:?} at slot {}",
            anchor.block().root,
            anchor.slot(),
        );

        self.publish(Arc::new(store));
        lifecycle.status = Status::Ready;

        Ok(())
    }

    /// Rebuilds the cache from the chain in storage and announces it with
    /// [`Self::announce_chain`].
    ///
    /// Returns `false` if storage does not contain a chain.
    pub fn initialize_from_storage(&self) -> Result<bool> {
        let rehydrated = self.rehydrate_from_storage()?;

        if rehydrated {
            self.announce_chain();
        }

        Ok(rehydrated)
    }

    /// Rebuilds the cache from the chain in storage without publishing any events.
    ///
    /// Returns `false` if storage does not contain a chain.
    pub fn rehydrate_from_storage(&self) -> Result<bool> {
        let mut lifecycle = self.lifecycle.lock();
        let storage = lifecycle.storage(Status::Uninitialized)?.clone();

        let Some(stored_chain) = storage.load_anchor()? else {
            return Ok(false);
        };

        let store = Arc::new(self.rehydrate(stored_chain)?);

        info!(
            "rehydrated recent chain data with {} blocks at generation {} \
             (head: {:?}, finalized epoch: {})",
            store.fork_choice().len(),
            store.generation(),
            store.head(),
            store.finalized_checkpoint().epoch,
        );

        self.publish(store);
        lifecycle.status = Status::Ready;

        Ok(true)
    }

    /// Publishes the finalized checkpoint and the head of the latest snapshot once each.
    ///
    /// Does nothing if the cache is not ready.
    pub fn announce_chain(&self) {
        let _lifecycle = self.lifecycle.lock();

        let Ok(store) = self.store_snapshot() else {
            return;
        };

        self.event_channels
            .send_finalized_checkpoint_event(store.finalized_checkpoint(), store.generation());

        if let Some(head) = store.head_node() {
            self.event_channels
                .send_head_event(head.slot, head.root, store.generation());
        }
    }

    /// Applies weights and validity from a fork-choice snapshot to the blocks in the cache.
    ///
    /// Fails with [`chain_storage::Error::SnapshotMismatch`] if `restored` is not rooted at the
    /// finalized block.
    pub fn restore_fork_choice(&self, restored: &ForkChoiceDag) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        let storage = lifecycle.storage(Status::Ready)?;
        let current = self.store_snapshot()?;
        let finalized = current.finalized_checkpoint();

        ensure!(
            restored.root() == finalized.root,
            StorageError::SnapshotMismatch {
                snapshot: Checkpoint::new(finalized.epoch, restored.root()),
                stored: finalized,
            },
        );

        let mut fork_choice = current.fork_choice().clone();
        let mut restored_nodes = 0_usize;

        for node in restored.nodes() {
            if !fork_choice.contains(node.root) {
                continue;
            }

            fork_choice.set_weight(node.root, node.weight)?;

            if !node.valid && node.root != fork_choice.root() {
                fork_choice.mark_invalid(node.root)?;
            }

            restored_nodes += 1;
        }

        debug!(
            "restored fork choice data for {restored_nodes} of {} blocks",
            fork_choice.len(),
        );

        let mut store = current.next_generation();
        store.set_fork_choice(fork_choice);

        self.commit(storage, &current, store)
    }

    /// Adds a block that descends from the finalized block.
    pub fn import_block(
        &self,
        block: BlockRecord,
        state: Option<StateRecord>,
        weight: Weight,
    ) -> Result<Generation> {
        let lifecycle = self.lifecycle.lock();
        let storage = lifecycle.storage(Status::Ready)?;
        let current = self.store_snapshot()?;

        if current.fork_choice().contains(block.root) {
            return Ok(current.generation());
        }

        ensure!(
            current.fork_choice().contains(block.parent_root),
            Error::NotDescendantOfFinalized {
                block_root: block.root,
                finalized: current.finalized_checkpoint(),
            },
        );

        let mut store = current.next_generation();

        store.fork_choice_mut().insert(ForkChoiceNode::new(
            block.root,
            block.parent_root,
            block.slot,
            weight,
        ))?;

        storage.store_block(block.clone(), BlockRetention::Retain)?;

        if let Some(state) = &state {
            storage.store_state(state)?;
        }

        debug!("imported block {:?} at slot {}", block.root, block.slot);

        store.insert_block(block);

        if let Some(state) = state {
            store.insert_state(state);
        }

        let generation = store.generation();

        self.commit(storage, &current, store)?;

        Ok(generation)
    }

    pub fn set_weight(&self, block_root: H256, weight: Weight) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        let storage = lifecycle.storage(Status::Ready)?;
        let current = self.store_snapshot()?;

        ensure!(
            current.fork_choice().contains(block_root),
            Error::UnknownBlock { block_root },
        );

        let mut store = current.next_generation();
        store.fork_choice_mut().set_weight(block_root, weight)?;

        self.commit(storage, &current, store)
    }

    /// Marks a block invalid. If the head no longer has a valid chain, the heaviest viable block
    /// becomes the head.
    pub fn mark_invalid(&self, block_root: H256) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        let storage = lifecycle.storage(Status::Ready)?;
        let current = self.store_snapshot()?;

        ensure!(
            current.fork_choice().contains(block_root),
            Error::UnknownBlock { block_root },
        );

        let mut store = current.next_generation();
        store.fork_choice_mut().mark_invalid(block_root)?;

        self.commit(storage, &current, store)
    }

    /// Makes `candidate` the head if it has strictly greater weight than the current head,
    /// or equal weight and a lower block root. Returns `true` if the head changed.
    pub fn update_head(&self, candidate: H256) -> Result<bool> {
        let lifecycle = self.lifecycle.lock();
        let storage = lifecycle.storage(Status::Ready)?;
        let current = self.store_snapshot()?;
        let fork_choice = current.fork_choice();

        let node = fork_choice.get(candidate).ok_or(Error::UnknownBlock {
            block_root: candidate,
        })?;

        ensure!(
            fork_choice.is_viable(candidate),
            Error::InvalidBlock {
                block_root: candidate,
            },
        );

        if candidate == current.head() {
            return Ok(false);
        }

        let replace = match current.head_node() {
            Some(head) if fork_choice.is_viable(head.root) => fork_choice::supersedes(node, head),
            _ => true,
        };

        if !replace {
            debug!("block {candidate:?} does not outweigh head {:?}", current.head());
            return Ok(false);
        }

        let mut store = current.next_generation();
        store.set_head(candidate);

        self.commit(storage, &current, store)?;

        Ok(true)
    }

    /// Records new checkpoints in storage and moves the cache to them.
    ///
    /// A finalized checkpoint is announced once per distinct value.
    /// The announcement precedes any head change caused by the same update.
    pub fn apply_checkpoints(
        &self,
        justified: Checkpoint,
        finalized: Checkpoint,
    ) -> Result<PruneSummary> {
        let lifecycle = self.lifecycle.lock();
        let storage = lifecycle.storage(Status::Ready)?;
        let current = self.store_snapshot()?;
        let previous_finalized = current.finalized_checkpoint();

        ensure!(
            finalized.epoch >= previous_finalized.epoch,
            StorageError::StaleCheckpoint {
                stored: previous_finalized.epoch,
                supplied: finalized.epoch,
            },
        );

        let mut fork_choice = current.fork_choice().clone();

        ensure!(
            fork_choice.contains(finalized.root),
            Error::NotDescendantOfFinalized {
                block_root: finalized.root,
                finalized: previous_finalized,
            },
        );

        let finalized_changed = finalized != previous_finalized;

        if finalized_changed {
            let removed = fork_choice.prune_to(finalized.root)?;
            debug!("removed {removed} blocks that do not descend from {:?}", finalized.root);
        }

        ensure!(
            fork_choice.contains(justified.root),
            Error::NotDescendantOfFinalized {
                block_root: justified.root,
                finalized,
            },
        );

        let summary = storage.update_checkpoints(justified, finalized)?;

        if finalized_changed {
            if let Err(error) = storage.fork_choice_snapshots().save(&fork_choice, finalized) {
                warn!("unable to save fork-choice snapshot: {error:?}");
            }
        }

        let mut store = current.next_generation();
        store.set_checkpoints(justified, finalized);
        store.set_fork_choice(fork_choice);

        self.commit(storage, &current, store)?;

        if !summary.is_empty() {
            info!(
                "pruned {} blocks and {} states behind epoch {}",
                summary.deleted_blocks, summary.deleted_states, finalized.epoch,
            );
        }

        Ok(summary)
    }

    /// Releases storage. The cache cannot be used afterwards.
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();

        ensure!(lifecycle.status != Status::Closed, Error::Closed);

        lifecycle.status = Status::Closed;
        lifecycle.storage = None;

        self.closed.store(true, Ordering::Release);

        info!(
            "closed recent chain data at generation {}",
            self.last_generation(),
        );

        Ok(())
    }

    fn publish(&self, store: Arc<Store>) {
        self.event_channels.record_generation(store.generation());
        self.store_snapshot.store(Some(store));
    }

    fn rehydrate(&self, stored_chain: StoredChain) -> Result<Store> {
        let StoredChain {
            head,
            justified,
            finalized,
            finalized_block,
            finalized_state,
            hot_blocks,
            hot_states,
        } = stored_chain;

        let mut store = Store::new(
            self.base_generation + 1,
            finalized_block,
            justified,
            finalized,
        );

        for block in hot_blocks {
            store.fork_choice_mut().insert(ForkChoiceNode::new(
                block.root,
                block.parent_root,
                block.slot,
                0,
            ))?;

            store.insert_block(block);
        }

        for state in finalized_state.into_iter().chain(hot_states) {
            store.insert_state(state);
        }

        store.set_head(head);
        store.trim(&self.store_config);

        Ok(store)
    }

    // Moves the head away from blocks without a valid chain, persists a changed head,
    // publishes `store` and announces what changed relative to `previous`.
    fn commit(&self, storage: &Storage, previous: &Store, mut store: Store) -> Result<()> {
        if !store.fork_choice().is_viable(store.head()) {
            let head = store.fork_choice().find_head();
            store.set_head(head);
        }

        let head_changed = store.head() != previous.head();

        if head_changed {
            storage.store_head(store.head())?;
        }

        store.trim(&self.store_config);

        let store = Arc::new(store);

        self.publish(Arc::clone(&store));

        let generation = store.generation();
        let finalized = store.finalized_checkpoint();

        if finalized != previous.finalized_checkpoint() {
            self.event_channels
                .send_finalized_checkpoint_event(finalized, generation);
        }

        if head_changed {
            self.announce_head(previous, &store);
        }

        Ok(())
    }

    fn announce_head(&self, previous: &Store, store: &Store) {
        let Some(head) = store.head_node() else {
            return;
        };

        let generation = store.generation();

        self.event_channels
            .send_head_event(head.slot, head.root, generation);

        let old_head = previous.head();
        let previous_fork_choice = previous.fork_choice();

        if previous_fork_choice.is_descendant(old_head, head.root) {
            return;
        }

        let Some(ancestor) = previous_fork_choice.common_ancestor(old_head, head.root) else {
            return;
        };

        let old_head_slot = previous.head_node().map_or(ancestor.slot, |node| node.slot);

        info!(
            "chain reorganized from {old_head:?} to {:?} (common ancestor at slot {})",
            head.root, ancestor.slot,
        );

        self.event_channels.send_chain_reorg_event(ChainReorgEvent {
            old_head,
            new_head: head.root,
            common_ancestor_slot: ancestor.slot,
            depth: old_head_slot - ancestor.slot,
            generation,
        });
    }
}

#[cfg(test)]
mod tests {
    use chain_storage::StorageMode;
    use database::InMemoryLocation;
    use types::consts::ZERO_ROOT;

    use crate::{
        events::{Event, HeadEvent, Topic},
        fixtures,
    };

    use super::*;

    fn topics(events: &[Event]) -> Vec<Topic> {
        events.iter().map(Event::topic).collect()
    }

    #[test]
    fn test_lifecycle_transitions() -> Result<()> {
        let location = InMemoryLocation::new();
        let storage = fixtures::open_storage(&location, StorageMode::Prune)?;
        let (recent_chain_data, _) = fixtures::recent_chain_data(storage, 0);
        let anchor = fixtures::genesis()?;

        assert_eq!(recent_chain_data.status(), Status::Uninitialized);

        let error = recent_chain_data
            .store_snapshot()
            .expect_err("cache should not be initialized yet");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::Uninitialized),
        ));

        recent_chain_data.initialize_from_anchor(&anchor)?;

        assert_eq!(recent_chain_data.status(), Status::Ready);
        assert_eq!(recent_chain_data.store_snapshot()?.generation(), 1);

        let error = recent_chain_data
            .initialize_from_storage()
            .expect_err("cache should already be initialized");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::AlreadyInitialized),
        ));

        recent_chain_data.close()?;

        assert_eq!(recent_chain_data.status(), Status::Closed);
        assert_eq!(recent_chain_data.last_generation(), 1);
        assert!(!location.is_open());

        let error = recent_chain_data
            .update_head(anchor.block().root)
            .expect_err("cache should be closed");

        assert!(matches!(error.downcast_ref(), Some(Error::Closed)));

        let error = recent_chain_data
            .close()
            .expect_err("cache should already be closed");

        assert!(matches!(error.downcast_ref(), Some(Error::Closed)));

        Ok(())
    }

    #[test]
    fn test_initialize_from_empty_storage() -> Result<()> {
        let location = InMemoryLocation::new();
        let storage = fixtures::open_storage(&location, StorageMode::Archive)?;
        let (recent_chain_data, _) = fixtures::recent_chain_data(storage, 0);

        assert!(!recent_chain_data.initialize_from_storage()?);
        assert_eq!(recent_chain_data.status(), Status::Uninitialized);

        Ok(())
    }

    #[test]
    fn test_import_rejects_blocks_outside_finalized_chain() -> Result<()> {
        let location = InMemoryLocation::new();
        let storage = fixtures::open_storage(&location, StorageMode::Prune)?;
        let (recent_chain_data, _) = fixtures::recent_chain_data(storage, 0);

        recent_chain_data.initialize_from_anchor(&fixtures::genesis()?)?;

        let (orphan, _) = fixtures::records(H256::repeat_byte(3), 4, 1);

        let error = recent_chain_data
            .import_block(orphan, None, 1)
            .expect_err("orphan should be rejected");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::NotDescendantOfFinalized { .. }),
        ));

        assert_eq!(recent_chain_data.last_generation(), 1);

        Ok(())
    }

    #[test]
    fn test_head_follows_weight_and_lower_root() -> Result<()> {
        let location = InMemoryLocation::new();
        let storage = fixtures::open_storage(&location, StorageMode::Prune)?;
        let (recent_chain_data, event_channels) = fixtures::recent_chain_data(storage, 0);
        let anchor = fixtures::genesis()?;

        recent_chain_data.initialize_from_anchor(&anchor)?;

        let mut all = event_channels.subscribe_all();

        let (block_a, state_a) = fixtures::records(anchor.block().root, 1, 1);
        let (block_b, state_b) = fixtures::records(anchor.block().root, 1, 2);

        recent_chain_data.import_block(block_a.clone(), Some(state_a), 5)?;
        recent_chain_data.import_block(block_b.clone(), Some(state_b), 5)?;

        let (low, high) = if block_a.root < block_b.root {
            (block_a, block_b)
        } else {
            (block_b, block_a)
        };

        assert!(recent_chain_data.update_head(high.root)?);
        assert!(recent_chain_data.update_head(low.root)?);
        assert!(!recent_chain_data.update_head(high.root)?);

        recent_chain_data.set_weight(high.root, 6)?;

        assert!(recent_chain_data.update_head(high.root)?);

        let events = fixtures::drain(&mut all);

        assert_eq!(
            topics(&events),
            [
                Topic::Head,
                Topic::Head,
                Topic::ChainReorg,
                Topic::Head,
                Topic::ChainReorg,
            ],
        );

        assert_eq!(
            events[2],
            Event::ChainReorg(ChainReorgEvent {
                old_head: high.root,
                new_head: low.root,
                common_ancestor_slot: 0,
                depth: 1,
                generation: events[1].generation(),
            }),
        );

        assert!(events
            .windows(2)
            .all(|pair| pair[0].generation() <= pair[1].generation()));

        Ok(())
    }

    #[test]
    fn test_invalid_head_is_replaced() -> Result<()> {
        let location = InMemoryLocation::new();
        let storage = fixtures::open_storage(&location, StorageMode::Prune)?;
        let (recent_chain_data, _) = fixtures::recent_chain_data(storage, 0);
        let anchor = fixtures::genesis()?;

        recent_chain_data.initialize_from_anchor(&anchor)?;

        let main = fixtures::import_chain(&recent_chain_data, anchor.block(), 1..=3, 1)?;
        let fork = fixtures::import_chain(&recent_chain_data, anchor.block(), 1..=4, 2)?;

        assert!(recent_chain_data.update_head(fork[3].root)?);

        recent_chain_data.mark_invalid(fork[0].root)?;

        assert_eq!(recent_chain_data.store_snapshot()?.head(), main[2].root);

        let error = recent_chain_data
            .update_head(fork[3].root)
            .expect_err("invalid block should not become the head");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::InvalidBlock { .. }),
        ));

        Ok(())
    }

    #[test]
    fn test_finalization_is_announced_once_before_head_change() -> Result<()> {
        let location = InMemoryLocation::new();
        let storage = fixtures::open_storage(&location, StorageMode::Prune)?;
        let (recent_chain_data, event_channels) = fixtures::recent_chain_data(storage, 0);
        let anchor = fixtures::genesis()?;

        recent_chain_data.initialize_from_anchor(&anchor)?;

        let chain = fixtures::import_chain(&recent_chain_data, anchor.block(), 1..=9, 1)?;
        let (fork, fork_state) = fixtures::records(chain[0].root, 2, 2);

        recent_chain_data.import_block(fork.clone(), Some(fork_state), 100)?;

        assert!(recent_chain_data.update_head(fork.root)?);

        let mut all = event_channels.subscribe_all();
        let finalized = fixtures::checkpoint(&chain[7]);
        let summary = recent_chain_data.apply_checkpoints(finalized, finalized)?;

        assert_eq!(summary.deleted_blocks, 9);

        let events = fixtures::drain(&mut all);

        assert_eq!(
            topics(&events),
            [Topic::FinalizedCheckpoint, Topic::Head, Topic::ChainReorg],
        );

        let store = recent_chain_data.store_snapshot()?;

        assert_eq!(store.head(), chain[8].root);
        assert_eq!(store.finalized_checkpoint(), finalized);
        assert!(store.block(fork.root).is_none());
        assert!(events.iter().all(|event| event.generation() == store.generation()));

        recent_chain_data.apply_checkpoints(finalized, finalized)?;

        assert!(fixtures::drain(&mut all).is_empty());

        let generation = recent_chain_data.last_generation();
        let genesis_checkpoint = fixtures::checkpoint(anchor.block());

        let error = recent_chain_data
            .apply_checkpoints(genesis_checkpoint, genesis_checkpoint)
            .expect_err("older finalized checkpoint should be rejected");

        assert!(matches!(
            error.downcast_ref(),
            Some(StorageError::StaleCheckpoint { .. }),
        ));

        assert_eq!(recent_chain_data.last_generation(), generation);
        assert!(fixtures::drain(&mut all).is_empty());

        Ok(())
    }

    #[test]
    fn test_rehydrate_after_close() -> Result<()> {
        let location = InMemoryLocation::new();
        let storage = fixtures::open_storage(&location, StorageMode::Archive)?;
        let (recent_chain_data, _) = fixtures::recent_chain_data(storage, 0);
        let anchor = fixtures::genesis()?;

        recent_chain_data.initialize_from_anchor(&anchor)?;

        let chain = fixtures::import_chain(&recent_chain_data, anchor.block(), 1..=10, 1)?;
        let finalized = fixtures::checkpoint(&chain[7]);

        recent_chain_data.update_head(chain[9].root)?;
        recent_chain_data.apply_checkpoints(finalized, finalized)?;

        let last_generation = recent_chain_data.last_generation();

        recent_chain_data.close()?;

        let storage = fixtures::open_storage(&location, StorageMode::Archive)?;
        let (recent_chain_data, event_channels) =
            fixtures::recent_chain_data(storage.clone(), last_generation);

        let mut all = event_channels.subscribe_all();

        assert!(recent_chain_data.initialize_from_storage()?);

        let store = recent_chain_data.store_snapshot()?;
        let events = fixtures::drain(&mut all);

        assert_eq!(store.head(), chain[9].root);
        assert_eq!(store.finalized_checkpoint(), finalized);
        assert!(store.generation() > last_generation);
        assert_eq!(topics(&events), [Topic::FinalizedCheckpoint, Topic::Head]);
        assert!(events.iter().all(|event| event.generation() == store.generation()));
        assert_eq!(
            store.fork_choice().get(chain[9].root).map(|node| node.weight),
            Some(0),
        );

        let restored = storage
            .fork_choice_snapshots()
            .restore_matching(finalized)?
            .expect("fork-choice snapshot should be saved on finalization");

        recent_chain_data.restore_fork_choice(&restored)?;

        let store = recent_chain_data.store_snapshot()?;

        assert_eq!(
            store.fork_choice().get(chain[9].root).map(|node| node.weight),
            Some(10),
        );
        assert!(fixtures::drain(&mut all).is_empty());

        let unrelated = ForkChoiceDag::new(ForkChoiceNode::new(
            H256::repeat_byte(7),
            ZERO_ROOT,
            0,
            0,
        ));

        let error = recent_chain_data
            .restore_fork_choice(&unrelated)
            .expect_err("snapshot rooted elsewhere should be rejected");

        assert!(matches!(
            error.downcast_ref(),
            Some(StorageError::SnapshotMismatch { .. }),
        ));

        Ok(())
    }

    #[test]
    fn test_silent_rehydration_is_announced_on_request() -> Result<()> {
        let location = InMemoryLocation::new();
        let storage = fixtures::open_storage(&location, StorageMode::Prune)?;
        let (recent_chain_data, _) = fixtures::recent_chain_data(storage, 0);
        let anchor = fixtures::genesis()?;

        recent_chain_data.initialize_from_anchor(&anchor)?;

        let chain = fixtures::import_chain(&recent_chain_data, anchor.block(), 1..=4, 1)?;

        recent_chain_data.update_head(chain[3].root)?;
        recent_chain_data.close()?;

        let storage = fixtures::open_storage(&location, StorageMode::Prune)?;
        let (recent_chain_data, event_channels) = fixtures::recent_chain_data(storage, 0);
        let mut all = event_channels.subscribe_all();

        recent_chain_data.announce_chain();

        assert!(fixtures::drain(&mut all).is_empty());
        assert!(recent_chain_data.rehydrate_from_storage()?);
        assert!(fixtures::drain(&mut all).is_empty());

        let generation = recent_chain_data.last_generation();

        assert_eq!(event_channels.last_generation(), generation);

        recent_chain_data.announce_chain();

        let events = fixtures::drain(&mut all);

        assert_eq!(topics(&events), [Topic::FinalizedCheckpoint, Topic::Head]);
        assert_eq!(
            events[1],
            Event::Head(HeadEvent {
                slot: 4,
                block: chain[3].root,
                generation,
            }),
        );

        Ok(())
    }
}
