use core::ops::Range;
use std::{borrow::Cow, collections::HashSet, sync::Arc};

use anyhow::{bail, ensure, Result};
use database::{Batch, Database, PrefixableKey as _};
use log::{debug, info, warn};
use parking_lot::Mutex;
use types::{
    config::Config,
    consts::GENESIS_SLOT,
    containers::{AnchorState, BlockRecord, Checkpoint, StateRecord},
    primitives::{Slot, H256},
};

use crate::{
    deposits::DepositStorage,
    error::Error,
    fork_choice_snapshot::ForkChoiceSnapshotStore,
    keys::{
        self, BlockByRoot, BlockRootBySlot, SlotBlockRoot, SlotStateRoot, StateByStateRoot,
        StateRootByBlockRoot, ANCHOR_KEY, CHECKPOINTS_KEY, HEAD_KEY, PRUNE_CURSOR_KEY,
        PRUNE_FLOOR_KEY,
    },
    metadata::{self, StorageMetadata},
    misc::{BlockRetention, Checkpoints, PruneSummary, StorageMode, StoredChain},
};

/// Domain view of a [`Database`].
///
/// Clones share the database and the write section.
/// The database is closed when the last clone (including stores derived from it) is dropped.
#[derive(Clone)]
pub struct Storage {
    config: Arc<Config>,
    database: Arc<Database>,
    storage_mode: StorageMode,
    // Serializes logical write operations. Reads never take it.
    write_section: Arc<Mutex<()>>,
}

impl Storage {
    pub fn open(
        config: Arc<Config>,
        database: Database,
        storage_mode: StorageMode,
    ) -> Result<Self> {
        metadata::initialize(&database, storage_mode)?;
        Ok(Self::new(config, database, storage_mode))
    }

    /// Opens storage in the mode it was last written with.
    ///
    /// The stored metadata is validated but never rewritten, so inspecting storage written by a
    /// newer compatible schema leaves its version intact.
    /// Fails with [`Error::MissingMetadata`] if the database has never been opened as storage.
    pub fn open_existing(config: Arc<Config>, database: Database) -> Result<Self> {
        let metadata = metadata::load(&database)?.ok_or(Error::MissingMetadata)?;
        metadata::validate(&metadata)?;
        Ok(Self::new(config, database, metadata.storage_mode))
    }

    fn new(config: Arc<Config>, database: Database, storage_mode: StorageMode) -> Self {
        Self {
            config,
            database: Arc::new(database),
            storage_mode,
            write_section: Arc::default(),
        }
    }

    /// Closes the database.
    ///
    /// Fails with [`Error::DatabaseInUse`] if another clone or a store derived from this one
    /// still refers to it.
    pub fn close(self) -> Result<()> {
        let database = Arc::try_unwrap(self.database).map_err(|_| Error::DatabaseInUse)?;
        database.close();
        Ok(())
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<Config> {
        &self.config
    }

    #[must_use]
    pub const fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    #[must_use]
    pub fn deposits(&self) -> DepositStorage {
        DepositStorage::new(Arc::clone(&self.database), Arc::clone(&self.write_section))
    }

    #[must_use]
    pub fn fork_choice_snapshots(&self) -> ForkChoiceSnapshotStore {
        ForkChoiceSnapshotStore::new(Arc::clone(&self.database))
    }

    pub fn metadata(&self) -> Result<Option<StorageMetadata>> {
        metadata::load(&self.database)
    }

    /// Writes the first block and state of a chain and makes them the head and both checkpoints.
    pub fn store_anchor(&self, anchor: &AnchorState) -> Result<Checkpoints> {
        let _write = self.write_section.lock();

        ensure!(
            !self.database.contains_key(CHECKPOINTS_KEY)?,
            Error::AlreadyAnchored,
        );

        let block = anchor.block();
        let checkpoint = Checkpoint::new(self.config.epoch_at_slot(block.slot), block.root);

        let checkpoints = Checkpoints {
            justified: checkpoint,
            finalized: checkpoint,
        };

        let mut batch = Batch::new();

        add_block(&mut batch, block)?;
        add_state(&mut batch, anchor.state())?;
        keys::put(&mut batch, BlockRootBySlot(block.slot), &block.root)?;
        keys::put(&mut batch, ANCHOR_KEY, &block.root)?;
        keys::put(&mut batch, HEAD_KEY, &block.root)?;
        keys::put(&mut batch, CHECKPOINTS_KEY, &checkpoints)?;
        keys::put(&mut batch, PRUNE_CURSOR_KEY, &block.slot)?;
        keys::put(&mut batch, PRUNE_FLOOR_KEY, &block.slot)?;

        self.database.commit(&batch)?;

        info!(
            "stored anchor block {:?} at slot {} (epoch {})",
            block.root, block.slot, checkpoint.epoch,
        );

        Ok(checkpoints)
    }

    /// Stores a block. Storing a block that is already stored has no effect
    /// except that a transient block can later be stored as retained.
    pub fn store_block(&self, block: BlockRecord, retention: BlockRetention) -> Result<()> {
        let _write = self.write_section.lock();

        let retain = retention == BlockRetention::Retain;

        if let Some(existing) = self.get_block(block.root)? {
            if existing.retained || !retain {
                return Ok(());
            }
        }

        let block = if retain {
            let is_anchor = self.anchor_root()? == Some(block.root);

            ensure!(
                is_anchor || self.contains_block(block.parent_root)?,
                Error::MissingParent {
                    block_root: block.root,
                    parent_root: block.parent_root,
                },
            );

            block.retained()
        } else {
            block
        };

        let mut batch = Batch::new();

        add_block(&mut batch, &block)?;
        self.rewind_prune_cursor(&mut batch, block.slot)?;

        self.database.commit(&batch)?;

        debug!(
            "stored block {:?} at slot {} ({retention:?})",
            block.root, block.slot,
        );

        Ok(())
    }

    pub fn store_state(&self, state: &StateRecord) -> Result<()> {
        let _write = self.write_section.lock();

        ensure!(
            self.contains_block(state.block_root)?,
            Error::BlockNotFound {
                block_root: state.block_root,
            },
        );

        let mut batch = Batch::new();

        add_state(&mut batch, state)?;
        self.rewind_prune_cursor(&mut batch, state.slot)?;

        self.database.commit(&batch)?;

        debug!(
            "stored state {:?} of block {:?} at slot {}",
            state.state_root, state.block_root, state.slot,
        );

        Ok(())
    }

    pub fn store_head(&self, head: H256) -> Result<()> {
        let _write = self.write_section.lock();

        ensure!(
            self.contains_block(head)?,
            Error::BlockNotFound { block_root: head },
        );

        let (key, value) = keys::serialize(HEAD_KEY, &head)?;
        self.database.put(key, value)
    }

    /// Atomically replaces both checkpoints and then prunes history behind the finalized block.
    ///
    /// The checkpoint batch is committed before the prune batch is built.
    /// A finalized checkpoint older than the stored one is rejected with [`Error::StaleCheckpoint`]
    /// and leaves storage unchanged.
    pub fn update_checkpoints(
        &self,
        justified: Checkpoint,
        finalized: Checkpoint,
    ) -> Result<PruneSummary> {
        let _write = self.write_section.lock();

        let stored = self.checkpoints()?;

        if let Some(stored) = stored {
            ensure!(
                finalized.epoch >= stored.finalized.epoch,
                Error::StaleCheckpoint {
                    stored: stored.finalized.epoch,
                    supplied: finalized.epoch,
                },
            );
        }

        let finalized_block = self
            .get_block(finalized.root)?
            .ok_or(Error::UnknownCheckpointBlock {
                root: finalized.root,
            })?;

        ensure!(
            self.contains_block(justified.root)?,
            Error::UnknownCheckpointBlock {
                root: justified.root,
            },
        );

        let mut batch = Batch::new();

        keys::put(
            &mut batch,
            CHECKPOINTS_KEY,
            &Checkpoints {
                justified,
                finalized,
            },
        )?;

        self.canonicalize(&mut batch, finalized_block.clone())?;

        self.database.commit(&batch)?;

        if stored.map(|stored| stored.finalized) != Some(finalized) {
            info!(
                "finalized checkpoint advanced to epoch {} ({:?})",
                finalized.epoch, finalized.root,
            );
        }

        self.prune(&finalized_block)
    }

    /// Reads everything needed to rebuild the in-memory view of the chain.
    ///
    /// Returns `None` if no chain has been stored yet.
    pub fn load_anchor(&self) -> Result<Option<StoredChain>> {
        let Some(Checkpoints {
            justified,
            finalized,
        }) = self.checkpoints()?
        else {
            return Ok(None);
        };

        let finalized_block =
            self.get_block(finalized.root)?
                .ok_or(Error::BlockNotFound {
                    block_root: finalized.root,
                })?;

        let finalized_state = self.state_by_block_root(finalized.root)?;

        let mut descendants = HashSet::from([finalized.root]);
        let mut hot_blocks = vec![];

        // Parents always have lower slots, so they are visited before their children.
        for (_, block_root) in self.block_roots_from(finalized_block.slot + 1)? {
            let block = self
                .get_block(block_root)?
                .ok_or(Error::BlockNotFound { block_root })?;

            if descendants.contains(&block.parent_root) {
                descendants.insert(block.root);
                hot_blocks.push(block);
            }
        }

        let hot_states = itertools::process_results(
            hot_blocks
                .iter()
                .map(|block| self.state_by_block_root(block.root)),
            |states| states.flatten().collect::<Vec<_>>(),
        )?;

        let head = match self.head()? {
            Some(head) if descendants.contains(&head) => head,
            stored_head => {
                if let Some(stored_head) = stored_head {
                    warn!(
                        "stored head {stored_head:?} does not descend from finalized block \
                         {:?}; using the finalized block as head",
                        finalized.root,
                    );
                }

                finalized.root
            }
        };

        Ok(Some(StoredChain {
            head,
            justified,
            finalized,
            finalized_block,
            finalized_state,
            hot_blocks,
            hot_states,
        }))
    }

    pub fn get_block(&self, block_root: H256) -> Result<Option<BlockRecord>> {
        keys::get(&self.database, BlockByRoot(block_root))
    }

    pub fn contains_block(&self, block_root: H256) -> Result<bool> {
        self.database
            .contains_key(keys::serialize_key(BlockByRoot(block_root)))
    }

    pub fn get_state(&self, state_root: H256) -> Result<Option<StateRecord>> {
        keys::get(&self.database, StateByStateRoot(state_root))
    }

    pub fn state_by_block_root(&self, block_root: H256) -> Result<Option<StateRecord>> {
        let Some(state_root) = keys::get(&self.database, StateRootByBlockRoot(block_root))? else {
            return Ok(None);
        };

        self.get_state(state_root)
    }

    /// Root of the block at `slot` on the finalized chain.
    pub fn block_root_by_slot(&self, slot: Slot) -> Result<Option<H256>> {
        keys::get(&self.database, BlockRootBySlot(slot))
    }

    /// Root of the last block at or before `slot` on the finalized chain.
    pub fn block_root_before_or_at_slot(&self, slot: Slot) -> Result<Option<H256>> {
        self.database
            .prev(keys::serialize_key(BlockRootBySlot(slot)))?
            .filter(|(key_bytes, _)| BlockRootBySlot::has_prefix(key_bytes))
            .map(|(_, value_bytes)| keys::deserialize_value(&value_bytes))
            .transpose()
    }

    /// Lazily iterates over blocks of the finalized chain in ascending slot order.
    ///
    /// Every step reads from the latest committed data.
    /// Slots pruned while the iterator is alive are skipped.
    pub fn stream_blocks_by_slot_range(
        &self,
        range: Range<Slot>,
    ) -> impl Iterator<Item = Result<BlockRecord>> + '_ {
        let Range { start, end } = range;
        let mut next_slot = Some(start);

        core::iter::from_fn(move || {
            let slot = next_slot.take().filter(|slot| *slot < end)?;

            match self.canonical_block_at_or_after(slot, end) {
                Ok(Some(block)) => {
                    next_slot = block.slot.checked_add(1);
                    Some(Ok(block))
                }
                Ok(None) => None,
                Err(error) => Some(Err(error)),
            }
        })
    }

    pub fn checkpoints(&self) -> Result<Option<Checkpoints>> {
        keys::get(&self.database, CHECKPOINTS_KEY)
    }

    pub fn head(&self) -> Result<Option<H256>> {
        keys::get(&self.database, HEAD_KEY)
    }

    /// Root of the earliest block kept without its parent.
    pub fn anchor_root(&self) -> Result<Option<H256>> {
        keys::get(&self.database, ANCHOR_KEY)
    }

    /// Slot from which the next prune cycle scans.
    ///
    /// Moves back when blocks or states are stored behind it.
    pub fn prune_cursor(&self) -> Result<Option<Slot>> {
        keys::get(&self.database, PRUNE_CURSOR_KEY)
    }

    /// Slot of the finalized block the last prune cycle ran up to.
    ///
    /// Blocks and states of the finalized chain below it are never deleted.
    /// In `Prune` mode the ones that existed when the cycle ran were deleted by it, so only
    /// history archived before a switch to `Prune` mode remains there.
    pub fn prune_floor(&self) -> Result<Option<Slot>> {
        keys::get(&self.database, PRUNE_FLOOR_KEY)
    }

    pub fn block_count(&self) -> Result<usize> {
        self.count_prefix(SlotBlockRoot::PREFIX)
    }

    pub fn canonical_block_count(&self) -> Result<usize> {
        self.count_prefix(BlockRootBySlot::PREFIX)
    }

    pub fn state_count(&self) -> Result<usize> {
        self.count_prefix(SlotStateRoot::PREFIX)
    }

    fn canonical_block_at_or_after(&self, slot: Slot, end: Slot) -> Result<Option<BlockRecord>> {
        let Some((key_bytes, value_bytes)) = self
            .database
            .next(keys::serialize_key(BlockRootBySlot(slot)))?
            .filter(|(key_bytes, _)| BlockRootBySlot::has_prefix(key_bytes))
        else {
            return Ok(None);
        };

        let BlockRootBySlot(slot) = Cow::<[u8]>::Owned(key_bytes).try_into()?;

        if slot >= end {
            return Ok(None);
        }

        let block_root = keys::deserialize_value(&value_bytes)?;

        self.get_block(block_root)?
            .ok_or(Error::BlockNotFound { block_root })
            .map(Some)
            .map_err(Into::into)
    }

    // Walks back from the finalized block, marking blocks retained and indexing them by slot.
    // Stops at the first block that was already indexed or at the anchor.
    fn canonicalize(&self, batch: &mut Batch, finalized_block: BlockRecord) -> Result<()> {
        let anchor_root = self.anchor_root()?;
        let mut block = finalized_block;

        loop {
            if block.retained && self.block_root_by_slot(block.slot)? == Some(block.root) {
                return Ok(());
            }

            keys::put(batch, BlockRootBySlot(block.slot), &block.root)?;

            if Some(block.root) == anchor_root {
                return Ok(());
            }

            let parent_root = block.parent_root;

            let Some(parent) = self.get_block(parent_root)? else {
                bail!(Error::MissingParent {
                    block_root: block.root,
                    parent_root,
                });
            };

            if !block.retained {
                keys::put(batch, BlockByRoot(block.root), &block.retained())?;
            }

            block = parent;
        }
    }

    // Deletes history in `[prune cursor, finalized slot)`:
    // - blocks and states that are not on the finalized chain in any mode;
    // - blocks and states of the finalized chain from the prune floor on in `Prune` mode.
    //
    // The cursor and the floor are advanced in the same batch, so an interrupted cycle is
    // repeated on the next finalization. Data below the cursor is never revisited.
    fn prune(&self, finalized_block: &BlockRecord) -> Result<PruneSummary> {
        let finalized_slot = finalized_block.slot;
        let cursor = self.prune_cursor()?.unwrap_or(GENESIS_SLOT);
        let floor = self.prune_floor()?.unwrap_or(cursor);

        if cursor >= finalized_slot {
            return Ok(PruneSummary::default());
        }

        let prune_finalized = self.storage_mode.is_prune();
        let mut batch = Batch::new();
        let mut summary = PruneSummary::default();

        let block_entries = self
            .block_roots_from(cursor)?
            .into_iter()
            .take_while(|(slot, _)| *slot < finalized_slot);

        for (slot, block_root) in block_entries {
            let canonical = self.block_root_by_slot(slot)? == Some(block_root);

            if canonical && (!prune_finalized || slot < floor) {
                continue;
            }

            batch.delete(keys::serialize_key(BlockByRoot(block_root)));
            batch.delete(keys::serialize_key(SlotBlockRoot(slot, block_root)));
            batch.delete(keys::serialize_key(StateRootByBlockRoot(block_root)));

            if canonical {
                batch.delete(keys::serialize_key(BlockRootBySlot(slot)));
            }

            summary.deleted_blocks += 1;
        }

        for (slot, state_root, block_root) in self.state_entries_from(cursor)? {
            if slot >= finalized_slot {
                break;
            }

            let canonical = self.block_root_by_slot(slot)? == Some(block_root);

            if canonical && (!prune_finalized || slot < floor) {
                continue;
            }

            batch.delete(keys::serialize_key(StateByStateRoot(state_root)));
            batch.delete(keys::serialize_key(SlotStateRoot(slot, state_root)));

            summary.deleted_states += 1;
        }

        if prune_finalized {
            keys::put(&mut batch, ANCHOR_KEY, &finalized_block.root)?;
        }

        keys::put(&mut batch, PRUNE_CURSOR_KEY, &finalized_slot)?;
        keys::put(&mut batch, PRUNE_FLOOR_KEY, &finalized_slot)?;

        self.database.commit(&batch)?;

        if summary.is_empty() {
            debug!("nothing to prune below slot {finalized_slot}");
        } else {
            info!(
                "pruned {} blocks and {} states in slots {cursor}..{finalized_slot} ({} mode)",
                summary.deleted_blocks, summary.deleted_states, self.storage_mode,
            );
        }

        Ok(summary)
    }

    // Data written behind the prune cursor would never be visited by a prune cycle.
    // The prune floor stays where it is.
    fn rewind_prune_cursor(&self, batch: &mut Batch, slot: Slot) -> Result<()> {
        if let Some(cursor) = self.prune_cursor()? {
            if slot < cursor {
                keys::put(batch, PRUNE_CURSOR_KEY, &slot)?;
            }
        }

        Ok(())
    }

    // The iterator is fully consumed before this returns.
    // Callers perform further reads while processing the entries.
    fn block_roots_from(&self, start_slot: Slot) -> Result<Vec<(Slot, H256)>> {
        let results = self
            .database
            .iterator_ascending(keys::serialize_key(SlotBlockRoot(start_slot, H256::zero()))..)?;

        let mut entries = vec![];

        for result in results {
            let (key_bytes, _) = result?;

            if !SlotBlockRoot::has_prefix(&key_bytes) {
                break;
            }

            let SlotBlockRoot(slot, block_root) = key_bytes.try_into()?;

            entries.push((slot, block_root));
        }

        Ok(entries)
    }

    fn state_entries_from(&self, start_slot: Slot) -> Result<Vec<(Slot, H256, H256)>> {
        let results = self
            .database
            .iterator_ascending(keys::serialize_key(SlotStateRoot(start_slot, H256::zero()))..)?;

        let mut entries = vec![];

        for result in results {
            let (key_bytes, value_bytes) = result?;

            if !SlotStateRoot::has_prefix(&key_bytes) {
                break;
            }

            let SlotStateRoot(slot, state_root) = key_bytes.try_into()?;
            let block_root = keys::deserialize_value(&value_bytes)?;

            entries.push((slot, state_root, block_root));
        }

        Ok(entries)
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let mut count = 0;

        for result in self.database.iterator_prefix(prefix)? {
            result?;
            count += 1;
        }

        Ok(count)
    }
}

fn add_block(batch: &mut Batch, block: &BlockRecord) -> Result<()> {
    keys::put(batch, BlockByRoot(block.root), block)?;
    keys::put(batch, SlotBlockRoot(block.slot, block.root), &block.root)
}

fn add_state(batch: &mut Batch, state: &StateRecord) -> Result<()> {
    keys::put(batch, StateByStateRoot(state.state_root), state)?;
    keys::put(batch, StateRootByBlockRoot(state.block_root), &state.state_root)?;
    keys::put(
        batch,
        SlotStateRoot(state.slot, state.state_root),
        &state.block_root,
    )
}

#[cfg(test)]
mod tests {
    use bytesize::ByteSize;
    use database::{DatabaseMode, InMemoryLocation};
    use tempfile::TempDir;
    use test_case::test_case;
    use types::consts::ZERO_ROOT;
    use unwrap_none::UnwrapNone as _;

    use super::*;

    type Constructor = fn(StorageMode) -> Result<(Storage, Option<TempDir>)>;

    fn build_persistent_storage(mode: StorageMode) -> Result<(Storage, Option<TempDir>)> {
        let directory = TempDir::new()?;

        let database = Database::persistent(
            "test_db",
            directory.path(),
            ByteSize::mib(10),
            DatabaseMode::ReadWrite,
        )?;

        let storage = Storage::open(Arc::new(Config::minimal()), database, mode)?;

        Ok((storage, Some(directory)))
    }

    fn build_in_memory_storage(mode: StorageMode) -> Result<(Storage, Option<TempDir>)> {
        let storage = Storage::open(Arc::new(Config::minimal()), Database::in_memory(), mode)?;
        Ok((storage, None))
    }

    fn genesis() -> Result<AnchorState> {
        let (block, state) = records(ZERO_ROOT, GENESIS_SLOT, 0);
        AnchorState::new(block, state)
    }

    fn records(parent_root: H256, slot: Slot, tag: u8) -> (BlockRecord, StateRecord) {
        let state_payload = vec![tag, 0xff];
        let state_root = StateRecord::compute_root(slot, &state_payload);
        let block = BlockRecord::new(parent_root, slot, state_root, vec![tag]);
        let state = StateRecord::new(block.root, slot, state_payload);
        (block, state)
    }

    // Stores a chain of blocks at `slots` on top of `parent` along with their states.
    fn extend(
        storage: &Storage,
        parent: &BlockRecord,
        slots: impl IntoIterator<Item = Slot>,
        tag: u8,
    ) -> Result<Vec<BlockRecord>> {
        let mut parent = parent.clone();
        let mut blocks = vec![];

        for slot in slots {
            let (block, state) = records(parent.root, slot, tag);
            storage.store_block(block.clone(), BlockRetention::Transient)?;
            storage.store_state(&state)?;
            parent = block.clone();
            blocks.push(block);
        }

        Ok(blocks)
    }

    fn checkpoint(storage: &Storage, block: &BlockRecord) -> Checkpoint {
        Checkpoint::new(storage.config().epoch_at_slot(block.slot), block.root)
    }

    #[test_case(build_persistent_storage)]
    #[test_case(build_in_memory_storage)]
    fn test_finalized_checkpoint_never_regresses(constructor: Constructor) -> Result<()> {
        let (storage, _directory) = constructor(StorageMode::Archive)?;
        let anchor = genesis()?;
        let genesis_checkpoint = storage.store_anchor(&anchor)?.finalized;

        let chain = extend(&storage, anchor.block(), [1, 8], 1)?;
        let epoch_1 = checkpoint(&storage, &chain[1]);

        storage.update_checkpoints(genesis_checkpoint, genesis_checkpoint)?;
        storage.update_checkpoints(epoch_1, epoch_1)?;
        storage.store_head(chain[1].root)?;

        let error = storage
            .update_checkpoints(genesis_checkpoint, genesis_checkpoint)
            .expect_err("finalized epoch 0 is older than epoch 1");

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::StaleCheckpoint {
                stored: 1,
                supplied: 0,
            }),
        ));

        assert_eq!(
            storage.checkpoints()?,
            Some(Checkpoints {
                justified: epoch_1,
                finalized: epoch_1,
            }),
        );
        assert_eq!(storage.head()?, Some(chain[1].root));

        Ok(())
    }

    #[test_case(build_persistent_storage)]
    #[test_case(build_in_memory_storage)]
    fn test_retained_blocks_require_stored_parent(constructor: Constructor) -> Result<()> {
        let (storage, _directory) = constructor(StorageMode::Archive)?;
        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let (orphan, _) = records(H256::repeat_byte(7), 3, 3);

        let error = storage
            .store_block(orphan.clone(), BlockRetention::Retain)
            .expect_err("parent is not stored");

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::MissingParent { .. }),
        ));

        storage.store_block(orphan.clone(), BlockRetention::Transient)?;

        let (child, _) = records(anchor.block().root, 1, 1);

        storage.store_block(child.clone(), BlockRetention::Retain)?;

        assert_eq!(storage.get_block(child.root)?, Some(child.retained()));
        assert_eq!(storage.get_block(orphan.root)?, Some(orphan));

        Ok(())
    }

    #[test_case(build_persistent_storage)]
    #[test_case(build_in_memory_storage)]
    fn test_missing_items_are_not_errors(constructor: Constructor) -> Result<()> {
        let (storage, _directory) = constructor(StorageMode::Prune)?;
        let root = H256::repeat_byte(1);

        storage.get_block(root)?.unwrap_none();
        storage.get_state(root)?.unwrap_none();
        storage.state_by_block_root(root)?.unwrap_none();
        storage.load_anchor()?.unwrap_none();

        Ok(())
    }

    #[test_case(build_persistent_storage)]
    #[test_case(build_in_memory_storage)]
    fn test_prune_mode_keeps_states_from_finalized_slot(constructor: Constructor) -> Result<()> {
        let (storage, _directory) = constructor(StorageMode::Prune)?;
        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let chain = extend(&storage, anchor.block(), 1..=20, 1)?;
        let fork = extend(&storage, &chain[2], [4, 5], 2)?;
        let finalized = checkpoint(&storage, &chain[15]);

        let summary = storage.update_checkpoints(finalized, finalized)?;

        // Genesis and slots 1 through 15 on the chain plus the 2 fork blocks.
        assert_eq!(summary.deleted_blocks, 18);
        assert_eq!(summary.deleted_states, 18);

        for block in &chain[..15] {
            storage.get_block(block.root)?.unwrap_none();
            storage.state_by_block_root(block.root)?.unwrap_none();
        }

        for block in &fork {
            storage.get_block(block.root)?.unwrap_none();
        }

        for block in &chain[15..] {
            assert!(storage.contains_block(block.root)?);
            assert!(storage.state_by_block_root(block.root)?.is_some());
        }

        assert_eq!(storage.anchor_root()?, Some(chain[15].root));
        assert_eq!(storage.prune_cursor()?, Some(16));

        Ok(())
    }

    #[test_case(build_persistent_storage)]
    #[test_case(build_in_memory_storage)]
    fn test_archive_mode_keeps_finalized_chain(constructor: Constructor) -> Result<()> {
        let (storage, _directory) = constructor(StorageMode::Archive)?;
        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let chain = extend(&storage, anchor.block(), 1..=10, 1)?;
        let fork = extend(&storage, &chain[2], [4, 5], 2)?;
        let finalized = checkpoint(&storage, &chain[7]);

        let summary = storage.update_checkpoints(finalized, finalized)?;

        assert_eq!(summary.deleted_blocks, 2);
        assert_eq!(summary.deleted_states, 2);

        for block in &fork {
            storage.get_block(block.root)?.unwrap_none();
        }

        for block in &chain[..=7] {
            let stored = storage.get_block(block.root)?.expect("finalized chain is kept");
            assert!(stored.retained);
            assert_eq!(storage.block_root_by_slot(block.slot)?, Some(block.root));
        }

        // Blocks after the finalized one are not canonicalized yet.
        assert!(!storage
            .get_block(chain[8].root)?
            .expect("hot block is kept")
            .retained);

        assert_eq!(storage.canonical_block_count()?, 9);
        assert_eq!(storage.anchor_root()?, Some(anchor.block().root));

        Ok(())
    }

    #[test_case(build_persistent_storage)]
    #[test_case(build_in_memory_storage)]
    fn test_stream_blocks_by_slot_range(constructor: Constructor) -> Result<()> {
        let (storage, _directory) = constructor(StorageMode::Archive)?;
        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let chain = extend(&storage, anchor.block(), [1, 2, 5, 9, 12], 1)?;
        let finalized = checkpoint(&storage, &chain[4]);

        storage.update_checkpoints(finalized, finalized)?;

        let slots = storage
            .stream_blocks_by_slot_range(2..10)
            .map(|result| result.map(|block| block.slot))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(slots, [2, 5, 9]);
        assert_eq!(storage.stream_blocks_by_slot_range(13..20).count(), 0);
        assert_eq!(storage.block_root_before_or_at_slot(8)?, Some(chain[2].root));

        Ok(())
    }

    #[test_case(build_persistent_storage)]
    #[test_case(build_in_memory_storage)]
    fn test_load_anchor_returns_descendants_of_finalized(constructor: Constructor) -> Result<()> {
        let (storage, _directory) = constructor(StorageMode::Prune)?;
        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let chain = extend(&storage, anchor.block(), 1..=12, 1)?;
        let stale_fork = extend(&storage, &chain[2], [9, 10], 2)?;
        let justified = checkpoint(&storage, &chain[9]);
        let finalized = checkpoint(&storage, &chain[7]);

        storage.update_checkpoints(justified, finalized)?;
        storage.store_head(chain[11].root)?;

        let stored = storage.load_anchor()?.expect("chain is stored");

        assert_eq!(stored.head, chain[11].root);
        assert_eq!(stored.justified, justified);
        assert_eq!(stored.finalized, finalized);
        assert_eq!(stored.finalized_block.root, chain[7].root);
        assert_eq!(
            stored.finalized_state.map(|state| state.block_root),
            Some(chain[7].root),
        );
        assert_eq!(
            stored.hot_blocks.iter().map(|block| block.root).collect::<Vec<_>>(),
            chain[8..].iter().map(|block| block.root).collect::<Vec<_>>(),
        );
        assert_eq!(stored.hot_states.len(), 4);
        assert!(stored
            .hot_blocks
            .iter()
            .all(|block| stale_fork.iter().all(|fork_block| fork_block.root != block.root)));

        Ok(())
    }

    #[test]
    fn test_switch_to_prune_is_not_retroactive() -> Result<()> {
        let location = InMemoryLocation::new();
        let config = Arc::new(Config::minimal());

        let storage = Storage::open(
            Arc::clone(&config),
            Database::in_memory_at(&location)?,
            StorageMode::Archive,
        )?;

        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let chain = extend(&storage, anchor.block(), 1..=24, 1)?;
        let epoch_1 = checkpoint(&storage, &chain[7]);

        storage.update_checkpoints(epoch_1, epoch_1)?;
        storage.close()?;

        let storage = Storage::open(
            config,
            Database::in_memory_at(&location)?,
            StorageMode::Prune,
        )?;

        let epoch_2 = checkpoint(&storage, &chain[15]);

        storage.update_checkpoints(epoch_2, epoch_2)?;

        // Slots behind the first finalized checkpoint stay archived.
        assert!(storage.contains_block(anchor.block().root)?);

        for block in &chain[..7] {
            assert!(storage.contains_block(block.root)?);
            assert!(storage.state_by_block_root(block.root)?.is_some());
        }

        // Slots between the two checkpoints are pruned.
        for block in &chain[7..15] {
            storage.get_block(block.root)?.unwrap_none();
            storage.state_by_block_root(block.root)?.unwrap_none();
        }

        assert!(storage.contains_block(chain[15].root)?);
        assert_eq!(
            storage.metadata()?.map(|metadata| metadata.storage_mode),
            Some(StorageMode::Prune),
        );

        Ok(())
    }

    #[test]
    fn test_late_blocks_behind_cursor_are_pruned() -> Result<()> {
        let (storage, _directory) = build_in_memory_storage(StorageMode::Archive)?;
        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let chain = extend(&storage, anchor.block(), 1..=16, 1)?;
        let epoch_1 = checkpoint(&storage, &chain[7]);

        storage.update_checkpoints(epoch_1, epoch_1)?;

        let late_fork = extend(&storage, &chain[1], [3], 2)?;

        assert_eq!(storage.prune_cursor()?, Some(3));

        let epoch_2 = checkpoint(&storage, &chain[15]);
        let summary = storage.update_checkpoints(epoch_2, epoch_2)?;

        assert_eq!(summary.deleted_blocks, 1);
        storage.get_block(late_fork[0].root)?.unwrap_none();
        assert!(storage.contains_block(chain[2].root)?);

        Ok(())
    }

    #[test]
    fn test_late_block_after_switch_to_prune_keeps_archived_history() -> Result<()> {
        let location = InMemoryLocation::new();
        let config = Arc::new(Config::minimal());

        let storage = Storage::open(
            Arc::clone(&config),
            Database::in_memory_at(&location)?,
            StorageMode::Archive,
        )?;

        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let chain = extend(&storage, anchor.block(), 1..=24, 1)?;
        let epoch_1 = checkpoint(&storage, &chain[7]);

        storage.update_checkpoints(epoch_1, epoch_1)?;
        storage.close()?;

        let storage = Storage::open(
            config,
            Database::in_memory_at(&location)?,
            StorageMode::Prune,
        )?;

        let late_fork = extend(&storage, &chain[1], [3], 2)?;

        assert_eq!(storage.prune_cursor()?, Some(3));
        assert_eq!(storage.prune_floor()?, Some(8));

        let epoch_2 = checkpoint(&storage, &chain[15]);
        let summary = storage.update_checkpoints(epoch_2, epoch_2)?;

        // The late fork block plus slots 8 through 15.
        assert_eq!(summary.deleted_blocks, 9);
        assert_eq!(summary.deleted_states, 9);

        storage.get_block(late_fork[0].root)?.unwrap_none();

        for block in &chain[..7] {
            assert!(storage.contains_block(block.root)?);
            assert!(storage.state_by_block_root(block.root)?.is_some());
            assert_eq!(storage.block_root_by_slot(block.slot)?, Some(block.root));
        }

        for block in &chain[7..15] {
            storage.get_block(block.root)?.unwrap_none();
        }

        assert_eq!(storage.prune_cursor()?, Some(16));
        assert_eq!(storage.prune_floor()?, Some(16));

        Ok(())
    }

    #[test_case(build_persistent_storage)]
    #[test_case(build_in_memory_storage)]
    fn test_late_blocks_behind_cursor_in_prune_mode(constructor: Constructor) -> Result<()> {
        let (storage, _directory) = constructor(StorageMode::Prune)?;
        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let chain = extend(&storage, anchor.block(), 1..=16, 1)?;
        let epoch_1 = checkpoint(&storage, &chain[7]);

        // Genesis and slots 1 through 7.
        assert_eq!(storage.update_checkpoints(epoch_1, epoch_1)?.deleted_blocks, 8);

        let late_fork = extend(&storage, &chain[1], [3], 2)?;

        assert_eq!(storage.prune_cursor()?, Some(3));
        assert_eq!(storage.prune_floor()?, Some(8));

        let epoch_2 = checkpoint(&storage, &chain[15]);
        let summary = storage.update_checkpoints(epoch_2, epoch_2)?;

        assert_eq!(summary.deleted_blocks, 9);
        assert_eq!(summary.deleted_states, 9);

        storage.get_block(late_fork[0].root)?.unwrap_none();
        storage.state_by_block_root(late_fork[0].root)?.unwrap_none();

        for block in &chain[7..15] {
            storage.get_block(block.root)?.unwrap_none();
            storage.state_by_block_root(block.root)?.unwrap_none();
        }

        assert!(storage.contains_block(chain[15].root)?);
        assert!(storage.state_by_block_root(chain[15].root)?.is_some());
        assert_eq!(storage.anchor_root()?, Some(chain[15].root));
        assert_eq!(storage.prune_cursor()?, Some(16));

        Ok(())
    }

    #[test]
    fn test_close_requires_last_handle() -> Result<()> {
        let location = InMemoryLocation::new();
        let config = Arc::new(Config::minimal());

        let storage = Storage::open(
            Arc::clone(&config),
            Database::in_memory_at(&location)?,
            StorageMode::Prune,
        )?;

        let deposits = storage.deposits();

        let error = storage.clone().close().expect_err("two handles are alive");

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::DatabaseInUse),
        ));

        drop(deposits);

        storage.close()?;

        assert!(!location.is_open());

        Storage::open(config, Database::in_memory_at(&location)?, StorageMode::Prune)?;

        Ok(())
    }

    #[test]
    fn test_second_anchor_is_rejected() -> Result<()> {
        let (storage, _directory) = build_in_memory_storage(StorageMode::Prune)?;
        let anchor = genesis()?;

        storage.store_anchor(&anchor)?;

        let error = storage
            .store_anchor(&anchor)
            .expect_err("storage already has a chain");

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::AlreadyAnchored),
        ));

        Ok(())
    }

    #[test]
    fn test_open_existing_keeps_stored_mode() -> Result<()> {
        let location = InMemoryLocation::new();
        let config = Arc::new(Config::minimal());

        let error = Storage::open_existing(Arc::clone(&config), Database::in_memory_at(&location)?)
            .err()
            .expect("empty database has no metadata");

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::MissingMetadata),
        ));

        Storage::open(
            Arc::clone(&config),
            Database::in_memory_at(&location)?,
            StorageMode::Archive,
        )?
        .close()?;

        let storage = Storage::open_existing(config, Database::in_memory_at(&location)?)?;

        assert_eq!(storage.storage_mode(), StorageMode::Archive);
        assert_eq!(
            storage.metadata()?.map(|metadata| metadata.storage_mode),
            Some(StorageMode::Archive),
        );

        Ok(())
    }

    #[test]
    fn test_open_existing_does_not_rewrite_metadata() -> Result<()> {
        let location = InMemoryLocation::new();
        let config = Arc::new(Config::minimal());

        let newer = StorageMetadata {
            application: metadata::APPLICATION_NAME.to_owned(),
            schema_version: "1.1.0".to_owned(),
            storage_mode: StorageMode::Prune,
        };

        let database = Database::in_memory_at(&location)?;
        let (key, value) = keys::serialize(keys::METADATA_KEY, &newer)?;

        database.put(key, value)?;
        database.close();

        let storage =
            Storage::open_existing(Arc::clone(&config), Database::in_memory_at(&location)?)?;

        assert_eq!(storage.storage_mode(), StorageMode::Prune);
        assert_eq!(storage.metadata()?, Some(newer));

        storage.close()?;

        // Opening for writing records the schema this build writes.
        let storage = Storage::open(
            config,
            Database::in_memory_at(&location)?,
            StorageMode::Prune,
        )?;

        assert_eq!(
            storage.metadata()?.map(|metadata| metadata.schema_version),
            Some(metadata::SCHEMA_VERSION.to_owned()),
        );

        Ok(())
    }
}
