use core::fmt::{Display, Formatter, Result as FmtResult};

use anyhow::Result;
use chain_storage::{Checkpoints, Error, Storage, StorageMetadata};
use log::info;
use types::{
    containers::{BlockRecord, DepositRecord, Eth1BlockRef},
    primitives::{DepositIndex, Slot, H256},
};

#[derive(PartialEq, Eq, Debug)]
pub struct StorageInfo {
    pub metadata: StorageMetadata,
    pub checkpoints: Option<Checkpoints>,
    pub head: Option<H256>,
    pub anchor_root: Option<H256>,
    pub prune_cursor: Option<Slot>,
    pub prune_floor: Option<Slot>,
    pub block_count: usize,
    pub canonical_block_count: usize,
    pub state_count: usize,
    pub last_deposit_index: Option<DepositIndex>,
    pub min_genesis_time_block: Option<Eth1BlockRef>,
}

impl StorageInfo {
    pub fn load(storage: &Storage) -> Result<Self> {
        let deposits = storage.deposits();

        Ok(Self {
            metadata: storage.metadata()?.ok_or(Error::MissingMetadata)?,
            checkpoints: storage.checkpoints()?,
            head: storage.head()?,
            anchor_root: storage.anchor_root()?,
            prune_cursor: storage.prune_cursor()?,
            prune_floor: storage.prune_floor()?,
            block_count: storage.block_count()?,
            canonical_block_count: storage.canonical_block_count()?,
            state_count: storage.state_count()?,
            last_deposit_index: deposits.last_index()?,
            min_genesis_time_block: deposits.min_genesis_time_block()?,
        })
    }

    pub fn report(&self) {
        let Self {
            metadata,
            checkpoints,
            head,
            anchor_root,
            prune_cursor,
            prune_floor,
            block_count,
            canonical_block_count,
            state_count,
            last_deposit_index,
            min_genesis_time_block,
        } = self;

        info!(
            "{} schema version {} in {} mode",
            metadata.application, metadata.schema_version, metadata.storage_mode,
        );

        match checkpoints {
            Some(Checkpoints {
                justified,
                finalized,
            }) => {
                info!(
                    "finalized checkpoint: epoch {} ({:?})",
                    finalized.epoch, finalized.root,
                );
                info!(
                    "justified checkpoint: epoch {} ({:?})",
                    justified.epoch, justified.root,
                );
            }
            None => info!("no chain stored"),
        }

        if let Some(head) = head {
            info!("head: {head:?}");
        }

        if let Some(anchor_root) = anchor_root {
            info!("anchor: {anchor_root:?}");
        }

        if let Some(prune_cursor) = prune_cursor {
            info!("next prune cycle scans from slot {prune_cursor}");
        }

        if let Some(prune_floor) = prune_floor {
            info!("prune cycles have run up to slot {prune_floor}");
        }

        info!(
            "blocks: {block_count} ({canonical_block_count} on the finalized chain), \
             states: {state_count}",
        );

        match last_deposit_index {
            Some(index) => info!("deposits: 0..={index}"),
            None => info!("deposits: none"),
        }

        if let Some(block) = min_genesis_time_block {
            info!(
                "min genesis time block: {} ({:?}) at {}",
                block.number, block.hash, block.timestamp,
            );
        }
    }
}

pub struct BlockLine(BlockRecord);

impl Display for BlockLine {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        let BlockRecord {
            root,
            parent_root,
            slot,
            state_root,
            payload,
            ..
        } = &self.0;

        write!(
            formatter,
            "slot {slot}: {root:?} (parent {parent_root:?}, state {state_root:?}, {} bytes)",
            payload.len(),
        )
    }
}

pub struct DepositLine(DepositRecord);

impl Display for DepositLine {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        let DepositRecord {
            index,
            eth1_block,
            payload,
        } = &self.0;

        write!(
            formatter,
            "deposit {index}: eth1 block {} ({:?}), {} bytes",
            eth1_block.number,
            eth1_block.hash,
            payload.len(),
        )
    }
}

/// Blocks of the finalized chain with slots from `from` to `to` inclusive.
pub fn canonical_blocks(storage: &Storage, from: Slot, to: Slot) -> Result<Vec<BlockLine>> {
    storage
        .stream_blocks_by_slot_range(from..to.saturating_add(1))
        .map(|result| result.map(BlockLine))
        .collect()
}

pub fn deposits(storage: &Storage, from: DepositIndex) -> Result<Vec<DepositLine>> {
    let deposits = storage.deposits();

    deposits
        .replay_from(from)
        .map(|result| result.map(DepositLine))
        .collect()
}
