use anyhow::{ensure, Result};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::primitives::{DepositIndex, Epoch, ExecutionBlockNumber, Slot, UnixSeconds, H256};

#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Deserialize, Serialize, Constructor,
)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: H256,
}

/// A block as stored by this node.
///
/// `payload` is opaque. The identifier is the hash of the content fields, which never change after
/// the record is first written. `retained` records whether the block belongs to the permanently
/// kept chain. It only ever changes from `false` to `true`.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct BlockRecord {
    pub root: H256,
    pub parent_root: H256,
    pub slot: Slot,
    pub state_root: H256,
    pub payload: Vec<u8>,
    pub retained: bool,
}

impl BlockRecord {
    #[must_use]
    pub fn new(parent_root: H256, slot: Slot, state_root: H256, payload: Vec<u8>) -> Self {
        let root = hash_fields(&[
            parent_root.as_bytes(),
            &slot.to_le_bytes(),
            state_root.as_bytes(),
            &payload,
        ]);

        Self {
            root,
            parent_root,
            slot,
            state_root,
            payload,
            retained: false,
        }
    }

    #[must_use]
    pub fn retained(mut self) -> Self {
        self.retained = true;
        self
    }

    #[must_use]
    pub fn has_valid_root(&self) -> bool {
        Self::new(
            self.parent_root,
            self.slot,
            self.state_root,
            self.payload.clone(),
        )
        .root
            == self.root
    }
}

/// A post-state of a block. `payload` is opaque.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct StateRecord {
    pub state_root: H256,
    pub block_root: H256,
    pub slot: Slot,
    pub payload: Vec<u8>,
}

impl StateRecord {
    /// The state root covers `slot` and `payload` only.
    /// Block records refer to state roots, so a state root cannot depend on its block.
    #[must_use]
    pub fn new(block_root: H256, slot: Slot, payload: Vec<u8>) -> Self {
        Self {
            state_root: Self::compute_root(slot, &payload),
            block_root,
            slot,
            payload,
        }
    }

    #[must_use]
    pub fn compute_root(slot: Slot, payload: &[u8]) -> H256 {
        hash_fields(&[&slot.to_le_bytes(), payload])
    }
}

/// A block and its post-state used to start a chain when no prior data exists.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct AnchorState {
    block: BlockRecord,
    state: StateRecord,
}

impl AnchorState {
    pub fn new(block: BlockRecord, state: StateRecord) -> Result<Self> {
        ensure!(
            block.state_root == state.state_root
                && state.block_root == block.root
                && block.slot == state.slot,
            Error::AnchorMismatch {
                block_root: block.root,
                state_root: state.state_root,
            },
        );

        Ok(Self {
            block: block.retained(),
            state,
        })
    }

    #[must_use]
    pub const fn block(&self) -> &BlockRecord {
        &self.block
    }

    #[must_use]
    pub const fn state(&self) -> &StateRecord {
        &self.state
    }

    #[must_use]
    pub const fn slot(&self) -> Slot {
        self.block.slot
    }

    #[must_use]
    pub fn into_parts(self) -> (BlockRecord, StateRecord) {
        (self.block, self.state)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize, Constructor)]
pub struct Eth1BlockRef {
    pub number: ExecutionBlockNumber,
    pub hash: H256,
    pub timestamp: UnixSeconds,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize, Constructor)]
pub struct DepositRecord {
    pub index: DepositIndex,
    pub eth1_block: Eth1BlockRef,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("anchor block {block_root:?} and state {state_root:?} do not belong together")]
    AnchorMismatch { block_root: H256, state_root: H256 },
}

fn hash_fields(fields: &[&[u8]]) -> H256 {
    let mut hasher = Sha256::new();

    for field in fields {
        hasher.update(field);
    }

    H256(hasher.finalize().into())
}
