use crate::primitives::{Epoch, Slot, H256};

pub const GENESIS_EPOCH: Epoch = 0;
pub const GENESIS_SLOT: Slot = 0;

/// Parent of blocks that have none, such as the genesis block.
pub const ZERO_ROOT: H256 = H256::zero();
