pub use ethereum_types::H256;

pub type DepositIndex = u64;
pub type Epoch = u64;
pub type ExecutionBlockNumber = u64;
pub type Slot = u64;
pub type UnixSeconds = u64;

/// Weight accumulated along a chain from the fork-choice root.
///
/// A descendant never weighs less than its ancestors.
pub type Weight = u64;
