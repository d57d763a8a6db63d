use semver::Version;
use thiserror::Error;
use types::{
    containers::Checkpoint,
    primitives::{DepositIndex, Epoch, H256},
};

use crate::metadata::{APPLICATION_NAME, VERSION_REQUIREMENT};

#[derive(Debug, Error)]
pub enum Error {
    #[error("finalized checkpoint cannot move back from epoch {stored} to epoch {supplied}")]
    StaleCheckpoint { stored: Epoch, supplied: Epoch },
    #[error("deposit index {actual} does not follow the last stored index (expected {expected})")]
    SequenceGap {
        expected: DepositIndex,
        actual: DepositIndex,
    },
    #[error("parent {parent_root:?} of retained block {block_root:?} is not stored")]
    MissingParent { block_root: H256, parent_root: H256 },
    #[error("block not found in storage: {block_root:?}")]
    BlockNotFound { block_root: H256 },
    #[error("state not found in storage: {state_root:?}")]
    StateNotFound { state_root: H256 },
    #[error("checkpoint refers to a block that is not stored: {root:?}")]
    UnknownCheckpointBlock { root: H256 },
    #[error(
        "fork-choice snapshot was taken at {snapshot:?} \
         but storage reports finalized checkpoint {stored:?}"
    )]
    SnapshotMismatch {
        snapshot: Checkpoint,
        stored: Checkpoint,
    },
    #[error("expected application name {APPLICATION_NAME:?}, found {actual:?}")]
    ApplicationMismatch { actual: String },
    #[error("expected schema version compatible with {VERSION_REQUIREMENT}, found {version}")]
    IncompatibleSchema { version: Version },
    #[error("storage key has incorrect prefix: {bytes:?}")]
    IncorrectPrefix { bytes: Vec<u8> },
    #[error("storage has not been initialized")]
    MissingMetadata,
    #[error("storage already contains a chain")]
    AlreadyAnchored,
    #[error("database cannot be closed while other handles refer to it")]
    DatabaseInUse,
}
