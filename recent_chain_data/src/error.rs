use thiserror::Error;
use types::{containers::Checkpoint, primitives::H256};

#[derive(Debug, Error)]
pub enum Error {
    #[error("recent chain data has not been initialized")]
    Uninitialized,
    #[error("recent chain data has already been initialized")]
    AlreadyInitialized,
    #[error("recent chain data has been closed")]
    Closed,
    #[error("block is not in the fork-choice DAG: {block_root:?}")]
    UnknownBlock { block_root: H256 },
    #[error("block {block_root:?} has been marked invalid")]
    InvalidBlock { block_root: H256 },
    #[error("block {block_root:?} does not descend from finalized checkpoint {finalized:?}")]
    NotDescendantOfFinalized {
        block_root: H256,
        finalized: Checkpoint,
    },
}
