use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use types::{
    containers::{BlockRecord, Checkpoint, StateRecord},
    primitives::H256,
};

/// Which history survives finalization.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StorageMode {
    /// Keep every block and state on the finalized chain.
    Archive,
    /// Keep only the finalized block and state and everything after them.
    #[default]
    Prune,
}

impl StorageMode {
    #[must_use]
    pub const fn is_prune(self) -> bool {
        matches!(self, Self::Prune)
    }

    #[must_use]
    pub const fn is_archive(self) -> bool {
        matches!(self, Self::Archive)
    }
}

/// How a newly imported block should be treated until it is finalized.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockRetention {
    /// The block extends stored history. Its parent must already be stored.
    Retain,
    /// The block may be discarded by the next prune cycle unless it ends up on the finalized chain.
    /// Its parent does not have to be stored yet.
    Transient,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Checkpoints {
    pub justified: Checkpoint,
    pub finalized: Checkpoint,
}

/// Everything needed to rebuild the in-memory view of the chain.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoredChain {
    pub head: H256,
    pub justified: Checkpoint,
    pub finalized: Checkpoint,
    pub finalized_block: BlockRecord,
    pub finalized_state: Option<StateRecord>,
    /// Descendants of the finalized block in ascending slot order.
    pub hot_blocks: Vec<BlockRecord>,
    pub hot_states: Vec<StateRecord>,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct PruneSummary {
    pub deleted_blocks: usize,
    pub deleted_states: usize,
}

impl PruneSummary {
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.deleted_blocks == 0 && self.deleted_states == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_mode_parses_case_insensitively() -> Result<(), strum::ParseError> {
        assert_eq!("archive".parse::<StorageMode>()?, StorageMode::Archive);
        assert_eq!("PRUNE".parse::<StorageMode>()?, StorageMode::Prune);
        assert_eq!(StorageMode::Archive.to_string(), "archive");
        Ok(())
    }
}
