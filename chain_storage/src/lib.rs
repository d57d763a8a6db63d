pub use crate::{
    deposits::{
        DepositStorage, DepositsFromBlockEvent, Eth1Event, Eth1EventsChannel,
        MinGenesisTimeBlockEvent, ReplayDepositsResult, TrackingEth1EventsChannel,
    },
    error::Error,
    fork_choice_snapshot::{ForkChoiceSnapshot, ForkChoiceSnapshotStore},
    metadata::{StorageMetadata, APPLICATION_NAME, SCHEMA_VERSION},
    misc::{BlockRetention, Checkpoints, PruneSummary, StorageMode, StoredChain},
    storage::Storage,
};

mod deposits;
mod error;
mod fork_choice_snapshot;
mod keys;
mod metadata;
mod misc;
mod storage;
