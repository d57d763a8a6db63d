pub use crate::{
    chain_builder::{ChainBuilder, ChainUpdater},
    error::{Error, RestartStep},
    storage_config::{StorageConfig, StorageLocation, DATABASE_NAME, DEFAULT_DB_SIZE},
    storage_system::{ForkChoiceRecovery, Recovery, StorageSystem},
};

mod chain_builder;
mod error;
mod storage_config;
mod storage_system;
