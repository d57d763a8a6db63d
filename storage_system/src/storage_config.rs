use std::path::PathBuf;

use anyhow::Result;
use bytesize::ByteSize;
use chain_storage::StorageMode;
use database::{Database, DatabaseMode, InMemoryLocation};
use recent_chain_data::StoreConfig;

pub const DATABASE_NAME: &str = "chain_storage";
pub const DEFAULT_DB_SIZE: ByteSize = ByteSize::gib(16);

#[derive(Clone, Debug)]
pub enum StorageLocation {
    InMemory(InMemoryLocation),
    Persistent { directory: PathBuf },
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub location: StorageLocation,
    pub storage_mode: StorageMode,
    pub store_config: StoreConfig,
    pub db_size: ByteSize,
}

impl StorageConfig {
    #[must_use]
    pub fn in_memory(location: InMemoryLocation, storage_mode: StorageMode) -> Self {
        Self {
            location: StorageLocation::InMemory(location),
            storage_mode,
            store_config: StoreConfig::default(),
            db_size: DEFAULT_DB_SIZE,
        }
    }

    #[must_use]
    pub fn persistent(directory: impl Into<PathBuf>, storage_mode: StorageMode) -> Self {
        Self {
            location: StorageLocation::Persistent {
                directory: directory.into(),
            },
            storage_mode,
            store_config: StoreConfig::default(),
            db_size: DEFAULT_DB_SIZE,
        }
    }

    /// Opens the database at the configured location.
    ///
    /// Fails with [`database::Error::LockHeld`] if the location is already open.
    pub fn open_database(&self, mode: DatabaseMode) -> Result<Database> {
        match &self.location {
            StorageLocation::InMemory(location) => Database::in_memory_at(location),
            StorageLocation::Persistent { directory } => {
                Database::persistent(DATABASE_NAME, directory, self.db_size, mode)
            }
        }
    }
}
