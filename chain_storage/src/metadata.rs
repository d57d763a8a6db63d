use anyhow::{ensure, Result};
use database::Database;
use log::info;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    keys::{self, METADATA_KEY},
    misc::StorageMode,
};

pub const APPLICATION_NAME: &str = "chain_storage";

// # Schema version history
//
// ## 1.0.0
//
// Blocks, states, checkpoints, the fork-choice snapshot and the deposit log share one database.
// Block and state slot indices contain roots so that forks at the same slot do not collide.
pub const SCHEMA_VERSION: &str = "1.0.0";

// Backward compatibility is achieved using a version requirement separate from the schema version.
pub const VERSION_REQUIREMENT: &str = "^1.0";

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct StorageMetadata {
    pub application: String,
    pub schema_version: String,
    pub storage_mode: StorageMode,
}

impl StorageMetadata {
    fn current(storage_mode: StorageMode) -> Self {
        Self {
            application: APPLICATION_NAME.to_owned(),
            schema_version: SCHEMA_VERSION.to_owned(),
            storage_mode,
        }
    }
}

/// Validates stored metadata and records the current schema version and storage mode.
///
/// Returns the storage mode the data was last written with, if any.
pub fn initialize(database: &Database, storage_mode: StorageMode) -> Result<Option<StorageMode>> {
    let Some(stored) = keys::get::<StorageMetadata>(database, METADATA_KEY)? else {
        write(database, storage_mode)?;

        info!("initialized storage with schema version {SCHEMA_VERSION} in {storage_mode} mode");

        return Ok(None);
    };

    validate(&stored)?;

    let StorageMetadata {
        schema_version,
        storage_mode: previous_mode,
        ..
    } = stored;

    if previous_mode != storage_mode {
        info!(
            "storage mode changed from {previous_mode} to {storage_mode}; \
             data pruned earlier stays pruned and older data is not pruned retroactively",
        );
    }

    // Set the schema version to the current one even if it's older.
    // The application can only write data conforming to the current schema.
    if schema_version != SCHEMA_VERSION || previous_mode != storage_mode {
        write(database, storage_mode)?;
    }

    Ok(Some(previous_mode))
}

/// Checks that stored metadata was written by this application with a compatible schema.
///
/// Writes nothing.
pub fn validate(metadata: &StorageMetadata) -> Result<()> {
    ensure!(
        metadata.application == APPLICATION_NAME,
        Error::ApplicationMismatch {
            actual: metadata.application.clone(),
        },
    );

    let version = metadata.schema_version.parse::<Version>()?;

    ensure!(
        VersionReq::parse(VERSION_REQUIREMENT)
            .expect("constant contains valid Semantic Versioning requirement")
            .matches(&version),
        Error::IncompatibleSchema { version },
    );

    Ok(())
}

pub fn load(database: &Database) -> Result<Option<StorageMetadata>> {
    keys::get(database, METADATA_KEY)
}

fn write(database: &Database, storage_mode: StorageMode) -> Result<()> {
    let (key, value) = keys::serialize(METADATA_KEY, &StorageMetadata::current(storage_mode))?;
    database.put(key, value)
}
