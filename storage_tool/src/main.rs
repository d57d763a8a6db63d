use std::{process::ExitCode, sync::Arc};

use anyhow::Result;
use chain_storage::{Storage, StorageMode};
use clap::{Error as ClapError, Parser as _};
use database::DatabaseMode;
use log::{error, info, LevelFilter};
use storage_system::StorageConfig;

use crate::{
    args::{StorageCommand, StorageToolArgs},
    report::StorageInfo,
};

mod args;
mod report;

fn main() -> ExitCode {
    if let Err(error) = try_main() {
        error.downcast_ref().map(ClapError::exit);
        error!("{error:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn try_main() -> Result<()> {
    initialize_logger()?;

    let StorageToolArgs {
        data_dir,
        network,
        db_size,
        command,
    } = StorageToolArgs::try_parse()?;

    // The mode is only used to locate the database. Storage is opened in its stored mode.
    let mut storage_config = StorageConfig::persistent(data_dir, StorageMode::default());
    storage_config.db_size = db_size;

    let database = storage_config.open_database(DatabaseMode::ReadWrite)?;
    let storage = Storage::open_existing(Arc::new(network.chain_config()), database)?;

    match command {
        StorageCommand::Info => StorageInfo::load(&storage)?.report(),
        StorageCommand::Blocks { from, to } => {
            for line in report::canonical_blocks(&storage, from, to)? {
                info!("{line}");
            }
        }
        StorageCommand::Deposits { from } => {
            for line in report::deposits(&storage, from)? {
                info!("{line}");
            }
        }
    }

    storage.close()
}

fn initialize_logger() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Warn)
        .filter_module(module_path!(), LevelFilter::Info)
        .filter_module("chain_storage", LevelFilter::Info)
        .filter_module("database", LevelFilter::Info)
        .format_target(false)
        .parse_default_env()
        .try_init()?;

    Ok(())
}
