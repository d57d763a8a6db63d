use std::path::PathBuf;

use bytesize::ByteSize;
use clap::{Parser, Subcommand, ValueEnum};
use storage_system::DEFAULT_DB_SIZE;
use types::{
    config::Config,
    primitives::{DepositIndex, Slot},
};

/// Inspect chain storage written by a node
#[derive(Parser)]
#[cfg_attr(test, derive(Debug))]
#[clap(verbatim_doc_comment)]
pub struct StorageToolArgs {
    /// Directory containing the storage database
    #[clap(long, value_name = "DIRECTORY")]
    pub data_dir: PathBuf,

    /// Network the storage was written for
    #[clap(long, value_enum, default_value_t = Network::default())]
    pub network: Network,

    /// Max size of the database
    #[clap(long, default_value_t = DEFAULT_DB_SIZE)]
    pub db_size: ByteSize,

    #[clap(subcommand)]
    pub command: StorageCommand,
}

#[derive(Subcommand)]
#[cfg_attr(test, derive(PartialEq, Eq, Debug))]
pub enum StorageCommand {
    /// Show storage mode, checkpoints, head and record counts
    /// (example: storage_tool --data-dir data info)
    Info,

    /// Show blocks of the finalized chain within slot range
    /// (example: storage_tool --data-dir data blocks --from 0 --to 31)
    Blocks {
        /// First slot to show (inclusive)
        #[clap(short, long, value_name = "SLOT", default_value_t = 0)]
        from: Slot,

        /// Last slot to show (inclusive)
        #[clap(short, long, value_name = "SLOT")]
        to: Slot,
    },

    /// Show stored deposits starting at an index
    /// (example: storage_tool --data-dir data deposits --from 100)
    Deposits {
        /// First deposit index to show
        #[clap(short, long, value_name = "INDEX", default_value_t = 0)]
        from: DepositIndex,
    },
}

#[derive(Clone, Copy, Default, ValueEnum)]
#[cfg_attr(test, derive(PartialEq, Eq, Debug))]
pub enum Network {
    #[default]
    Mainnet,
    Minimal,
}

impl Network {
    #[must_use]
    pub const fn chain_config(self) -> Config {
        match self {
            Self::Mainnet => Config::mainnet(),
            Self::Minimal => Config::minimal(),
        }
    }
}
