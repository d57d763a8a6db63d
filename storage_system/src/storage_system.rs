use std::sync::Arc;

use anyhow::{ensure, Context as _, Result};
use chain_storage::{
    DepositStorage, Error as StorageError, Eth1EventsChannel, ReplayDepositsResult, Storage,
    StorageMode,
};
use database::DatabaseMode;
use log::{info, warn};
use recent_chain_data::{CombinedChainDataClient, EventChannels, RecentChainData};
use types::{config::Config, containers::AnchorState};

use crate::{
    error::{Error, RestartStep},
    storage_config::StorageConfig,
};

/// Where the fork-choice working set came from when the system was opened.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ForkChoiceRecovery {
    /// The chain was started from an anchor state.
    Fresh,
    /// Weights were restored from a snapshot taken at the stored finalized checkpoint.
    Restored,
    /// No snapshot was stored. A new one was taken from the rehydrated blocks.
    Rebuilt,
    /// The stored snapshot belonged to a different finalized checkpoint and was replaced.
    Discarded,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Recovery {
    pub rehydrated: bool,
    pub fork_choice: ForkChoiceRecovery,
    pub deposits: ReplayDepositsResult,
}

/// Storage, recent chain data and the query facade over them, opened together.
pub struct StorageSystem {
    chain_config: Arc<Config>,
    storage_config: StorageConfig,
    storage: Storage,
    recent_chain_data: Arc<RecentChainData>,
    combined_client: CombinedChainDataClient,
    recovery: Recovery,
}

impl StorageSystem {
    /// Opens storage at the location in `storage_config`.
    ///
    /// If storage already contains a chain, recent chain data is rehydrated from it and
    /// `anchor` is ignored. Otherwise the chain is started from `anchor`.
    /// Stored deposits not yet acknowledged by `eth1_events` are replayed to it.
    ///
    /// Generations continue from the last one published through `event_channels`.
    /// A rehydrated chain is announced only after every step has succeeded.
    pub fn open(
        chain_config: Arc<Config>,
        storage_config: StorageConfig,
        event_channels: Arc<EventChannels>,
        anchor: Option<&AnchorState>,
        eth1_events: &impl Eth1EventsChannel,
    ) -> Result<Self> {
        let database = storage_config.open_database(DatabaseMode::ReadWrite)?;

        let storage = Storage::open(
            Arc::clone(&chain_config),
            database,
            storage_config.storage_mode,
        )?;

        let base_generation = event_channels.last_generation();

        let recent_chain_data = Arc::new(RecentChainData::new(
            storage_config.store_config,
            storage.clone(),
            event_channels,
            base_generation,
        ));

        let (rehydrated, fork_choice) = if recent_chain_data.rehydrate_from_storage()? {
            let fork_choice = restore_fork_choice(&storage, &recent_chain_data)?;
            (true, fork_choice)
        } else {
            let anchor = anchor.ok_or(Error::MissingAnchor)?;
            recent_chain_data.initialize_from_anchor(anchor)?;
            (false, ForkChoiceRecovery::Fresh)
        };

        let deposits = replay_deposits(&storage, eth1_events)?;

        if rehydrated {
            recent_chain_data.announce_chain();
        }

        Ok(Self::new(
            chain_config,
            storage_config,
            storage,
            recent_chain_data,
            Recovery {
                rehydrated,
                fork_choice,
                deposits,
            },
        ))
    }

    /// Closes everything and opens it again at the same location in `storage_mode`.
    ///
    /// Subscribers of the event channels stay subscribed and receive the rehydrated finalized
    /// checkpoint and head once, after every step has succeeded. Generations continue from the
    /// ones published before the restart.
    ///
    /// Fails with [`Error::RestartFailed`] naming the step that failed. Nothing opened by the
    /// failed attempt stays open and nothing is announced, so the system can be reopened with
    /// [`StorageSystem::open`] over the same event channels.
    /// Handles derived from this system (clones of the query facade, deposit storage) must be
    /// dropped first, or closing the database fails.
    pub fn restarted(
        self,
        storage_mode: StorageMode,
        eth1_events: &impl Eth1EventsChannel,
    ) -> Result<Self> {
        let Self {
            chain_config,
            mut storage_config,
            storage,
            recent_chain_data,
            combined_client,
            recovery: _,
        } = self;

        info!(
            "restarting storage ({} mode, switching to {storage_mode} mode)",
            storage_config.storage_mode,
        );

        recent_chain_data
            .close()
            .context(Error::RestartFailed {
                step: RestartStep::CloseRecentChainData,
            })?;

        let event_channels = Arc::clone(recent_chain_data.event_channels());
        let base_generation = event_channels.last_generation();

        drop(combined_client);
        drop(recent_chain_data);

        storage.close().context(Error::RestartFailed {
            step: RestartStep::CloseDatabase,
        })?;

        storage_config.storage_mode = storage_mode;

        let database = storage_config
            .open_database(DatabaseMode::ReadWrite)
            .context(Error::RestartFailed {
                step: RestartStep::OpenDatabase,
            })?;

        let storage = Storage::open(Arc::clone(&chain_config), database, storage_mode).context(
            Error::RestartFailed {
                step: RestartStep::OpenStorage,
            },
        )?;

        let recent_chain_data = Arc::new(RecentChainData::new(
            storage_config.store_config,
            storage.clone(),
            event_channels,
            base_generation,
        ));

        let rehydrated = recent_chain_data
            .rehydrate_from_storage()
            .context(Error::RestartFailed {
                step: RestartStep::Rehydrate,
            })?;

        ensure!(
            rehydrated,
            Error::RestartFailed {
                step: RestartStep::Rehydrate,
            },
        );

        let fork_choice = restore_fork_choice(&storage, &recent_chain_data).context(
            Error::RestartFailed {
                step: RestartStep::RestoreForkChoice,
            },
        )?;

        let deposits = replay_deposits(&storage, eth1_events).context(Error::RestartFailed {
            step: RestartStep::ReplayDeposits,
        })?;

        recent_chain_data.announce_chain();

        info!(
            "storage restarted at generation {}",
            recent_chain_data.last_generation(),
        );

        Ok(Self::new(
            chain_config,
            storage_config,
            storage,
            recent_chain_data,
            Recovery {
                rehydrated,
                fork_choice,
                deposits,
            },
        ))
    }

    /// Closes recent chain data and then the database.
    pub fn close(self) -> Result<()> {
        let Self {
            storage,
            recent_chain_data,
            combined_client,
            ..
        } = self;

        recent_chain_data.close()?;

        drop(combined_client);
        drop(recent_chain_data);

        storage.close()
    }

    #[must_use]
    pub const fn chain_config(&self) -> &Arc<Config> {
        &self.chain_config
    }

    #[must_use]
    pub const fn storage_config(&self) -> &StorageConfig {
        &self.storage_config
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub const fn recent_chain_data(&self) -> &Arc<RecentChainData> {
        &self.recent_chain_data
    }

    #[must_use]
    pub const fn combined_client(&self) -> &CombinedChainDataClient {
        &self.combined_client
    }

    #[must_use]
    pub fn event_channels(&self) -> &Arc<EventChannels> {
        self.recent_chain_data.event_channels()
    }

    #[must_use]
    pub fn deposits(&self) -> DepositStorage {
        self.storage.deposits()
    }

    #[must_use]
    pub const fn recovery(&self) -> Recovery {
        self.recovery
    }

    fn new(
        chain_config: Arc<Config>,
        storage_config: StorageConfig,
        storage: Storage,
        recent_chain_data: Arc<RecentChainData>,
        recovery: Recovery,
    ) -> Self {
        let combined_client =
            CombinedChainDataClient::new(Arc::clone(&recent_chain_data), storage.clone());

        Self {
            chain_config,
            storage_config,
            storage,
            recent_chain_data,
            combined_client,
            recovery,
        }
    }
}

// A snapshot is trusted only if it was taken at the finalized checkpoint that was rehydrated.
fn restore_fork_choice(
    storage: &Storage,
    recent_chain_data: &RecentChainData,
) -> Result<ForkChoiceRecovery> {
    let store = recent_chain_data.store_snapshot()?;
    let finalized = store.finalized_checkpoint();
    let snapshots = storage.fork_choice_snapshots();

    let recovery = match snapshots.restore_matching(finalized) {
        Ok(Some(fork_choice)) => {
            recent_chain_data.restore_fork_choice(&fork_choice)?;

            info!(
                "restored fork choice snapshot with {} blocks at epoch {}",
                fork_choice.len(),
                finalized.epoch,
            );

            return Ok(ForkChoiceRecovery::Restored);
        }
        Ok(None) => {
            info!("no fork choice snapshot found, rebuilding from finalized block");
            ForkChoiceRecovery::Rebuilt
        }
        Err(error)
            if matches!(
                error.downcast_ref(),
                Some(StorageError::SnapshotMismatch { .. }),
            ) =>
        {
            warn!("discarding fork choice snapshot: {error}");
            snapshots.discard()?;
            ForkChoiceRecovery::Discarded
        }
        Err(error) => return Err(error),
    };

    snapshots.save(store.fork_choice(), finalized)?;

    Ok(recovery)
}

fn replay_deposits(
    storage: &Storage,
    eth1_events: &impl Eth1EventsChannel,
) -> Result<ReplayDepositsResult> {
    let from_index = eth1_events
        .last_acknowledged_deposit()
        .map_or(0, |index| index + 1);

    storage
        .deposits()
        .replay_deposit_events(eth1_events, from_index)
}
