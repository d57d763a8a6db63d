use std::sync::Arc;

use anyhow::{ensure, Result};
use database::Database;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use types::{
    containers::Checkpoint,
    fork_choice::{ForkChoiceDag, ForkChoiceNode},
    primitives::H256,
};

use crate::{
    error::Error,
    keys::{self, FORK_CHOICE_SNAPSHOT_KEY},
};

/// Serialized form of a [`ForkChoiceDag`] paired with the finalized checkpoint it was taken at.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct ForkChoiceSnapshot {
    pub finalized: Checkpoint,
    pub root: H256,
    pub nodes: Vec<ForkChoiceNode>,
}

impl ForkChoiceSnapshot {
    /// The root of `dag` must be the block of `finalized`.
    pub fn capture(dag: &ForkChoiceDag, finalized: Checkpoint) -> Result<Self> {
        ensure!(
            dag.root() == finalized.root,
            Error::SnapshotMismatch {
                snapshot: Checkpoint::new(finalized.epoch, dag.root()),
                stored: finalized,
            },
        );

        Ok(Self {
            finalized,
            root: dag.root(),
            nodes: dag.nodes().copied().collect(),
        })
    }

    pub fn into_dag(self) -> Result<ForkChoiceDag> {
        ForkChoiceDag::from_nodes(self.root, self.nodes)
    }
}

/// Durable copy of the fork-choice working set.
///
/// Independent of checkpoint commits. Whoever restores a snapshot must check it against the
/// finalized checkpoint in storage, which [`ForkChoiceSnapshotStore::restore_matching`] does.
pub struct ForkChoiceSnapshotStore {
    database: Arc<Database>,
}

impl ForkChoiceSnapshotStore {
    pub(crate) const fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Serializes `dag` into an opaque blob.
    pub fn snapshot(dag: &ForkChoiceDag, finalized: Checkpoint) -> Result<Vec<u8>> {
        keys::serialize_value(&ForkChoiceSnapshot::capture(dag, finalized)?)
    }

    pub fn save(&self, dag: &ForkChoiceDag, finalized: Checkpoint) -> Result<()> {
        let blob = Self::snapshot(dag, finalized)?;

        self.database.put(FORK_CHOICE_SNAPSHOT_KEY, blob)?;

        debug!(
            "saved fork-choice snapshot with {} nodes at epoch {}",
            dag.len(),
            finalized.epoch,
        );

        Ok(())
    }

    pub fn restore(&self) -> Result<Option<ForkChoiceSnapshot>> {
        keys::get(&self.database, FORK_CHOICE_SNAPSHOT_KEY)
    }

    /// Restores the last snapshot if it was taken at `finalized`.
    ///
    /// Fails with [`Error::SnapshotMismatch`] if the snapshot belongs to another checkpoint.
    pub fn restore_matching(&self, finalized: Checkpoint) -> Result<Option<ForkChoiceDag>> {
        let Some(snapshot) = self.restore()? else {
            return Ok(None);
        };

        ensure!(
            snapshot.finalized == finalized && snapshot.root == finalized.root,
            Error::SnapshotMismatch {
                snapshot: snapshot.finalized,
                stored: finalized,
            },
        );

        snapshot.into_dag().map(Some)
    }

    pub fn discard(&self) -> Result<()> {
        self.database.delete(FORK_CHOICE_SNAPSHOT_KEY)?;
        info!("discarded fork-choice snapshot");
        Ok(())
    }
}
