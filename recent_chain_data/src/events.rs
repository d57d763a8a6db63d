use core::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use log::warn;
use strum::{AsRefStr, EnumString};
use tokio::sync::broadcast::{self, Receiver, Sender};
use types::{
    containers::Checkpoint,
    primitives::{Slot, H256},
};

use crate::store::Generation;

pub const DEFAULT_MAX_EVENTS: usize = 100;

#[derive(Clone, Copy, PartialEq, Eq, Debug, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Topic {
    ChainReorg,
    FinalizedCheckpoint,
    Head,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Event {
    ChainReorg(ChainReorgEvent),
    FinalizedCheckpoint(FinalizedCheckpointEvent),
    Head(HeadEvent),
}

impl Event {
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::ChainReorg(_) => Topic::ChainReorg,
            Self::FinalizedCheckpoint(_) => Topic::FinalizedCheckpoint,
            Self::Head(_) => Topic::Head,
        }
    }

    #[must_use]
    pub const fn generation(&self) -> Generation {
        match self {
            Self::ChainReorg(event) => event.generation,
            Self::FinalizedCheckpoint(event) => event.generation,
            Self::Head(event) => event.generation,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FinalizedCheckpointEvent {
    pub checkpoint: Checkpoint,
    pub generation: Generation,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeadEvent {
    pub slot: Slot,
    pub block: H256,
    pub generation: Generation,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChainReorgEvent {
    pub old_head: H256,
    pub new_head: H256,
    pub common_ancestor_slot: Slot,
    /// Number of slots between the common ancestor and the old head.
    pub depth: u64,
    pub generation: Generation,
}

/// Broadcast channels for chain events.
///
/// Events of every topic are also sent to a combined channel in publication order,
/// which is the only way to observe the order of events across topics.
///
/// The channels also remember the highest generation published through them, so that caches
/// reopened over the same channels never reuse a generation.
pub struct EventChannels {
    pub chain_reorgs: Sender<Event>,
    pub finalized_checkpoints: Sender<Event>,
    pub heads: Sender<Event>,
    pub all: Sender<Event>,
    last_generation: AtomicU64,
}

impl Default for EventChannels {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl EventChannels {
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            chain_reorgs: broadcast::channel(max_events).0,
            finalized_checkpoints: broadcast::channel(max_events).0,
            heads: broadcast::channel(max_events).0,
            all: broadcast::channel(max_events).0,
            last_generation: AtomicU64::new(0),
        }
    }

    /// Highest generation published so far, whether or not it was announced with an event.
    #[must_use]
    pub fn last_generation(&self) -> Generation {
        self.last_generation.load(Ordering::Acquire)
    }

    pub(crate) fn record_generation(&self, generation: Generation) {
        self.last_generation.fetch_max(generation, Ordering::AcqRel);
    }

    #[must_use]
    pub fn receiver_for(&self, topic: Topic) -> Receiver<Event> {
        match topic {
            Topic::ChainReorg => &self.chain_reorgs,
            Topic::FinalizedCheckpoint => &self.finalized_checkpoints,
            Topic::Head => &self.heads,
        }
        .subscribe()
    }

    #[must_use]
    pub fn subscribe_all(&self) -> Receiver<Event> {
        self.all.subscribe()
    }

    pub fn send_chain_reorg_event(&self, chain_reorg_event: ChainReorgEvent) {
        let event = Event::ChainReorg(chain_reorg_event);

        if let Err(error) = self.send_internal(&self.chain_reorgs, event) {
            warn!("unable to send chain reorg event: {error}");
        }
    }

    pub fn send_finalized_checkpoint_event(&self, checkpoint: Checkpoint, generation: Generation) {
        let event = Event::FinalizedCheckpoint(FinalizedCheckpointEvent {
            checkpoint,
            generation,
        });

        if let Err(error) = self.send_internal(&self.finalized_checkpoints, event) {
            warn!("unable to send finalized checkpoint event: {error}");
        }
    }

    pub fn send_head_event(&self, slot: Slot, block: H256, generation: Generation) {
        let event = Event::Head(HeadEvent {
            slot,
            block,
            generation,
        });

        if let Err(error) = self.send_internal(&self.heads, event) {
            warn!("unable to send head event: {error}");
        }
    }

    fn send_internal(&self, sender: &Sender<Event>, event: Event) -> Result<()> {
        self.record_generation(event.generation());

        if self.all.receiver_count() > 0 {
            self.all.send(event.clone())?;
        }

        if sender.receiver_count() > 0 {
            sender.send(event)?;
        }

        Ok(())
    }
}
