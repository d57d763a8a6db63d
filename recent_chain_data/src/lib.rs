pub use crate::{
    combined::{CombinedChainDataClient, WithGeneration},
    error::Error,
    events::{
        ChainReorgEvent, Event, EventChannels, FinalizedCheckpointEvent, HeadEvent, Topic,
        DEFAULT_MAX_EVENTS,
    },
    recent_chain_data::{RecentChainData, Status},
    store::{Generation, Store},
    store_config::StoreConfig,
};

mod combined;
mod error;
mod events;
mod recent_chain_data;
mod store;
mod store_config;

#[cfg(test)]
mod fixtures;
