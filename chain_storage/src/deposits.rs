use std::sync::Arc;

use anyhow::{ensure, Result};
use database::{Database, PrefixableKey as _};
use log::{debug, info};
use parking_lot::Mutex;
use types::{
    containers::{DepositRecord, Eth1BlockRef},
    primitives::{DepositIndex, ExecutionBlockNumber},
};

use crate::{
    error::Error,
    keys::{self, DepositByIndex, MIN_GENESIS_TIME_BLOCK_KEY},
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DepositsFromBlockEvent {
    pub block: Eth1BlockRef,
    pub deposits: Vec<DepositRecord>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MinGenesisTimeBlockEvent {
    pub block: Eth1BlockRef,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Eth1Event {
    DepositsFromBlock(DepositsFromBlockEvent),
    MinGenesisTimeBlock(MinGenesisTimeBlockEvent),
}

/// Receiver of replayed Eth1 events.
///
/// Implementations track which deposits they have acknowledged.
/// The deposit log only records which deposits are durable.
pub trait Eth1EventsChannel {
    fn on_deposits_from_block(&self, event: DepositsFromBlockEvent) -> Result<()>;

    fn on_min_genesis_time_block(&self, event: MinGenesisTimeBlockEvent) -> Result<()>;

    fn last_acknowledged_deposit(&self) -> Option<DepositIndex>;
}

/// Records every event it receives and acknowledges deposits as soon as they arrive.
#[derive(Default)]
pub struct TrackingEth1EventsChannel {
    events: Mutex<Vec<Eth1Event>>,
    last_acknowledged: Mutex<Option<DepositIndex>>,
}

impl TrackingEth1EventsChannel {
    #[must_use]
    pub fn new(last_acknowledged: Option<DepositIndex>) -> Self {
        Self {
            events: Mutex::default(),
            last_acknowledged: Mutex::new(last_acknowledged),
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<Eth1Event> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn deposit_indices(&self) -> Vec<DepositIndex> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Eth1Event::DepositsFromBlock(event) => Some(&event.deposits),
                Eth1Event::MinGenesisTimeBlock(_) => None,
            })
            .flatten()
            .map(|deposit| deposit.index)
            .collect()
    }
}

impl Eth1EventsChannel for TrackingEth1EventsChannel {
    fn on_deposits_from_block(&self, event: DepositsFromBlockEvent) -> Result<()> {
        if let Some(last) = event.deposits.last() {
            *self.last_acknowledged.lock() = Some(last.index);
        }

        self.events.lock().push(Eth1Event::DepositsFromBlock(event));

        Ok(())
    }

    fn on_min_genesis_time_block(&self, event: MinGenesisTimeBlockEvent) -> Result<()> {
        self.events
            .lock()
            .push(Eth1Event::MinGenesisTimeBlock(event));

        Ok(())
    }

    fn last_acknowledged_deposit(&self) -> Option<DepositIndex> {
        *self.last_acknowledged.lock()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ReplayDepositsResult {
    pub last_processed_block_number: Option<ExecutionBlockNumber>,
    pub last_processed_index: Option<DepositIndex>,
    pub past_min_genesis_block: bool,
}

/// Append-only log of deposits observed on the Eth1 chain.
pub struct DepositStorage {
    database: Arc<Database>,
    write_section: Arc<Mutex<()>>,
}

impl DepositStorage {
    pub(crate) const fn new(database: Arc<Database>, write_section: Arc<Mutex<()>>) -> Self {
        Self {
            database,
            write_section,
        }
    }

    /// Fails with [`Error::SequenceGap`] unless `deposit` directly follows the last stored one.
    pub fn append(&self, deposit: &DepositRecord) -> Result<()> {
        let _write = self.write_section.lock();

        let expected = self.last_index()?.map_or(0, |index| index + 1);

        ensure!(
            deposit.index == expected,
            Error::SequenceGap {
                expected,
                actual: deposit.index,
            },
        );

        let (key, value) = keys::serialize(DepositByIndex(deposit.index), deposit)?;

        self.database.put(key, value)
    }

    pub fn get(&self, index: DepositIndex) -> Result<Option<DepositRecord>> {
        keys::get(&self.database, DepositByIndex(index))
    }

    pub fn last_index(&self) -> Result<Option<DepositIndex>> {
        self.database
            .prev(keys::serialize_key(DepositByIndex(DepositIndex::MAX)))?
            .filter(|(key_bytes, _)| DepositByIndex::has_prefix(key_bytes))
            .map(|(_, value_bytes)| keys::deserialize_value::<DepositRecord>(&value_bytes))
            .transpose()
            .map(|deposit| deposit.map(|deposit| deposit.index))
    }

    /// Deposits starting at `index` in ascending order.
    ///
    /// Each step reads a single record, so the sequence can be abandoned and started again at
    /// any point. It ends at the first missing index.
    pub fn replay_from(
        &self,
        index: DepositIndex,
    ) -> impl Iterator<Item = Result<DepositRecord>> + '_ {
        let mut next_index = Some(index);

        core::iter::from_fn(move || {
            let index = next_index?;
            let result = self.get(index).transpose();

            next_index = match result {
                Some(Ok(_)) => index.checked_add(1),
                _ => None,
            };

            result
        })
    }

    pub fn store_min_genesis_time_block(&self, block: Eth1BlockRef) -> Result<()> {
        let (key, value) = keys::serialize(MIN_GENESIS_TIME_BLOCK_KEY, &block)?;
        self.database.put(key, value)
    }

    pub fn min_genesis_time_block(&self) -> Result<Option<Eth1BlockRef>> {
        keys::get(&self.database, MIN_GENESIS_TIME_BLOCK_KEY)
    }

    /// Sends deposits starting at `from_index` to `channel`, one event per Eth1 block.
    ///
    /// The min genesis time block is delivered in block order after the deposits of its own
    /// block. It is skipped if `channel` must already have seen it, which is the case when
    /// it precedes the block of the deposit at `from_index - 1`.
    pub fn replay_deposit_events(
        &self,
        channel: &impl Eth1EventsChannel,
        from_index: DepositIndex,
    ) -> Result<ReplayDepositsResult> {
        let min_genesis_time_block = self.min_genesis_time_block()?;

        let acknowledged_block_number = match from_index.checked_sub(1) {
            Some(index) => self.get(index)?.map(|deposit| deposit.eth1_block.number),
            None => None,
        };

        let mut pending_min_genesis = min_genesis_time_block.filter(|block| {
            acknowledged_block_number.is_none_or(|number| block.number >= number)
        });

        let mut result = ReplayDepositsResult {
            past_min_genesis_block: min_genesis_time_block.is_some(),
            ..ReplayDepositsResult::default()
        };

        let mut current: Option<DepositsFromBlockEvent> = None;

        for deposit in self.replay_from(from_index) {
            let deposit = deposit?;

            if let Some(event) = current.take_if(|event| event.block != deposit.eth1_block) {
                send_deposits(channel, event, &mut pending_min_genesis, &mut result)?;
            }

            current
                .get_or_insert_with(|| DepositsFromBlockEvent {
                    block: deposit.eth1_block,
                    deposits: vec![],
                })
                .deposits
                .push(deposit);
        }

        if let Some(event) = current {
            send_deposits(channel, event, &mut pending_min_genesis, &mut result)?;
        }

        if let Some(block) = pending_min_genesis {
            channel.on_min_genesis_time_block(MinGenesisTimeBlockEvent { block })?;
        }

        info!(
            "replayed deposits from index {from_index} up to index {:?} (Eth1 block {:?})",
            result.last_processed_index, result.last_processed_block_number,
        );

        Ok(result)
    }
}

fn send_deposits(
    channel: &impl Eth1EventsChannel,
    event: DepositsFromBlockEvent,
    pending_min_genesis: &mut Option<Eth1BlockRef>,
    result: &mut ReplayDepositsResult,
) -> Result<()> {
    let number = event.block.number;

    if let Some(block) = pending_min_genesis.take_if(|block| block.number < number) {
        channel.on_min_genesis_time_block(MinGenesisTimeBlockEvent { block })?;
    }

    debug!(
        "replaying {} deposits from Eth1 block {number}",
        event.deposits.len(),
    );

    result.last_processed_block_number = Some(number);
    result.last_processed_index = event.deposits.last().map(|deposit| deposit.index);

    channel.on_deposits_from_block(event)?;

    if let Some(block) = pending_min_genesis.take_if(|block| block.number == number) {
        channel.on_min_genesis_time_block(MinGenesisTimeBlockEvent { block })?;
    }

    Ok(())
}
