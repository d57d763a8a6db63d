use std::borrow::Cow;

use anyhow::{Error as AnyhowError, Result};
use database::{Batch, Database, PrefixableKey};
use derive_more::Display;
use serde::{de::DeserializeOwned, Serialize};
use types::primitives::{DepositIndex, Slot, H256};

use crate::error::Error;

pub const ANCHOR_KEY: &str = "anchor";
pub const CHECKPOINTS_KEY: &str = "checkpoints";
pub const FORK_CHOICE_SNAPSHOT_KEY: &str = "fcs";
pub const HEAD_KEY: &str = "head";
pub const METADATA_KEY: &str = "meta";
pub const MIN_GENESIS_TIME_BLOCK_KEY: &str = "mgt";
pub const PRUNE_CURSOR_KEY: &str = "pruned";
pub const PRUNE_FLOOR_KEY: &str = "prune_floor";

#[derive(Display)]
#[display("{}{_0:x}", Self::PREFIX)]
pub struct BlockByRoot(pub H256);

impl PrefixableKey for BlockByRoot {
    const PREFIX: &'static str = "b";
}

/// Roots of blocks on the finalized chain.
#[derive(Display)]
#[display("{}{_0:020}", Self::PREFIX)]
pub struct BlockRootBySlot(pub Slot);

impl PrefixableKey for BlockRootBySlot {
    const PREFIX: &'static str = "r";
}

impl TryFrom<Cow<'_, [u8]>> for BlockRootBySlot {
    type Error = AnyhowError;

    fn try_from(bytes: Cow<[u8]>) -> Result<Self> {
        let payload =
            bytes
                .strip_prefix(Self::PREFIX.as_bytes())
                .ok_or_else(|| Error::IncorrectPrefix {
                    bytes: bytes.to_vec(),
                })?;

        let string = core::str::from_utf8(payload)?;
        let slot = string.parse()?;

        Ok(Self(slot))
    }
}

/// Every stored block regardless of whether it is canonical.
#[derive(Display)]
#[display("{}{_0:020}{_1:x}", Self::PREFIX)]
pub struct SlotBlockRoot(pub Slot, pub H256);

impl PrefixableKey for SlotBlockRoot {
    const PREFIX: &'static str = "i";
}

impl TryFrom<Cow<'_, [u8]>> for SlotBlockRoot {
    type Error = AnyhowError;

    fn try_from(bytes: Cow<[u8]>) -> Result<Self> {
        let (slot, root) = parse_slot_and_root::<Self>(&bytes)?;
        Ok(Self(slot, root))
    }
}

#[derive(Display)]
#[display("{}{_0:x}", Self::PREFIX)]
pub struct StateByStateRoot(pub H256);

impl PrefixableKey for StateByStateRoot {
    const PREFIX: &'static str = "s";
}

#[derive(Display)]
#[display("{}{_0:x}", Self::PREFIX)]
pub struct StateRootByBlockRoot(pub H256);

impl PrefixableKey for StateRootByBlockRoot {
    const PREFIX: &'static str = "t";
}

#[derive(Display)]
#[display("{}{_0:020}{_1:x}", Self::PREFIX)]
pub struct SlotStateRoot(pub Slot, pub H256);

impl PrefixableKey for SlotStateRoot {
    const PREFIX: &'static str = "u";
}

impl TryFrom<Cow<'_, [u8]>> for SlotStateRoot {
    type Error = AnyhowError;

    fn try_from(bytes: Cow<[u8]>) -> Result<Self> {
        let (slot, root) = parse_slot_and_root::<Self>(&bytes)?;
        Ok(Self(slot, root))
    }
}

#[derive(Display)]
#[display("{}{_0:020}", Self::PREFIX)]
pub struct DepositByIndex(pub DepositIndex);

impl PrefixableKey for DepositByIndex {
    const PREFIX: &'static str = "dep";
}

pub fn get<V: DeserializeOwned>(
    database: &Database,
    key: impl core::fmt::Display,
) -> Result<Option<V>> {
    database
        .get(serialize_key(key))?
        .map(|bytes| bincode::deserialize(&bytes))
        .transpose()
        .map_err(Into::into)
}

pub fn put(batch: &mut Batch, key: impl core::fmt::Display, value: &impl Serialize) -> Result<()> {
    let (key, value) = serialize(key, value)?;
    batch.put(key, value);
    Ok(())
}

pub fn serialize(
    key: impl core::fmt::Display,
    value: &impl Serialize,
) -> Result<(String, Vec<u8>)> {
    Ok((serialize_key(key), serialize_value(value)?))
}

pub fn serialize_key(key: impl core::fmt::Display) -> String {
    key.to_string()
}

pub fn serialize_value(value: &impl Serialize) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(Into::into)
}

pub fn deserialize_value<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    bincode::deserialize(bytes).map_err(Into::into)
}

// Keys of the form `{prefix}{slot:020}{root:x}`.
fn parse_slot_and_root<K: PrefixableKey>(bytes: &[u8]) -> Result<(Slot, H256)> {
    const SLOT_DIGITS: usize = 20;

    let payload = bytes
        .strip_prefix(K::PREFIX.as_bytes())
        .ok_or_else(|| Error::IncorrectPrefix {
            bytes: bytes.to_vec(),
        })?;

    let string = core::str::from_utf8(payload)?;

    let (slot, root) = string
        .split_at_checked(SLOT_DIGITS)
        .ok_or_else(|| Error::IncorrectPrefix {
            bytes: bytes.to_vec(),
        })?;

    Ok((slot.parse()?, root.parse()?))
}
