use core::num::NonZeroU64;

use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};

use crate::primitives::{Epoch, Slot};

/// Chain parameters that storage needs to map slots to epochs.
#[expect(
    clippy::unsafe_derive_deserialize,
    reason = "A false positive triggered by `nonzero!`. \
              The `unsafe` block in `nonzero!` only operates on the literal passed to it."
)]
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    pub slots_per_epoch: NonZeroU64,
}

impl Default for Config {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl Config {
    #[must_use]
    pub const fn mainnet() -> Self {
        Self {
            slots_per_epoch: nonzero!(32_u64),
        }
    }

    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            slots_per_epoch: nonzero!(8_u64),
        }
    }

    #[must_use]
    pub const fn epoch_at_slot(&self, slot: Slot) -> Epoch {
        slot / self.slots_per_epoch.get()
    }

    #[must_use]
    pub const fn start_slot(&self, epoch: Epoch) -> Slot {
        epoch.saturating_mul(self.slots_per_epoch.get())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Config::mainnet(), 0 => 0)]
    #[test_case(Config::mainnet(), 31 => 0)]
    #[test_case(Config::mainnet(), 32 => 1)]
    #[test_case(Config::minimal(), 17 => 2)]
    fn epoch_at_slot(config: Config, slot: Slot) -> Epoch {
        config.epoch_at_slot(slot)
    }

    #[test]
    fn start_slot_is_first_slot_of_epoch() {
        let config = Config::minimal();

        assert_eq!(config.start_slot(3), 24);
        assert_eq!(config.epoch_at_slot(config.start_slot(3)), 3);
        assert_eq!(config.start_slot(Epoch::MAX), Slot::MAX);
    }
}
