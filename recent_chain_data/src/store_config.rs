use derivative::Derivative;

#[derive(Clone, Copy, Debug, Derivative)]
#[derivative(Default)]
pub struct StoreConfig {
    /// Blocks kept in memory in addition to the head and the finalized block.
    #[derivative(Default(value = "64"))]
    pub max_recent_blocks: usize,
    #[derivative(Default(value = "32"))]
    pub max_recent_states: usize,
}

impl StoreConfig {
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            max_recent_blocks: 8,
            max_recent_states: 4,
            ..Self::default()
        }
    }
}
