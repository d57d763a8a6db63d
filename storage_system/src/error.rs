use strum::Display;
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RestartStep {
    CloseRecentChainData,
    CloseDatabase,
    OpenDatabase,
    OpenStorage,
    Rehydrate,
    RestoreForkChoice,
    ReplayDeposits,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("restart failed at step {step}")]
    RestartFailed { step: RestartStep },
    #[error("storage is empty and no anchor state was supplied")]
    MissingAnchor,
}
