use gateway_vm::{DecodeError, MachineError, Need};
use thiserror::Error;

use crate::cache::SharedError;
use crate::replay::ReplayError;
use crate::rollup::RollupError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error("state fetch failed: {0}")]
    Fetch(#[from] SharedError),

    #[error(transparent)]
    Rollup(#[from] RollupError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// The `order` encoding addresses proofs with a single byte.
    #[error("too many proofs: {0}")]
    TooManyProofs(usize),

    #[error("no proof fetched for {0}")]
    MissingProof(Need),

    #[error("evaluation suspended without missing state")]
    Stalled,
}
