use std::io;

use crate::{codec::CodecError, net::TransportError};

/// Everything the crate can fail with.
///
/// A duplicate round is deliberately absent: running a round twice is a
/// defined no-op, reported as `None` or as `MemberOutcome::AlreadyProcessed`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A blob entry does not resolve with any key this node holds.
    #[error("blob entry does not decode with the local key")]
    DecodeMismatch,
    /// The neighbor was unreachable or refused the transfer. The units stay
    /// in the local queue.
    #[error("transfer to {peer} failed: {source}")]
    TransferFailure {
        peer: String,
        #[source]
        source: TransportError,
    },
    #[error("unit {unit} failed: {reason}")]
    ExecutionFailure { unit: String, reason: String },
    /// A traversal from `start` did not come back within `cap` hops.
    #[error("ring starting at {start} did not close within {cap} hops")]
    RingIntegrity { start: String, cap: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("checkpoint: {0}")]
    Checkpoint(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
