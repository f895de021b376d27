//! Datalink errors.

use thiserror::Error;

/// Why the datalink did not carry a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DatalinkError {
    /// A listener stopped acknowledging; the rest of the block was dropped.
    #[error("block abandoned after retry exhaustion")]
    Abandoned,

    /// No valid neighbour to send to.
    #[error("no peer reachable")]
    NoPeerReachable,

    /// The arbitration task is not running.
    #[error("datalink stopped")]
    Stopped,
}

impl DatalinkError {
    /// Whether a later transmission may succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DatalinkError::Stopped)
    }
}
