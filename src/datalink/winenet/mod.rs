//! Winenet: speaker/listener arbitration of a shared broadcast channel.
//!
//! One node at a time holds the speaker token. The speaker announces itself
//! to each valid neighbour, sends its queued batches to every listener with
//! per-batch acknowledgment, then hands the token to the next neighbour in
//! ring order with a `GO_SPEAKER` beacon. Neighbours are validated by a ping
//! exchange initiated by the lower identity. After a silent
//! `listener_timeout` the lowest valid node claims the token, which covers
//! both startup and a token lost with its holder. Traffic from a speaker to
//! other nodes counts as activity.
//!
//! [`Winenet`] is the state machine alone; [`spawn`] runs it on a task and
//! returns a [`WinenetHandle`].

mod beacon;
mod fsm;
mod neighbour;
mod retry;
#[cfg(test)]
mod sim;
mod task;

pub use beacon::{
    AckStatus, BEACON_HEADER_SIZE, Beacon, BeaconBody, HandoffCause, PingKind, SpeakerCause,
    kinds,
};
pub use fsm::{Action, Winenet, WinenetState, WinenetStats, XmitId};
pub use neighbour::{Neighbour, NeighbourTable};
pub use retry::{AckWait, RetryEvent, RetryPolicy};
pub use task::{WinenetHandle, WinenetIo, WinenetSnapshot, spawn};
