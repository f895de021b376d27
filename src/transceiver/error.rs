//! Transceiver layer error types.

use std::io;

use thiserror::Error;

use crate::core::{DecodeError, IfType, WireError};
use crate::datalink::DatalinkError;

/// Errors raised by a physical-medium plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// I/O error on the medium.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The inbound queue is full; the frame was dropped.
    #[error("inbound queue full")]
    QueueFull,

    /// The plugin is no longer attached to a running stack.
    #[error("plugin detached")]
    Detached,
}

/// Transceiver layer errors.
#[derive(Debug, Error)]
pub enum TransceiverError {
    /// Envelope or fragment encoding error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Reassembly error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Plugin error.
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// No plugin serves the requested medium.
    #[error("no plugin for interface {0:?}")]
    NoPlugin(IfType),

    /// Datalink refused or abandoned the transmission.
    #[error("datalink error: {0}")]
    Datalink(#[from] DatalinkError),
}

impl TransceiverError {
    /// Check if the frame is silently dropped (noise, not reported upward).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransceiverError::Wire(_)
                | TransceiverError::Decode(_)
                | TransceiverError::Plugin(PluginError::QueueFull)
        )
    }

    /// Check if the transmission was abandoned after retries.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, TransceiverError::Datalink(DatalinkError::Abandoned))
    }
}

/// Result type for transceiver operations.
pub type TransceiverResult<T> = Result<T, TransceiverError>;
