//! Error types for SOOlink.

use thiserror::Error;

use super::types::{PeerId, ReqType};

/// Errors while parsing or building wire structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer too short for the declared structure.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Unknown kind byte.
    #[error("invalid kind: 0x{0:02x}")]
    InvalidKind(u8),

    /// Declared length does not match the bytes present.
    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length carried in the header.
        declared: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// Fragment index outside `1..=count`.
    #[error("fragment index {index} outside 1..={count}")]
    InvalidIndex {
        /// Declared index.
        index: u32,
        /// Declared count.
        count: u32,
    },

    /// Payload does not fit the length field.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Errors raised by the reassembly side.
///
/// These indicate a corrupted local state or a peer that violates the
/// fragment contract; the offending block is discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Wire-level parse failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Fragment index beyond the count declared by the block.
    #[error("fragment index {index} out of declared range {count} from {peer}")]
    IndexOutOfRange {
        /// Sending peer.
        peer: PeerId,
        /// Fragment index.
        index: u32,
        /// Count declared by the in-progress block.
        count: u32,
    },

    /// Fragment belongs to a block of a different size.
    #[error("fragment count {actual} does not match in-progress block of {expected} from {peer}")]
    CountMismatch {
        /// Sending peer.
        peer: PeerId,
        /// Count of the in-progress block.
        expected: u32,
        /// Count carried by the fragment.
        actual: u32,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is outside its valid range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it is rejected.
        reason: String,
    },

    /// Configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level SOOlink errors.
#[derive(Debug, Error)]
pub enum SoolinkError {
    /// Wire error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Reassembly error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transceiver error.
    #[cfg(feature = "transport")]
    #[error("transceiver error: {0}")]
    Transceiver(#[from] crate::transceiver::TransceiverError),

    /// A descriptor for this requester already exists.
    #[error("requester {0:?} already registered")]
    AlreadyRegistered(ReqType),

    /// No descriptor for this requester.
    #[error("requester {0:?} not registered")]
    NotRegistered(ReqType),

    /// No buffer or queue slot available; retry later.
    #[error("resource unavailable")]
    ResourceUnavailable,

    /// A unicast descriptor was given no destination.
    #[error("unicast requester {0:?} needs a destination peer")]
    MissingDestination(ReqType),

    /// No valid neighbour can take the transmission.
    #[error("no peer reachable")]
    NoPeerReachable,

    /// The stack has been shut down.
    #[error("soolink shut down")]
    Shutdown,

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SoolinkError {
    /// Check if the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SoolinkError::ResourceUnavailable | SoolinkError::NoPeerReachable
        )
    }
}

/// Result type for SOOlink operations.
pub type SoolinkResult<T> = Result<T, SoolinkError>;
