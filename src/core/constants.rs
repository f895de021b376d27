//! Protocol constants for SOOlink.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed.
//! Timing values are the defaults used by [`crate::config`].

use std::time::Duration;

// =============================================================================
// IDENTITIES
// =============================================================================

/// Destination identity meaning "every node on the medium".
pub const BROADCAST_ID: u64 = 0;

// =============================================================================
// FRAGMENT FORMAT
// =============================================================================

/// Consistency kind of a fragment carrying a whole block.
pub const FRAGMENT_KIND_SIMPLE: u8 = 0x00;

/// Consistency kind of a fragment carrying one piece of a split block.
pub const FRAGMENT_KIND_EXTENDED: u8 = 0x01;

/// Simple fragment header size (kind + payload length).
pub const SIMPLE_HEADER_SIZE: usize = 1 + 4;

/// Extended fragment header size (kind + count + index + payload length).
pub const EXTENDED_HEADER_SIZE: usize = 1 + 4 + 4 + 4;

/// Default maximum payload carried by one fragment.
pub const DEFAULT_MAX_FRAGMENT_PAYLOAD: usize = 1024;

// =============================================================================
// TRANSCEIVER ENVELOPE
// =============================================================================

/// Envelope header size (kind + requester + source + dest + trans_id + length).
pub const ENVELOPE_HEADER_SIZE: usize = 1 + 1 + 8 + 8 + 4 + 4;

/// Envelope kind for payload data.
pub const PACKET_KIND_DATA: u8 = 0x01;

/// Envelope kind for datalink control (beacons).
pub const PACKET_KIND_DATALINK: u8 = 0x02;

// =============================================================================
// TRANSACTION IDS
// =============================================================================

/// Largest sequence value carried in a transaction id (24 bits).
pub const MAX_PACKET_TRANSID: u32 = 0x00ff_ffff;

/// Flag marking the last packet of a block.
pub const LAST_PACKET: u32 = 1 << 24;

/// Flag marking the last packet of an acknowledged batch.
pub const FRAME_END: u32 = 1 << 25;

// =============================================================================
// WINENET
// =============================================================================

/// Total attempts for one acknowledged exchange.
pub const WNET_RETRIES_MAX: u32 = 3;

/// Lower bound of the retransmission back-off, in microseconds.
pub const WNET_MIN_DRAND: u64 = 1000;

/// Upper bound of the retransmission back-off, in microseconds.
pub const WNET_MAX_DRAND: u64 = 2000;

/// Wait for an acknowledgment before retrying.
pub const WNET_ACK_TIMEOUT: Duration = Duration::from_millis(800);

/// Silence after which an idle or listening node reconsiders the token.
///
/// Must exceed the longest a live speaker can stay unheard by one listener:
/// a full retry exchange, the token hold or the stall timeout.
pub const WNET_LISTENER_TIMEOUT: Duration = Duration::from_millis(3000);

/// How long a speaker with nothing queued keeps the token.
pub const WNET_TOKEN_HOLD: Duration = Duration::from_millis(20);

/// How long a speaker in the middle of a block waits for the next fragment.
pub const WNET_STALL_TIMEOUT: Duration = Duration::from_millis(1600);

/// Packets sent before waiting for one acknowledgment.
pub const WNET_PACKETS_PER_FRAME: usize = 1;

// =============================================================================
// DECODER
// =============================================================================

/// Completed but unread blocks a descriptor may hold.
pub const MAX_READY_BLOCK_COUNT: usize = 8;

/// Lifetime of an incomplete reassembly buffer.
pub const DECODE_BLOCK_TIMEOUT: Duration = Duration::from_secs(4);

/// Period of the decoder stale-block sweep.
pub const DECODER_WATCHDOG_PERIOD: Duration = Duration::from_millis(1000);

// =============================================================================
// CHANNELS
// =============================================================================

/// Capacity of the plugin to core inbound frame queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the Winenet task inbox.
pub const WINENET_INBOX_CAPACITY: usize = 256;
