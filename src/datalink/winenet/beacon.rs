//! Winenet beacons.
//!
//! ```text
//! +------+---------------+-------------+------------------+
//! | kind | sender (u64)  | seq (u32)   | body             |
//! +------+---------------+-------------+------------------+
//!
//! PING              body: reqrsp (u8)
//! BROADCAST_SPEAKER body: cause (u8)
//! GO_SPEAKER        body: target (u64) cause (u8)
//! ACKNOWLEDGMENT    body: status (u8) acked trans_id (u32)
//! ```

use crate::core::{PeerId, WireError};

/// Beacon kind bytes.
pub mod kinds {
    /// Token handoff.
    pub const GO_SPEAKER: u8 = 0x01;
    /// Acknowledgment.
    pub const ACKNOWLEDGMENT: u8 = 0x02;
    /// Speaker announcement.
    pub const BROADCAST_SPEAKER: u8 = 0x04;
    /// Neighbour validation.
    pub const PING: u8 = 0x08;
}

/// Beacon header size (kind + sender + seq).
pub const BEACON_HEADER_SIZE: usize = 1 + 8 + 4;

/// Ping direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingKind {
    /// Sent by the node with the lower identity.
    Request,
    /// Answer to a request.
    Response,
}

/// Meaning of a BROADCAST_SPEAKER beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerCause {
    /// The sender is about to speak; listeners bind to it.
    Announce,
    /// The sender gives up; listeners bound to it unbind.
    Release,
}

/// How the previous speaker's turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffCause {
    /// Queue drained normally.
    Completed,
    /// A block was abandoned mid-way.
    Abandoned,
}

/// Acknowledgment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// Accepted.
    Ok,
    /// Refused; the receiver is bound elsewhere or already speaking.
    Abort,
}

/// Beacon-specific content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconBody {
    /// Neighbour validation.
    Ping(PingKind),
    /// Speaker announcement or release.
    BroadcastSpeaker(SpeakerCause),
    /// Token handoff to `target`.
    GoSpeaker {
        /// Next speaker.
        target: PeerId,
        /// How the sender's turn ended.
        cause: HandoffCause,
    },
    /// Acknowledgment of the beacon or batch identified by `acked`.
    Ack {
        /// Result.
        status: AckStatus,
        /// Sequence being acknowledged.
        acked: u32,
    },
}

impl BeaconBody {
    /// Kind byte of this body.
    pub fn kind(&self) -> u8 {
        match self {
            BeaconBody::Ping(_) => kinds::PING,
            BeaconBody::BroadcastSpeaker(_) => kinds::BROADCAST_SPEAKER,
            BeaconBody::GoSpeaker { .. } => kinds::GO_SPEAKER,
            BeaconBody::Ack { .. } => kinds::ACKNOWLEDGMENT,
        }
    }
}

/// One beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    /// Sending node.
    pub sender: PeerId,
    /// Sender's beacon sequence; a retransmission reuses it.
    pub seq: u32,
    /// Content.
    pub body: BeaconBody,
}

impl Beacon {
    /// Encode to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BEACON_HEADER_SIZE + 9);
        buf.push(self.body.kind());
        buf.extend_from_slice(&self.sender.to_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());

        match self.body {
            BeaconBody::Ping(kind) => buf.push(match kind {
                PingKind::Request => 1,
                PingKind::Response => 2,
            }),
            BeaconBody::BroadcastSpeaker(cause) => buf.push(match cause {
                SpeakerCause::Announce => 0,
                SpeakerCause::Release => 1,
            }),
            BeaconBody::GoSpeaker { target, cause } => {
                buf.extend_from_slice(&target.to_bytes());
                buf.push(match cause {
                    HandoffCause::Completed => 0,
                    HandoffCause::Abandoned => 1,
                });
            }
            BeaconBody::Ack { status, acked } => {
                buf.push(match status {
                    AckStatus::Ok => 0,
                    AckStatus::Abort => 1,
                });
                buf.extend_from_slice(&acked.to_le_bytes());
            }
        }
        buf
    }

    /// Decode from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let kind = *data.first().ok_or(WireError::TooShort {
            expected: BEACON_HEADER_SIZE,
            actual: 0,
        })?;
        let body_len = match kind {
            kinds::PING | kinds::BROADCAST_SPEAKER => 1,
            kinds::GO_SPEAKER => 9,
            kinds::ACKNOWLEDGMENT => 5,
            other => return Err(WireError::InvalidKind(other)),
        };

        let expected = BEACON_HEADER_SIZE + body_len;
        if data.len() != expected {
            return Err(if data.len() < expected {
                WireError::TooShort {
                    expected,
                    actual: data.len(),
                }
            } else {
                WireError::LengthMismatch {
                    declared: expected,
                    actual: data.len(),
                }
            });
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&data[1..9]);
        let sender = PeerId::from_bytes(id);
        let mut word = [0u8; 4];
        word.copy_from_slice(&data[9..13]);
        let seq = u32::from_le_bytes(word);
        let body = &data[BEACON_HEADER_SIZE..];

        let body = match kind {
            kinds::PING => BeaconBody::Ping(match body[0] {
                1 => PingKind::Request,
                2 => PingKind::Response,
                other => return Err(WireError::InvalidKind(other)),
            }),
            kinds::BROADCAST_SPEAKER => BeaconBody::BroadcastSpeaker(match body[0] {
                0 => SpeakerCause::Announce,
                1 => SpeakerCause::Release,
                other => return Err(WireError::InvalidKind(other)),
            }),
            kinds::GO_SPEAKER => {
                id.copy_from_slice(&body[..8]);
                BeaconBody::GoSpeaker {
                    target: PeerId::from_bytes(id),
                    cause: match body[8] {
                        0 => HandoffCause::Completed,
                        1 => HandoffCause::Abandoned,
                        other => return Err(WireError::InvalidKind(other)),
                    },
                }
            }
            _ => {
                word.copy_from_slice(&body[1..5]);
                BeaconBody::Ack {
                    status: match body[0] {
                        0 => AckStatus::Ok,
                        1 => AckStatus::Abort,
                        other => return Err(WireError::InvalidKind(other)),
                    },
                    acked: u32::from_le_bytes(word),
                }
            }
        };

        Ok(Self { sender, seq, body })
    }
}
