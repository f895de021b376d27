//! Transceiver envelope.
//!
//! Every frame handed to a plugin is one envelope:
//!
//! ```text
//! +------+-----------+-------------+-------------+----------------+-------------+---------+
//! | kind | requester | source (u64)| dest (u64)  | trans_id (u32) | len (u32)   | payload |
//! +------+-----------+-------------+-------------+----------------+-------------+---------+
//! ```
//!
//! All integers are little-endian. `dest == 0` is a broadcast.

use crate::core::constants::{
    ENVELOPE_HEADER_SIZE, FRAME_END, LAST_PACKET, MAX_PACKET_TRANSID, PACKET_KIND_DATA,
    PACKET_KIND_DATALINK,
};
use crate::core::{PeerId, ReqType, WireError};

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Fragment of a requester's block.
    Data = PACKET_KIND_DATA,
    /// Datalink control (beacon).
    Datalink = PACKET_KIND_DATALINK,
}

impl PacketKind {
    /// Parse packet kind from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            PACKET_KIND_DATA => Some(Self::Data),
            PACKET_KIND_DATALINK => Some(Self::Datalink),
            _ => None,
        }
    }

    /// Convert to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Transaction id: a 24-bit sequence plus block and batch markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransId(u32);

impl TransId {
    /// Create a transaction id from a sequence value (masked to 24 bits).
    pub fn new(seq: u32) -> Self {
        Self(seq & MAX_PACKET_TRANSID)
    }

    /// Create from the raw wire value.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Sequence value.
    pub fn seq(self) -> u32 {
        self.0 & MAX_PACKET_TRANSID
    }

    /// Whether this packet closes its block.
    pub fn is_last(self) -> bool {
        self.0 & LAST_PACKET != 0
    }

    /// Whether this packet closes an acknowledged batch.
    pub fn is_frame_end(self) -> bool {
        self.0 & FRAME_END != 0
    }

    /// Set the last-packet marker.
    pub fn with_last(self) -> Self {
        Self(self.0 | LAST_PACKET)
    }

    /// Set the batch-end marker.
    pub fn with_frame_end(self) -> Self {
        Self(self.0 | FRAME_END)
    }

    /// Sequence following `seq`, wrapping at 24 bits.
    pub fn next_seq(seq: u32) -> u32 {
        (seq + 1) & MAX_PACKET_TRANSID
    }

    /// Whether `seq` precedes `reference` in the wrapping 24-bit space.
    pub fn seq_before(seq: u32, reference: u32) -> bool {
        let distance = reference.wrapping_sub(seq) & MAX_PACKET_TRANSID;
        distance != 0 && distance <= MAX_PACKET_TRANSID / 2
    }
}

/// One envelope as exchanged with plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverPacket {
    /// Envelope kind.
    pub kind: PacketKind,
    /// Requester the payload belongs to.
    pub requester: ReqType,
    /// Sending node.
    pub source: PeerId,
    /// Receiving node, or broadcast.
    pub dest: PeerId,
    /// Transaction id.
    pub trans_id: TransId,
    /// Fragment or beacon bytes.
    pub payload: Vec<u8>,
}

impl TransceiverPacket {
    /// Create a data envelope.
    pub fn data(requester: ReqType, source: PeerId, dest: PeerId, payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Data,
            requester,
            source,
            dest,
            trans_id: TransId::default(),
            payload,
        }
    }

    /// Create a datalink control envelope.
    pub fn datalink(source: PeerId, dest: PeerId, payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Datalink,
            requester: ReqType::Datalink,
            source,
            dest,
            trans_id: TransId::default(),
            payload,
        }
    }

    /// Whether `local` should process this envelope.
    pub fn is_for(&self, local: PeerId) -> bool {
        self.source != local && (self.dest.is_broadcast() || self.dest == local)
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| WireError::PayloadTooLarge(self.payload.len()))?;

        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_SIZE + self.payload.len());
        buf.push(self.kind.as_byte());
        buf.push(self.requester.as_byte());
        buf.extend_from_slice(&self.source.to_bytes());
        buf.extend_from_slice(&self.dest.to_bytes());
        buf.extend_from_slice(&self.trans_id.raw().to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(WireError::TooShort {
                expected: ENVELOPE_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let kind = PacketKind::from_byte(data[0]).ok_or(WireError::InvalidKind(data[0]))?;
        let requester = ReqType::from_byte(data[1]).ok_or(WireError::InvalidKind(data[1]))?;

        let mut id = [0u8; 8];
        id.copy_from_slice(&data[2..10]);
        let source = PeerId::from_bytes(id);
        id.copy_from_slice(&data[10..18]);
        let dest = PeerId::from_bytes(id);

        let mut word = [0u8; 4];
        word.copy_from_slice(&data[18..22]);
        let trans_id = TransId::from_raw(u32::from_le_bytes(word));
        word.copy_from_slice(&data[22..26]);
        let len = u32::from_le_bytes(word) as usize;

        let payload = &data[ENVELOPE_HEADER_SIZE..];
        if payload.len() != len {
            return Err(WireError::LengthMismatch {
                declared: len,
                actual: payload.len(),
            });
        }

        Ok(Self {
            kind,
            requester,
            source,
            dest,
            trans_id,
            payload: payload.to_vec(),
        })
    }
}
