//! Identity and classification types shared by every layer.

use std::fmt;

use serde::Deserialize;

use super::constants::BROADCAST_ID;

/// Identity of a smart object (its agency UID).
///
/// Identities are totally ordered; the order drives the ping convention and
/// the round-robin handoff ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    /// Destination meaning "every node on the medium".
    pub const BROADCAST: Self = Self(BROADCAST_ID);

    /// Create an identity from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identity value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Check whether this is the broadcast identity.
    pub fn is_broadcast(self) -> bool {
        self.0 == BROADCAST_ID
    }

    /// Encode as little-endian bytes.
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decode from little-endian bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Component requesting transport services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReqType {
    /// Migration engine (data communication manager).
    Dcm = 0x01,
    /// TCP bridge.
    Tcp = 0x02,
    /// Bluetooth bridge.
    Bt = 0x03,
    /// Neighbour discovery.
    Discovery = 0x04,
    /// Streaming channel.
    Netstream = 0x05,
    /// Direct peer-to-peer exchange.
    Peer = 0x06,
    /// Datalink control traffic (Winenet beacons).
    Datalink = 0x07,
}

impl ReqType {
    /// Parse a requester kind from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Dcm),
            0x02 => Some(Self::Tcp),
            0x03 => Some(Self::Bt),
            0x04 => Some(Self::Discovery),
            0x05 => Some(Self::Netstream),
            0x06 => Some(Self::Peer),
            0x07 => Some(Self::Datalink),
            _ => None,
        }
    }

    /// Convert to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Physical medium a descriptor or plugin works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfType {
    /// Wireless LAN.
    Wlan,
    /// Wired Ethernet.
    Eth,
    /// TCP stream.
    Tcp,
    /// Bluetooth.
    Bt,
    /// Local loopback.
    Loop,
    /// Simulated medium.
    Sim,
}

impl IfType {
    /// Parse the lowercase name used in configuration files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "wlan" => Some(Self::Wlan),
            "eth" => Some(Self::Eth),
            "tcp" => Some(Self::Tcp),
            "bt" => Some(Self::Bt),
            "loop" => Some(Self::Loop),
            "sim" => Some(Self::Sim),
            _ => None,
        }
    }

    /// Mediums that frame their own payloads and skip fragmentation.
    pub fn bypasses_transcoder(self) -> bool {
        matches!(self, Self::Tcp | Self::Bt)
    }
}

/// How a descriptor's traffic reaches its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransMode {
    /// One known peer, no arbitration.
    Unicast,
    /// Every neighbour.
    Broadcast,
    /// Broadcast medium, per-listener delivery.
    Unibroad,
    /// Continuous stream to every neighbour.
    Netstream,
}

impl TransMode {
    /// Modes that go through Winenet arbitration.
    pub fn is_broadcast_like(self) -> bool {
        !matches!(self, Self::Unicast)
    }
}
