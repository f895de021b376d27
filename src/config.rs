//! Runtime configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, a TOML
//! file, and the `SOOLINK_LOCAL_ID` / `SOOLINK_WINENET_INTERFACE`
//! environment variables. Programmatic callers use [`SoolinkConfigBuilder`].
//!
//! ```toml
//! local_id = 42
//! max_fragment_payload = 1024
//! decode_block_timeout_ms = 4000
//!
//! [winenet]
//! interface = "wlan"
//! ack_timeout_ms = 800
//! min_drand_us = 1000
//! max_drand_us = 2000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::core::constants::{
    DECODE_BLOCK_TIMEOUT, DECODER_WATCHDOG_PERIOD, DEFAULT_MAX_FRAGMENT_PAYLOAD,
    INBOUND_QUEUE_CAPACITY, MAX_READY_BLOCK_COUNT, WINENET_INBOX_CAPACITY, WNET_ACK_TIMEOUT,
    WNET_LISTENER_TIMEOUT, WNET_MAX_DRAND, WNET_MIN_DRAND, WNET_PACKETS_PER_FRAME,
    WNET_RETRIES_MAX, WNET_STALL_TIMEOUT, WNET_TOKEN_HOLD,
};
use crate::core::{ConfigError, IfType, PeerId};

/// Winenet arbitration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinenetConfig {
    /// Interface the shared channel runs on.
    pub interface: IfType,
    /// Total attempts per acknowledged exchange.
    pub retries_max: u32,
    /// Wait for an acknowledgment.
    pub ack_timeout: Duration,
    /// Retransmission back-off lower bound.
    pub min_drand: Duration,
    /// Retransmission back-off upper bound.
    pub max_drand: Duration,
    /// Channel silence after which a listener gives up its speaker.
    pub listener_timeout: Duration,
    /// How long an idle speaker keeps the token.
    pub token_hold: Duration,
    /// How long a speaker waits for the rest of a block.
    pub stall_timeout: Duration,
    /// Packets acknowledged together.
    pub packets_per_frame: usize,
    /// Command queue depth of the Winenet task.
    pub inbox_capacity: usize,
    /// Seed for the back-off generator; random when unset.
    pub seed: Option<u64>,
}

impl WinenetConfig {
    /// Longest a live speaker can stay unheard by one listener.
    ///
    /// A listener that misses the speaker's data hears nothing for a whole
    /// exchange with it, retries included.
    pub fn speaker_silence(&self) -> Duration {
        ((self.ack_timeout + self.max_drand) * self.retries_max)
            .max(self.token_hold)
            .max(self.stall_timeout)
    }
}

impl Default for WinenetConfig {
    fn default() -> Self {
        Self {
            interface: IfType::Wlan,
            retries_max: WNET_RETRIES_MAX,
            ack_timeout: WNET_ACK_TIMEOUT,
            min_drand: Duration::from_micros(WNET_MIN_DRAND),
            max_drand: Duration::from_micros(WNET_MAX_DRAND),
            listener_timeout: WNET_LISTENER_TIMEOUT,
            token_hold: WNET_TOKEN_HOLD,
            stall_timeout: WNET_STALL_TIMEOUT,
            packets_per_frame: WNET_PACKETS_PER_FRAME,
            inbox_capacity: WINENET_INBOX_CAPACITY,
            seed: None,
        }
    }
}

/// Stack configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoolinkConfig {
    /// This node's identity.
    pub local_id: PeerId,
    /// Largest fragment payload.
    pub max_fragment_payload: usize,
    /// Reassembled blocks buffered per requester.
    pub max_ready_blocks: usize,
    /// Inactivity after which a partial block is dropped.
    pub decode_block_timeout: Duration,
    /// Period of the reassembly watchdog.
    pub watchdog_period: Duration,
    /// Depth of the queue between plugins and the receive worker.
    pub inbound_queue: usize,
    /// Winenet parameters.
    pub winenet: WinenetConfig,
}

impl SoolinkConfig {
    /// Defaults for node `local_id`.
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            max_fragment_payload: DEFAULT_MAX_FRAGMENT_PAYLOAD,
            max_ready_blocks: MAX_READY_BLOCK_COUNT,
            decode_block_timeout: DECODE_BLOCK_TIMEOUT,
            watchdog_period: DECODER_WATCHDOG_PERIOD,
            inbound_queue: INBOUND_QUEUE_CAPACITY,
            winenet: WinenetConfig::default(),
        }
    }

    /// Start a builder for node `local_id`.
    pub fn builder(local_id: PeerId) -> SoolinkConfigBuilder {
        SoolinkConfigBuilder {
            config: Self::new(local_id),
        }
    }

    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        }

        if self.local_id.is_broadcast() {
            return invalid("local_id", "the broadcast identity is reserved");
        }
        if self.max_fragment_payload == 0 || self.max_fragment_payload > u32::MAX as usize {
            return invalid("max_fragment_payload", "must be between 1 and 2^32-1");
        }
        if self.max_ready_blocks == 0 {
            return invalid("max_ready_blocks", "must be positive");
        }
        if self.decode_block_timeout.is_zero() {
            return invalid("decode_block_timeout", "must be positive");
        }
        if self.watchdog_period.is_zero() {
            return invalid("watchdog_period", "must be positive");
        }
        if self.inbound_queue == 0 {
            return invalid("inbound_queue", "must be positive");
        }

        let w = &self.winenet;
        if w.retries_max == 0 {
            return invalid("winenet.retries_max", "at least one attempt is required");
        }
        if w.ack_timeout.is_zero() {
            return invalid("winenet.ack_timeout", "must be positive");
        }
        if w.min_drand > w.max_drand {
            return invalid("winenet.min_drand", "exceeds max_drand");
        }
        if w.listener_timeout <= w.speaker_silence() {
            return invalid(
                "winenet.listener_timeout",
                "must exceed a full retry exchange, the token hold and the stall timeout",
            );
        }
        if w.packets_per_frame == 0 {
            return invalid("winenet.packets_per_frame", "must be positive");
        }
        if w.inbox_capacity == 0 {
            return invalid("winenet.inbox_capacity", "must be positive");
        }
        Ok(())
    }

    /// Parse a TOML document, then validate.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(s)?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, apply environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&text)?;
        let mut config = file.into_config();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `SOOLINK_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(s) = std::env::var("SOOLINK_LOCAL_ID") {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse::<u64>(),
            };
            match parsed {
                Ok(id) => self.local_id = PeerId::new(id),
                Err(_) => tracing::warn!(value = %s, "ignoring malformed SOOLINK_LOCAL_ID"),
            }
        }
        if let Ok(s) = std::env::var("SOOLINK_WINENET_INTERFACE") {
            match IfType::from_name(&s) {
                Some(if_type) => self.winenet.interface = if_type,
                None => tracing::warn!(value = %s, "ignoring unknown SOOLINK_WINENET_INTERFACE"),
            }
        }
    }
}

/// Builder for [`SoolinkConfig`].
#[derive(Debug, Clone)]
pub struct SoolinkConfigBuilder {
    config: SoolinkConfig,
}

impl SoolinkConfigBuilder {
    /// Set the largest fragment payload.
    pub fn max_fragment_payload(mut self, bytes: usize) -> Self {
        self.config.max_fragment_payload = bytes;
        self
    }

    /// Set the ready-queue depth per requester.
    pub fn max_ready_blocks(mut self, blocks: usize) -> Self {
        self.config.max_ready_blocks = blocks;
        self
    }

    /// Set the partial-block inactivity timeout.
    pub fn decode_block_timeout(mut self, timeout: Duration) -> Self {
        self.config.decode_block_timeout = timeout;
        self
    }

    /// Set the watchdog period.
    pub fn watchdog_period(mut self, period: Duration) -> Self {
        self.config.watchdog_period = period;
        self
    }

    /// Set the inbound queue depth.
    pub fn inbound_queue(mut self, depth: usize) -> Self {
        self.config.inbound_queue = depth;
        self
    }

    /// Set the Winenet interface.
    pub fn winenet_interface(mut self, if_type: IfType) -> Self {
        self.config.winenet.interface = if_type;
        self
    }

    /// Set the acknowledgment timeout.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.winenet.ack_timeout = timeout;
        self
    }

    /// Set total attempts per exchange.
    pub fn retries_max(mut self, attempts: u32) -> Self {
        self.config.winenet.retries_max = attempts;
        self
    }

    /// Set the back-off range.
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.winenet.min_drand = min;
        self.config.winenet.max_drand = max;
        self
    }

    /// Set the listener silence timeout.
    pub fn listener_timeout(mut self, timeout: Duration) -> Self {
        self.config.winenet.listener_timeout = timeout;
        self
    }

    /// Set the idle token hold time.
    pub fn token_hold(mut self, hold: Duration) -> Self {
        self.config.winenet.token_hold = hold;
        self
    }

    /// Set the mid-block stall timeout.
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.winenet.stall_timeout = timeout;
        self
    }

    /// Set packets acknowledged together.
    pub fn packets_per_frame(mut self, packets: usize) -> Self {
        self.config.winenet.packets_per_frame = packets;
        self
    }

    /// Seed the back-off generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.winenet.seed = Some(seed);
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SoolinkConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// On-disk layout.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    local_id: PeerId,
    #[serde(default = "default_max_fragment_payload")]
    max_fragment_payload: usize,
    #[serde(default = "default_max_ready_blocks")]
    max_ready_blocks: usize,
    #[serde(default = "default_decode_block_timeout_ms")]
    decode_block_timeout_ms: u64,
    #[serde(default = "default_watchdog_period_ms")]
    watchdog_period_ms: u64,
    #[serde(default = "default_inbound_queue")]
    inbound_queue: usize,
    #[serde(default)]
    winenet: WinenetFile,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct WinenetFile {
    interface: IfType,
    retries_max: u32,
    ack_timeout_ms: u64,
    min_drand_us: u64,
    max_drand_us: u64,
    listener_timeout_ms: u64,
    token_hold_ms: u64,
    stall_timeout_ms: u64,
    packets_per_frame: usize,
    inbox_capacity: usize,
    seed: Option<u64>,
}

fn default_max_fragment_payload() -> usize {
    DEFAULT_MAX_FRAGMENT_PAYLOAD
}
fn default_max_ready_blocks() -> usize {
    MAX_READY_BLOCK_COUNT
}
fn default_decode_block_timeout_ms() -> u64 {
    DECODE_BLOCK_TIMEOUT.as_millis() as u64
}
fn default_watchdog_period_ms() -> u64 {
    DECODER_WATCHDOG_PERIOD.as_millis() as u64
}
fn default_inbound_queue() -> usize {
    INBOUND_QUEUE_CAPACITY
}

impl Default for WinenetFile {
    fn default() -> Self {
        let d = WinenetConfig::default();
        Self {
            interface: d.interface,
            retries_max: d.retries_max,
            ack_timeout_ms: d.ack_timeout.as_millis() as u64,
            min_drand_us: d.min_drand.as_micros() as u64,
            max_drand_us: d.max_drand.as_micros() as u64,
            listener_timeout_ms: d.listener_timeout.as_millis() as u64,
            token_hold_ms: d.token_hold.as_millis() as u64,
            stall_timeout_ms: d.stall_timeout.as_millis() as u64,
            packets_per_frame: d.packets_per_frame,
            inbox_capacity: d.inbox_capacity,
            seed: d.seed,
        }
    }
}

impl ConfigFile {
    fn into_config(self) -> SoolinkConfig {
        let w = self.winenet;
        SoolinkConfig {
            local_id: self.local_id,
            max_fragment_payload: self.max_fragment_payload,
            max_ready_blocks: self.max_ready_blocks,
            decode_block_timeout: Duration::from_millis(self.decode_block_timeout_ms),
            watchdog_period: Duration::from_millis(self.watchdog_period_ms),
            inbound_queue: self.inbound_queue,
            winenet: WinenetConfig {
                interface: w.interface,
                retries_max: w.retries_max,
                ack_timeout: Duration::from_millis(w.ack_timeout_ms),
                min_drand: Duration::from_micros(w.min_drand_us),
                max_drand: Duration::from_micros(w.max_drand_us),
                listener_timeout: Duration::from_millis(w.listener_timeout_ms),
                token_hold: Duration::from_millis(w.token_hold_ms),
                stall_timeout: Duration::from_millis(w.stall_timeout_ms),
                packets_per_frame: w.packets_per_frame,
                inbox_capacity: w.inbox_capacity,
                seed: w.seed,
            },
        }
    }
}
