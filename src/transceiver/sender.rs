//! Sender: the physical transmission path.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::error::TransceiverResult;
use super::packet::TransceiverPacket;
use super::plugin::PluginSet;
use crate::core::IfType;

/// Encodes envelopes and fans them out to the plugins of one medium.
///
/// One physical transmission is in flight at a time per node.
#[derive(Debug)]
pub struct Sender {
    plugins: PluginSet,
    lock: Mutex<()>,
    frames_sent: AtomicU64,
}

impl Sender {
    /// Create a sender over `plugins`.
    pub fn new(plugins: PluginSet) -> Self {
        Self {
            plugins,
            lock: Mutex::new(()),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Transmit one envelope on every plugin serving `if_type`.
    pub async fn tx(&self, if_type: IfType, packet: &TransceiverPacket) -> TransceiverResult<()> {
        let frame = packet.encode()?;
        let _guard = self.lock.lock().await;
        self.plugins.transmit(if_type, &frame, packet.dest)?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            kind = ?packet.kind,
            dest = %packet.dest,
            trans_id = packet.trans_id.raw(),
            len = frame.len(),
            "frame sent"
        );
        Ok(())
    }

    /// Frames handed to plugins so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}
