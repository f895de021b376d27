//! SOOlink transceiver.
//!
//! Wraps fragments in envelopes on the way out and unwraps them on the way in:
//!
//! - **Packet**: [`TransceiverPacket`] envelope and its [`TransId`]
//! - **Plugins**: the [`Plugin`] seam to physical mediums, with a UDP and a
//!   simulated implementation
//! - **Sender / Receiver**: serialized transmission and reassembly
//! - **Transceiver**: the fragment sink used by the coder, and the inbound
//!   dispatch from plugins to the datalink

mod error;
mod packet;
mod plugin;
mod receiver;
mod sender;
mod sim;
mod udp;

use std::sync::Arc;

pub use error::{PluginError, TransceiverError, TransceiverResult};
pub use packet::{PacketKind, TransId, TransceiverPacket};
pub use plugin::{FrameSink, InboundFrame, Plugin, PluginId, PluginSet};
pub use receiver::{Receiver, RxOutcome};
pub use sender::Sender;
pub use sim::{SimPort, SimulatedMedium};
pub use udp::{UdpPlugin, UdpPluginBuilder};

use crate::core::PeerId;
use crate::datalink::Datalink;
use crate::soolink::{Registry, SlDesc};
use crate::transcoder::FragmentSink;

/// Envelope layer of one node.
#[derive(Debug, Clone)]
pub struct Transceiver {
    local: PeerId,
    datalink: Datalink,
    registry: Arc<Registry>,
}

impl Transceiver {
    /// Create the transceiver of node `local`.
    pub fn new(local: PeerId, datalink: Datalink, registry: Arc<Registry>) -> Self {
        Self {
            local,
            datalink,
            registry,
        }
    }

    /// Local identity.
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Datalink dispatcher.
    pub fn datalink(&self) -> &Datalink {
        &self.datalink
    }

    /// Process one frame received by a plugin.
    ///
    /// Malformed frames and frames for an unregistered requester are dropped.
    /// Frames addressed to other nodes only reach the datalink's arbitration.
    pub async fn on_frame(&self, frame: InboundFrame) {
        let packet = match TransceiverPacket::decode(&frame.bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!(plugin = frame.plugin.0, error = %e, "malformed frame dropped");
                return;
            }
        };
        if packet.source == self.local {
            return;
        }

        let Some(desc) = self.registry.find(packet.requester).await else {
            tracing::trace!(req = ?packet.requester, from = %packet.source, "no requester, frame dropped");
            return;
        };
        if packet.is_for(self.local) {
            self.datalink.dispatch_rx(&desc, packet).await;
        } else {
            self.datalink.overhear(&desc, packet).await;
        }
    }
}

impl FragmentSink for Transceiver {
    async fn transmit(
        &self,
        desc: &SlDesc,
        fragment: Option<Vec<u8>>,
        completed: bool,
        dest: PeerId,
    ) -> TransceiverResult<()> {
        let packet = fragment.map(|bytes| {
            let mut packet = TransceiverPacket::data(desc.req_type(), self.local, dest, bytes);
            if completed {
                packet.trans_id = packet.trans_id.with_last();
            }
            packet
        });
        self.datalink.dispatch_tx(desc, packet, completed).await
    }
}
