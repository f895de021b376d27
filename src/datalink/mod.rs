//! Datalink layer.
//!
//! Sits between the transceiver and the medium. Descriptors whose mode is
//! broadcast-like share the channel through [`winenet`] arbitration; unicast
//! descriptors, and every descriptor when Winenet is disabled, go straight to
//! the sender.

mod error;
pub mod winenet;

use std::sync::Arc;

pub use error::DatalinkError;

use crate::core::PeerId;
use crate::soolink::SlDesc;
use crate::transceiver::{Receiver, RxOutcome, Sender, TransceiverPacket, TransceiverResult};
use winenet::WinenetHandle;

/// Path a descriptor's traffic takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Arbitrated shared channel.
    Winenet,
    /// Straight to the plugin.
    Direct,
}

/// Per-descriptor dispatcher.
#[derive(Debug, Clone)]
pub struct Datalink {
    sender: Arc<Sender>,
    receiver: Arc<Receiver>,
    winenet: Option<WinenetHandle>,
}

impl Datalink {
    /// Create a dispatcher; `winenet` is `None` when arbitration is disabled.
    pub fn new(
        sender: Arc<Sender>,
        receiver: Arc<Receiver>,
        winenet: Option<WinenetHandle>,
    ) -> Self {
        Self {
            sender,
            receiver,
            winenet,
        }
    }

    /// Running Winenet task, if any.
    pub fn winenet(&self) -> Option<&WinenetHandle> {
        self.winenet.as_ref()
    }

    /// Route taken by `desc`.
    pub fn route(&self, desc: &SlDesc) -> Route {
        match (&self.winenet, desc.trans_mode().is_broadcast_like()) {
            (Some(_), true) => Route::Winenet,
            _ => Route::Direct,
        }
    }

    /// Send one data envelope, or end of stream with `None`.
    pub async fn dispatch_tx(
        &self,
        desc: &SlDesc,
        packet: Option<TransceiverPacket>,
        completed: bool,
    ) -> TransceiverResult<()> {
        match (self.route(desc), &self.winenet) {
            (Route::Winenet, Some(winenet)) => Ok(winenet.xmit(packet, completed).await?),
            _ => match packet {
                Some(packet) => self.sender.tx(desc.if_type(), &packet).await,
                None => Ok(()),
            },
        }
    }

    /// Hand a received envelope to the right consumer.
    pub async fn dispatch_rx(&self, desc: &SlDesc, packet: TransceiverPacket) {
        match (self.route(desc), &self.winenet) {
            (Route::Winenet, Some(winenet)) => winenet.rx(packet).await,
            _ => {
                let source = packet.source;
                if self.receiver.rx(desc, &packet).await == RxOutcome::Discarded {
                    self.cancel_rx(desc, source).await;
                }
            }
        }
    }

    /// Let Winenet see an envelope addressed to another node.
    ///
    /// Only arbitrated traffic is passed on; it shows whether a speaker is
    /// still active.
    pub async fn overhear(&self, desc: &SlDesc, packet: TransceiverPacket) {
        if let (Route::Winenet, Some(winenet)) = (self.route(desc), &self.winenet) {
            winenet.rx(packet).await;
        }
    }

    /// Abandon the reassembly `peer` was sending to `desc`.
    ///
    /// The arbitration binding to `peer` is left in place.
    pub async fn cancel_rx(&self, desc: &SlDesc, peer: PeerId) {
        self.receiver.cancel_block(desc.req_type(), peer).await;
    }
}
