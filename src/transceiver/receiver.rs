//! Receiver: feeds data envelopes to the decoder.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::packet::TransceiverPacket;
use crate::core::{PeerId, ReqType};
use crate::soolink::{Block, SlDesc};
use crate::transcoder::{DecodeOutcome, Decoder, Fragment};

/// What happened to one received fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Stored; the block is still incomplete.
    Pending,
    /// A complete block was queued on the descriptor.
    Delivered,
    /// Duplicate, out of place, or malformed; nothing changed.
    Ignored,
    /// The block from this peer was dropped.
    Discarded,
}

/// Strips envelopes and reassembles blocks.
///
/// Decoding is serialized: two fragments are never processed concurrently.
#[derive(Debug)]
pub struct Receiver {
    decoder: Mutex<Decoder>,
}

impl Receiver {
    /// Create a receiver whose partial blocks expire after `block_timeout`.
    pub fn new(block_timeout: Duration) -> Self {
        Self {
            decoder: Mutex::new(Decoder::new(block_timeout)),
        }
    }

    /// Process one data envelope addressed to `desc`.
    pub async fn rx(&self, desc: &SlDesc, packet: &TransceiverPacket) -> RxOutcome {
        let fragment = match Fragment::decode(&packet.payload) {
            Ok(f) => f,
            Err(e) => {
                tracing::trace!(from = %packet.source, error = %e, "malformed fragment dropped");
                return RxOutcome::Ignored;
            }
        };

        let now = Instant::now().into_std();
        let outcome = {
            let mut decoder = self.decoder.lock().await;
            decoder.on_fragment(desc.req_type(), packet.source, fragment, now)
        };

        match outcome {
            Ok(DecodeOutcome::Pending) => RxOutcome::Pending,
            Ok(DecodeOutcome::Ignored) => RxOutcome::Ignored,
            Ok(DecodeOutcome::Discarded) => RxOutcome::Discarded,
            Ok(DecodeOutcome::Complete(data)) => {
                let len = data.len();
                let block = Block {
                    from: packet.source,
                    data,
                };
                match desc.deliver(block) {
                    Ok(()) => {
                        tracing::debug!(req = ?desc.req_type(), from = %packet.source, len, "block delivered");
                        RxOutcome::Delivered
                    }
                    Err(_) => {
                        tracing::warn!(
                            req = ?desc.req_type(),
                            from = %packet.source,
                            "too many ready blocks, discarding"
                        );
                        RxOutcome::Discarded
                    }
                }
            }
            Err(e) => {
                tracing::warn!(from = %packet.source, error = %e, "reassembly failed");
                RxOutcome::Discarded
            }
        }
    }

    /// Drop partial blocks from `peer`.
    pub async fn cancel(&self, peer: PeerId) -> usize {
        let dropped = self.decoder.lock().await.cancel(peer);
        if dropped > 0 {
            tracing::debug!(%peer, dropped, "reassembly cancelled");
        }
        dropped
    }

    /// Drop the partial block `peer` was sending to `req`.
    pub async fn cancel_block(&self, req: ReqType, peer: PeerId) -> bool {
        let dropped = self.decoder.lock().await.cancel_block(req, peer);
        if dropped {
            tracing::debug!(?req, %peer, "reassembly cancelled");
        }
        dropped
    }

    /// Drop partial blocks that stopped making progress.
    pub async fn expire(&self) -> Vec<(ReqType, PeerId)> {
        let now = Instant::now().into_std();
        self.decoder.lock().await.expire(now)
    }

    /// Whether a block from `peer` for `req` is being reassembled.
    pub async fn has_partial(&self, req: ReqType, peer: PeerId) -> bool {
        self.decoder.lock().await.has_partial(req, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IfType, TransMode};
    use crate::transcoder::split;

    const PEER: PeerId = PeerId::new(3);

    fn packets(data: &[u8], max: usize) -> Vec<TransceiverPacket> {
        split(data, max)
            .iter()
            .map(|f| {
                TransceiverPacket::data(ReqType::Dcm, PEER, PeerId::BROADCAST, f.encode().unwrap())
            })
            .collect()
    }

    fn desc(max_ready: usize) -> SlDesc {
        SlDesc::new(ReqType::Dcm, IfType::Sim, TransMode::Broadcast, max_ready)
    }

    #[tokio::test]
    async fn test_rx_delivers_block() {
        let receiver = Receiver::new(Duration::from_secs(4));
        let desc = desc(4);
        let data = vec![0x42; 300];

        let outcomes: Vec<RxOutcome> = {
            let mut v = Vec::new();
            for p in packets(&data, 100) {
                v.push(receiver.rx(&desc, &p).await);
            }
            v
        };
        assert_eq!(
            outcomes,
            vec![RxOutcome::Pending, RxOutcome::Pending, RxOutcome::Delivered]
        );

        let block = desc.next_block().await.unwrap();
        assert_eq!(block.from, PEER);
        assert_eq!(block.data, data);
    }

    #[tokio::test]
    async fn test_rx_ready_limit_discards() {
        let receiver = Receiver::new(Duration::from_secs(4));
        let desc = desc(1);

        let p = &packets(b"one", 100)[0];
        assert_eq!(receiver.rx(&desc, p).await, RxOutcome::Delivered);
        assert_eq!(receiver.rx(&desc, p).await, RxOutcome::Discarded);
        assert_eq!(desc.stats().blocks_dropped, 1);
    }

    #[tokio::test]
    async fn test_rx_malformed_is_ignored() {
        let receiver = Receiver::new(Duration::from_secs(4));
        let packet = TransceiverPacket::data(ReqType::Dcm, PEER, PeerId::BROADCAST, vec![0x77]);
        assert_eq!(receiver.rx(&desc(1), &packet).await, RxOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_cancel_partial() {
        let receiver = Receiver::new(Duration::from_secs(4));
        let desc = desc(1);
        let all = packets(&[1u8; 250], 100);

        receiver.rx(&desc, &all[0]).await;
        assert!(receiver.has_partial(ReqType::Dcm, PEER).await);

        assert_eq!(receiver.cancel(PEER).await, 1);
        assert!(!receiver.has_partial(ReqType::Dcm, PEER).await);
        assert_eq!(receiver.rx(&desc, &all[1]).await, RxOutcome::Ignored);
    }
}
