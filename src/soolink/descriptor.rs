//! Transport descriptors.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::core::{IfType, PeerId, ReqType, TransMode};

/// A reassembled block ready for the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Node that sent the block.
    pub from: PeerId,
    /// Block bytes.
    pub data: Vec<u8>,
}

/// Counters kept per descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescStats {
    /// Blocks handed to the transport.
    pub blocks_sent: u64,
    /// Bytes handed to the transport.
    pub bytes_sent: u64,
    /// Blocks returned by `recv`.
    pub blocks_received: u64,
    /// Bytes returned by `recv`.
    pub bytes_received: u64,
    /// Blocks abandoned after retry exhaustion.
    pub blocks_abandoned: u64,
    /// Completed blocks dropped because the ready queue was full.
    pub blocks_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    blocks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    blocks_received: AtomicU64,
    bytes_received: AtomicU64,
    blocks_abandoned: AtomicU64,
    blocks_dropped: AtomicU64,
}

/// A registered requester's transport session.
#[derive(Debug)]
pub struct SlDesc {
    req_type: ReqType,
    if_type: IfType,
    trans_mode: TransMode,
    priority: AtomicU32,
    exclusive: AtomicBool,
    ready_tx: StdMutex<Option<mpsc::Sender<Block>>>,
    ready_rx: Mutex<mpsc::Receiver<Block>>,
    counters: Counters,
}

impl SlDesc {
    /// Create a descriptor holding at most `max_ready_blocks` unread blocks.
    pub fn new(
        req_type: ReqType,
        if_type: IfType,
        trans_mode: TransMode,
        max_ready_blocks: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(max_ready_blocks.max(1));
        Self {
            req_type,
            if_type,
            trans_mode,
            priority: AtomicU32::new(0),
            exclusive: AtomicBool::new(false),
            ready_tx: StdMutex::new(Some(tx)),
            ready_rx: Mutex::new(rx),
            counters: Counters::default(),
        }
    }

    /// Requester kind.
    pub fn req_type(&self) -> ReqType {
        self.req_type
    }

    /// Interface kind.
    pub fn if_type(&self) -> IfType {
        self.if_type
    }

    /// Transmission mode.
    pub fn trans_mode(&self) -> TransMode {
        self.trans_mode
    }

    /// Priority of the last send.
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Whether the requester asked for exclusive use of its medium.
    pub fn exclusive(&self) -> bool {
        self.exclusive.load(Ordering::Relaxed)
    }

    /// Set the exclusive flag.
    pub fn set_exclusive(&self, exclusive: bool) {
        self.exclusive.store(exclusive, Ordering::Relaxed);
    }

    /// Snapshot of the descriptor counters.
    pub fn stats(&self) -> DescStats {
        let c = &self.counters;
        DescStats {
            blocks_sent: c.blocks_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            blocks_received: c.blocks_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            blocks_abandoned: c.blocks_abandoned.load(Ordering::Relaxed),
            blocks_dropped: c.blocks_dropped.load(Ordering::Relaxed),
        }
    }

    /// Queue a completed block for `recv`.
    ///
    /// Gives the block back if the queue is full or the descriptor is closed.
    pub(crate) fn deliver(&self, block: Block) -> Result<(), Block> {
        let tx = self.ready_tx.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = tx.as_ref() else {
            return Err(block);
        };
        tx.try_send(block).map_err(|e| {
            self.counters.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(b) | mpsc::error::TrySendError::Closed(b) => b,
            }
        })
    }

    /// Wait for the next completed block. `None` once the descriptor is closed.
    pub(crate) async fn next_block(&self) -> Option<Block> {
        let block = self.ready_rx.lock().await.recv().await?;
        self.counters.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(block.data.len() as u64, Ordering::Relaxed);
        Some(block)
    }

    /// Stop accepting blocks and wake pending `recv` calls once drained.
    pub(crate) fn close(&self) {
        self.ready_tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.counters.blocks_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.counters.blocks_abandoned.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(max_ready: usize) -> SlDesc {
        SlDesc::new(ReqType::Dcm, IfType::Sim, TransMode::Broadcast, max_ready)
    }

    fn block(byte: u8) -> Block {
        Block {
            from: PeerId::new(1),
            data: vec![byte; 4],
        }
    }

    #[tokio::test]
    async fn test_deliver_and_receive() {
        let d = desc(2);
        d.deliver(block(1)).unwrap();
        d.deliver(block(2)).unwrap();

        assert_eq!(d.next_block().await.unwrap(), block(1));
        assert_eq!(d.next_block().await.unwrap(), block(2));

        let stats = d.stats();
        assert_eq!(stats.blocks_received, 2);
        assert_eq!(stats.bytes_received, 8);
    }

    #[tokio::test]
    async fn test_ready_limit() {
        let d = desc(1);
        d.deliver(block(1)).unwrap();
        assert_eq!(d.deliver(block(2)), Err(block(2)));
        assert_eq!(d.stats().blocks_dropped, 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let d = desc(4);
        d.deliver(block(1)).unwrap();
        d.close();

        assert!(d.deliver(block(2)).is_err());
        assert_eq!(d.next_block().await, Some(block(1)));
        assert_eq!(d.next_block().await, None);
    }

    #[test]
    fn test_flags_and_counters() {
        let d = desc(1);
        assert!(!d.exclusive());
        d.set_exclusive(true);
        assert!(d.exclusive());

        d.set_priority(42);
        assert_eq!(d.priority(), 42);

        d.record_sent(100);
        d.record_abandoned();
        let stats = d.stats();
        assert_eq!(stats.blocks_sent, 1);
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.blocks_abandoned, 1);
    }
}
