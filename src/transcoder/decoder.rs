//! Receive-side reassembly.
//!
//! One reassembly buffer exists per (requester, peer). Extended fragments must
//! arrive in index order: index 1 opens a block, each following fragment must
//! carry the next index. A repeated lower index is a resend and is ignored; a
//! gap discards the block.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::{DecodeError, PeerId, ReqType};
use crate::transcoder::Fragment;

/// Result of feeding one fragment to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Fragment stored; the block is not complete yet.
    Pending,
    /// A whole block is available.
    Complete(Vec<u8>),
    /// Fragment was a resend or arrived without its block start.
    Ignored,
    /// A gap was detected; the partial block was discarded.
    Discarded,
}

#[derive(Debug)]
struct Reassembly {
    count: u32,
    received: u32,
    buffer: Vec<u8>,
    last_update: Instant,
}

/// Reassembles fragments into blocks.
#[derive(Debug)]
pub struct Decoder {
    blocks: HashMap<(ReqType, PeerId), Reassembly>,
    block_timeout: Duration,
}

impl Decoder {
    /// Create a decoder whose incomplete blocks expire after `block_timeout`.
    pub fn new(block_timeout: Duration) -> Self {
        Self {
            blocks: HashMap::new(),
            block_timeout,
        }
    }

    /// Feed one fragment received from `from` for requester `req`.
    pub fn on_fragment(
        &mut self,
        req: ReqType,
        from: PeerId,
        fragment: Fragment,
        now: Instant,
    ) -> Result<DecodeOutcome, DecodeError> {
        let (index, count, payload) = match fragment {
            Fragment::Simple { payload } => return Ok(DecodeOutcome::Complete(payload)),
            Fragment::Extended {
                index,
                count,
                payload,
            } => (index, count, payload),
        };

        let key = (req, from);
        if index == 0 || index > count {
            self.blocks.remove(&key);
            return Err(DecodeError::IndexOutOfRange {
                peer: from,
                index,
                count,
            });
        }

        if index == 1 {
            if self.blocks.contains_key(&key) {
                tracing::debug!(%from, ?req, "new block from peer, dropping partial one");
            }
            if count == 1 {
                self.blocks.remove(&key);
                return Ok(DecodeOutcome::Complete(payload));
            }
            self.blocks.insert(
                key,
                Reassembly {
                    count,
                    received: 1,
                    buffer: payload,
                    last_update: now,
                },
            );
            return Ok(DecodeOutcome::Pending);
        }

        let Some(block) = self.blocks.get_mut(&key) else {
            tracing::trace!(%from, index, "fragment without block start, ignored");
            return Ok(DecodeOutcome::Ignored);
        };

        if block.count != count {
            let expected = block.count;
            self.blocks.remove(&key);
            return Err(DecodeError::CountMismatch {
                peer: from,
                expected,
                actual: count,
            });
        }

        if index <= block.received {
            return Ok(DecodeOutcome::Ignored);
        }

        if index != block.received + 1 {
            tracing::debug!(
                %from,
                expected = block.received + 1,
                got = index,
                "fragment gap, discarding block"
            );
            self.blocks.remove(&key);
            return Ok(DecodeOutcome::Discarded);
        }

        block.buffer.extend_from_slice(&payload);
        block.received = index;
        block.last_update = now;

        if index == count {
            let block = self.blocks.remove(&key).map(|b| b.buffer).unwrap_or_default();
            return Ok(DecodeOutcome::Complete(block));
        }
        Ok(DecodeOutcome::Pending)
    }

    /// Drop the partial block `from` was sending to requester `req`.
    pub fn cancel_block(&mut self, req: ReqType, from: PeerId) -> bool {
        self.blocks.remove(&(req, from)).is_some()
    }

    /// Drop every partial block received from `from`.
    ///
    /// Returns the number of blocks dropped.
    pub fn cancel(&mut self, from: PeerId) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|(_, peer), _| *peer != from);
        before - self.blocks.len()
    }

    /// Drop partial blocks not updated within the block timeout.
    ///
    /// Returns the (requester, peer) of each expired block.
    pub fn expire(&mut self, now: Instant) -> Vec<(ReqType, PeerId)> {
        let timeout = self.block_timeout;
        let expired: Vec<(ReqType, PeerId)> = self
            .blocks
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.last_update) >= timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.blocks.remove(key);
        }
        expired
    }

    /// Number of blocks being reassembled.
    pub fn in_progress(&self) -> usize {
        self.blocks.len()
    }

    /// Whether a block from `from` for `req` is being reassembled.
    pub fn has_partial(&self, req: ReqType, from: PeerId) -> bool {
        self.blocks.contains_key(&(req, from))
    }
}
