//! Send-side fragmentation.

use crate::core::{IfType, ReqType};
use crate::transcoder::Fragment;

#[cfg(feature = "transport")]
pub use self::serialized::{Coder, FragmentSink};

/// Split a block into the fragments that carry it.
///
/// A block that fits in `max_payload` travels as one simple fragment; a larger
/// one becomes `ceil(len / max_payload)` extended fragments indexed from 1.
/// An empty block yields no fragments.
pub fn split(data: &[u8], max_payload: usize) -> Vec<Fragment<&[u8]>> {
    if data.is_empty() {
        return Vec::new();
    }
    let max_payload = max_payload.max(1);
    if data.len() <= max_payload {
        return vec![Fragment::Simple { payload: data }];
    }

    let count = data.len().div_ceil(max_payload) as u32;
    data.chunks(max_payload)
        .zip(1..)
        .map(|(payload, index)| Fragment::Extended {
            index,
            count,
            payload,
        })
        .collect()
}

/// Whether blocks for this descriptor skip fragmentation entirely.
pub fn bypasses_transcoder(if_type: IfType, req_type: ReqType) -> bool {
    if_type.bypasses_transcoder() || req_type == ReqType::Peer
}

#[cfg(feature = "transport")]
mod serialized {
    use std::future::Future;

    use tokio::sync::Mutex;

    use super::{bypasses_transcoder, split};
    use crate::core::PeerId;
    use crate::soolink::SlDesc;
    use crate::transcoder::Fragment;
    use crate::transceiver::TransceiverResult;

    /// Destination of encoded fragments, normally the transceiver.
    pub trait FragmentSink: Sync {
        /// Submit one encoded fragment.
        ///
        /// `None` is the end-of-transmission signal. `completed` marks the
        /// fragment that closes its block.
        fn transmit(
            &self,
            desc: &SlDesc,
            fragment: Option<Vec<u8>>,
            completed: bool,
            dest: PeerId,
        ) -> impl Future<Output = TransceiverResult<()>> + Send;
    }

    /// Fragments blocks and feeds them to a [`FragmentSink`].
    ///
    /// One block is emitted at a time per node; fragments of two blocks never
    /// interleave.
    #[derive(Debug)]
    pub struct Coder {
        max_payload: usize,
        tx_lock: Mutex<()>,
    }

    impl Coder {
        /// Create a coder with the given maximum fragment payload.
        pub fn new(max_payload: usize) -> Self {
            Self {
                max_payload,
                tx_lock: Mutex::new(()),
            }
        }

        /// Maximum payload carried by one fragment.
        pub fn max_payload(&self) -> usize {
            self.max_payload
        }

        /// Encode `data` and submit every fragment to `sink`.
        ///
        /// Returns the number of fragments emitted. An empty block sends the
        /// end-of-transmission signal. Emission stops at the first fragment the
        /// sink rejects and that error is returned.
        pub async fn encode<S: FragmentSink>(
            &self,
            sink: &S,
            desc: &SlDesc,
            data: &[u8],
            dest: PeerId,
        ) -> TransceiverResult<usize> {
            let _guard = self.tx_lock.lock().await;

            if data.is_empty() {
                sink.transmit(desc, None, true, dest).await?;
                return Ok(0);
            }

            let fragments = if bypasses_transcoder(desc.if_type(), desc.req_type()) {
                vec![Fragment::Simple { payload: data }]
            } else {
                split(data, self.max_payload)
            };

            let total = fragments.len();
            for (sent, fragment) in fragments.iter().enumerate() {
                let bytes = fragment.encode()?;
                if let Err(e) = sink
                    .transmit(desc, Some(bytes), fragment.is_completed(), dest)
                    .await
                {
                    tracing::debug!(
                        req = ?desc.req_type(),
                        sent,
                        total,
                        error = %e,
                        "fragment rejected, dropping rest of block"
                    );
                    return Err(e);
                }
            }

            Ok(total)
        }
    }
}
