//! Fragment encoding and decoding.
//!
//! A block either travels whole in a simple fragment or is split into a run of
//! extended fragments, each carrying its 1-based index and the total count.
//!
//! ```text
//! Simple:   +------+-------------+---------+
//!           | 0x00 | len (u32le) | payload |
//!           +------+-------------+---------+
//!
//! Extended: +------+---------------+---------------+-------------+---------+
//!           | 0x01 | count (u32le) | index (u32le) | len (u32le) | payload |
//!           +------+---------------+---------------+-------------+---------+
//! ```

use crate::core::constants::{
    EXTENDED_HEADER_SIZE, FRAGMENT_KIND_EXTENDED, FRAGMENT_KIND_SIMPLE, SIMPLE_HEADER_SIZE,
};
use crate::core::WireError;

/// One unit of a block, generic over its payload storage.
///
/// The coder borrows slices of the caller's block (`Fragment<&[u8]>`); the
/// decoder owns what it parsed (`Fragment<Vec<u8>>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment<B = Vec<u8>> {
    /// A whole block.
    Simple {
        /// Block bytes.
        payload: B,
    },
    /// One piece of a split block.
    Extended {
        /// 1-based position in the block.
        index: u32,
        /// Number of fragments in the block.
        count: u32,
        /// Piece bytes.
        payload: B,
    },
}

impl<B: AsRef<[u8]>> Fragment<B> {
    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        match self {
            Fragment::Simple { payload } | Fragment::Extended { payload, .. } => payload.as_ref(),
        }
    }

    /// Whether this fragment closes its block.
    pub fn is_completed(&self) -> bool {
        match self {
            Fragment::Simple { .. } => true,
            Fragment::Extended { index, count, .. } => index == count,
        }
    }

    /// Size of the encoded fragment.
    pub fn encoded_len(&self) -> usize {
        let header = match self {
            Fragment::Simple { .. } => SIMPLE_HEADER_SIZE,
            Fragment::Extended { .. } => EXTENDED_HEADER_SIZE,
        };
        header + self.payload().len()
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = self.payload();
        let len = u32::try_from(payload.len())
            .map_err(|_| WireError::PayloadTooLarge(payload.len()))?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        match self {
            Fragment::Simple { .. } => {
                buf.push(FRAGMENT_KIND_SIMPLE);
            }
            Fragment::Extended { index, count, .. } => {
                buf.push(FRAGMENT_KIND_EXTENDED);
                buf.extend_from_slice(&count.to_le_bytes());
                buf.extend_from_slice(&index.to_le_bytes());
            }
        }
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }
}

impl Fragment<Vec<u8>> {
    /// Decode from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let kind = *data.first().ok_or(WireError::TooShort {
            expected: SIMPLE_HEADER_SIZE,
            actual: 0,
        })?;

        match kind {
            FRAGMENT_KIND_SIMPLE => {
                check_len(data, SIMPLE_HEADER_SIZE)?;
                let len = read_u32(data, 1) as usize;
                let payload = take_payload(data, SIMPLE_HEADER_SIZE, len)?;
                Ok(Fragment::Simple { payload })
            }
            FRAGMENT_KIND_EXTENDED => {
                check_len(data, EXTENDED_HEADER_SIZE)?;
                let count = read_u32(data, 1);
                let index = read_u32(data, 5);
                if index == 0 || index > count {
                    return Err(WireError::InvalidIndex { index, count });
                }
                let len = read_u32(data, 9) as usize;
                let payload = take_payload(data, EXTENDED_HEADER_SIZE, len)?;
                Ok(Fragment::Extended {
                    index,
                    count,
                    payload,
                })
            }
            other => Err(WireError::InvalidKind(other)),
        }
    }
}

fn check_len(data: &[u8], expected: usize) -> Result<(), WireError> {
    if data.len() < expected {
        return Err(WireError::TooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn take_payload(data: &[u8], offset: usize, len: usize) -> Result<Vec<u8>, WireError> {
    let body = &data[offset..];
    if body.len() != len {
        return Err(WireError::LengthMismatch {
            declared: len,
            actual: body.len(),
        });
    }
    Ok(body.to_vec())
}
