//! SOOlink transcoder.
//!
//! Splits blocks larger than the link payload into ordered fragments on send,
//! and reassembles them on receive:
//!
//! - **Fragments**: [`Fragment`] tagged union (simple or extended) and its wire codec
//! - **Coder**: [`split`] and the serialized `Coder` feeding the transceiver
//! - **Decoder**: [`Decoder`] per-peer reassembly with stale-block expiry

mod coder;
mod decoder;
mod fragment;

pub use coder::*;
pub use decoder::{DecodeOutcome, Decoder};
pub use fragment::Fragment;
