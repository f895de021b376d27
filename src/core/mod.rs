//! Core types, constants, and errors shared by every SOOlink layer.

pub mod constants;
mod error;
mod types;

pub use error::*;
pub use types::*;
