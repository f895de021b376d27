//! # SOOlink
//!
//! Packet transport for smart-object meshes. SOOlink moves opaque byte
//! blocks between neighbouring nodes over a shared broadcast medium:
//!
//! - **Fragmentation**: blocks larger than the link payload are split into
//!   ordered fragments and reassembled on the other side
//! - **Envelopes**: every fragment travels in a typed envelope naming its
//!   requester, source, destination and transaction id
//! - **Arbitration**: the Winenet protocol elects one speaker at a time and
//!   hands the token round-robin, acknowledging every frame
//! - **Routing**: broadcast-like traffic goes through Winenet, unicast goes
//!   straight to the medium
//!
//! ## Feature Flags
//!
//! - `transport` (default): transceiver, datalink and the [`Soolink`] service
//!
//! ## Modules
//!
//! - [`core`]: identities, requester kinds, constants and errors (always included)
//! - [`transcoder`]: fragment codec, splitting and reassembly (always included)
//! - [`config`]: configuration, builder and TOML loading (always included)
//! - [`logging`]: tracing subscriber setup (always included)
//! - [`transceiver`]: envelopes, plugins, sender and receiver (requires `transport`)
//! - [`datalink`]: route dispatch and Winenet (requires `transport`)
//! - [`soolink`]: descriptors, registry and the node service (requires `transport`)
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use soolink::prelude::*;
//!
//! # async fn run() -> SoolinkResult<()> {
//! let medium = SimulatedMedium::new();
//! let config = SoolinkConfig::builder(PeerId::new(1))
//!     .winenet_interface(IfType::Sim)
//!     .build()?;
//! let node = Soolink::start(config, vec![Arc::new(medium.port())]).await?;
//! node.neighbour_added(PeerId::new(2)).await;
//!
//! let dcm = node
//!     .register(ReqType::Dcm, IfType::Sim, TransMode::Broadcast)
//!     .await?;
//! node.send(&dcm, b"mobile entity", None, 0).await?;
//! let reply = node.recv(&dcm).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Always included
pub mod config;
pub mod core;
pub mod logging;
pub mod transcoder;

// Transport layers (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod datalink;

#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod soolink;

#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transceiver;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{SoolinkConfig, SoolinkConfigBuilder, WinenetConfig};
    pub use crate::core::*;
    pub use crate::transcoder::{Fragment, split};

    #[cfg(feature = "transport")]
    pub use crate::datalink::{
        Datalink, DatalinkError, Route,
        winenet::{WinenetSnapshot, WinenetState},
    };

    #[cfg(feature = "transport")]
    pub use crate::soolink::{Block, DescStats, SlDesc, Soolink};

    #[cfg(feature = "transport")]
    pub use crate::transceiver::{
        InboundFrame, Plugin, PluginError, SimulatedMedium, TransceiverError, TransceiverPacket,
        TransceiverResult, UdpPlugin,
    };
}

// Re-export commonly used items at crate root
pub use crate::config::{SoolinkConfig, WinenetConfig};
pub use crate::core::{ConfigError, IfType, PeerId, ReqType, SoolinkError, SoolinkResult, TransMode};

#[cfg(feature = "transport")]
pub use crate::soolink::{SlDesc, Soolink};
