//! Physical-medium plugin interface.
//!
//! A plugin moves opaque frames over one medium. Outbound frames arrive via
//! [`Plugin::transmit`]; inbound frames are pushed into the [`FrameSink`]
//! handed over by [`Plugin::attach`], which feeds the stack's receive worker.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::error::{PluginError, TransceiverError, TransceiverResult};
use crate::core::{IfType, PeerId};

/// Index of a plugin within the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginId(pub usize);

/// A frame received by a plugin.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Plugin that received the frame.
    pub plugin: PluginId,
    /// Raw envelope bytes.
    pub bytes: Vec<u8>,
}

/// Upward path for frames received by a plugin.
#[derive(Debug, Clone)]
pub struct FrameSink {
    plugin: PluginId,
    tx: mpsc::Sender<InboundFrame>,
}

impl FrameSink {
    /// Create a sink for `plugin` feeding `tx`.
    pub fn new(plugin: PluginId, tx: mpsc::Sender<InboundFrame>) -> Self {
        Self { plugin, tx }
    }

    /// Plugin this sink belongs to.
    pub fn plugin(&self) -> PluginId {
        self.plugin
    }

    /// Hand a received frame to the stack without blocking.
    pub fn deliver(&self, bytes: Vec<u8>) -> Result<(), PluginError> {
        self.tx
            .try_send(InboundFrame {
                plugin: self.plugin,
                bytes,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PluginError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PluginError::Detached,
            })
    }
}

/// A physical medium.
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Medium served by this plugin.
    fn if_type(&self) -> IfType;

    /// Connect the plugin's receive path to the stack.
    fn attach(&self, sink: FrameSink);

    /// Send one frame. `dest` is a hint; broadcast mediums may ignore it.
    fn transmit(&self, frame: &[u8], dest: PeerId) -> Result<(), PluginError>;
}

/// The plugins attached to a stack.
#[derive(Debug, Clone, Default)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin, returning its id.
    pub fn push(&mut self, plugin: Arc<dyn Plugin>) -> PluginId {
        self.plugins.push(plugin);
        PluginId(self.plugins.len() - 1)
    }

    /// Attach every plugin to the inbound channel.
    pub fn attach_all(&self, tx: &mpsc::Sender<InboundFrame>) {
        for (i, plugin) in self.plugins.iter().enumerate() {
            plugin.attach(FrameSink::new(PluginId(i), tx.clone()));
        }
    }

    /// Number of plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Send a frame on every plugin serving `if_type`.
    ///
    /// Succeeds if at least one plugin accepted the frame.
    pub fn transmit(&self, if_type: IfType, frame: &[u8], dest: PeerId) -> TransceiverResult<()> {
        let mut last_error = None;
        let mut delivered = false;

        for plugin in self.plugins.iter().filter(|p| p.if_type() == if_type) {
            match plugin.transmit(frame, dest) {
                Ok(()) => delivered = true,
                Err(e) => {
                    tracing::debug!(?if_type, error = %e, "plugin transmit failed");
                    last_error = Some(e);
                }
            }
        }

        match (delivered, last_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e.into()),
            (false, None) => Err(TransceiverError::NoPlugin(if_type)),
        }
    }
}
