//! In-memory broadcast medium.
//!
//! Every port hears every frame sent by the other ports, like nodes sharing
//! one radio channel. Links can be cut in either direction to inject loss.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::PluginError;
use super::plugin::{FrameSink, Plugin};
use crate::core::{IfType, PeerId};

#[derive(Debug, Default)]
struct MediumState {
    sinks: Vec<Option<FrameSink>>,
    cut: HashSet<(usize, usize)>,
    frames_sent: u64,
    frames_lost: u64,
}

/// Shared simulated medium.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMedium {
    state: Arc<Mutex<MediumState>>,
}

impl SimulatedMedium {
    /// Create an empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MediumState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a new port on the medium.
    pub fn port(&self) -> SimPort {
        let mut state = self.lock();
        state.sinks.push(None);
        SimPort {
            medium: self.clone(),
            index: state.sinks.len() - 1,
        }
    }

    /// Cut or restore the link from `from` to `to`.
    pub fn set_link(&self, from: &SimPort, to: &SimPort, up: bool) {
        let mut state = self.lock();
        if up {
            state.cut.remove(&(from.index, to.index));
        } else {
            state.cut.insert((from.index, to.index));
        }
    }

    /// Cut or restore every link to and from `port`.
    pub fn set_isolated(&self, port: &SimPort, isolated: bool) {
        let mut state = self.lock();
        for other in 0..state.sinks.len() {
            if other == port.index {
                continue;
            }
            for link in [(port.index, other), (other, port.index)] {
                if isolated {
                    state.cut.insert(link);
                } else {
                    state.cut.remove(&link);
                }
            }
        }
    }

    /// Frames sent and frames lost so far.
    pub fn counters(&self) -> (u64, u64) {
        let state = self.lock();
        (state.frames_sent, state.frames_lost)
    }
}

/// One node's attachment to a [`SimulatedMedium`].
#[derive(Debug, Clone)]
pub struct SimPort {
    medium: SimulatedMedium,
    index: usize,
}

impl Plugin for SimPort {
    fn if_type(&self) -> IfType {
        IfType::Sim
    }

    fn attach(&self, sink: FrameSink) {
        let mut state = self.medium.lock();
        state.sinks[self.index] = Some(sink);
    }

    fn transmit(&self, frame: &[u8], _dest: PeerId) -> Result<(), PluginError> {
        let mut state = self.medium.lock();
        state.frames_sent += 1;

        let mut lost = 0;
        for (index, sink) in state.sinks.iter().enumerate() {
            if index == self.index {
                continue;
            }
            let Some(sink) = sink else { continue };
            if state.cut.contains(&(self.index, index)) {
                lost += 1;
                continue;
            }
            if let Err(e) = sink.deliver(frame.to_vec()) {
                tracing::trace!(port = index, error = %e, "simulated delivery dropped");
                lost += 1;
            }
        }
        state.frames_lost += lost;
        Ok(())
    }
}
