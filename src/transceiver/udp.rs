//! UDP datagram plugin.
//!
//! Each envelope travels as one datagram to every configured peer address,
//! giving a broadcast medium over an IP network.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::error::PluginError;
use super::plugin::{FrameSink, Plugin};
use crate::core::{IfType, PeerId};

/// Default receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// UDP plugin.
#[derive(Debug)]
pub struct UdpPlugin {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Clone of the socket used for non-async sends.
    send_socket: std::net::UdpSocket,
    /// Where outbound frames go.
    peers: Mutex<Vec<SocketAddr>>,
    /// Medium reported to the stack.
    if_type: IfType,
    /// Receive buffer size.
    recv_buffer_size: usize,
    /// Receive loop, once attached.
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpPlugin {
    /// Create a UDP plugin bound to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        UdpPluginBuilder::new().bind(addr).await
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Add a peer address to the outbound set.
    pub fn add_peer(&self, addr: SocketAddr) {
        let mut peers = self.peers.lock().unwrap_or_else(|p| p.into_inner());
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }

    /// Remove a peer address from the outbound set.
    pub fn remove_peer(&self, addr: SocketAddr) {
        let mut peers = self.peers.lock().unwrap_or_else(|p| p.into_inner());
        peers.retain(|p| *p != addr);
    }
}

impl Plugin for UdpPlugin {
    fn if_type(&self) -> IfType {
        self.if_type
    }

    fn attach(&self, sink: FrameSink) {
        let socket = Arc::clone(&self.socket);
        let mut buf = vec![0u8; self.recv_buffer_size];

        let handle = tokio::spawn(async move {
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp receive failed");
                        continue;
                    }
                };
                match sink.deliver(buf[..len].to_vec()) {
                    Ok(()) => {}
                    Err(PluginError::Detached) => break,
                    Err(e) => tracing::trace!(%from, error = %e, "udp frame dropped"),
                }
            }
        });

        let mut task = self.recv_task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = task.replace(handle) {
            old.abort();
        }
    }

    fn transmit(&self, frame: &[u8], _dest: PeerId) -> Result<(), PluginError> {
        let peers = self.peers.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for peer in peers {
            match self.send_socket.send_to(frame, peer) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tracing::trace!(%peer, "udp send would block, frame dropped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for UdpPlugin {
    fn drop(&mut self) {
        let task = self.recv_task.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

/// Builder for creating UDP plugins with custom options.
#[derive(Debug, Clone)]
pub struct UdpPluginBuilder {
    recv_buffer_size: usize,
    if_type: IfType,
    peers: Vec<SocketAddr>,
}

impl Default for UdpPluginBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpPluginBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            if_type: IfType::Eth,
            peers: Vec::new(),
        }
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Set the medium reported to the stack.
    pub fn if_type(mut self, if_type: IfType) -> Self {
        self.if_type = if_type;
        self
    }

    /// Add a peer address.
    pub fn peer(mut self, addr: SocketAddr) -> Self {
        self.peers.push(addr);
        self
    }

    /// Bind the plugin.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<UdpPlugin> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let send_socket = std_socket.try_clone()?;
        let socket = UdpSocket::from_std(std_socket)?;
        Ok(UdpPlugin {
            socket: Arc::new(socket),
            send_socket,
            peers: Mutex::new(self.peers),
            if_type: self.if_type,
            recv_buffer_size: self.recv_buffer_size,
            recv_task: Mutex::new(None),
        })
    }
}
