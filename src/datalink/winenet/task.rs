//! Winenet driver task.
//!
//! Owns the [`Winenet`] state machine. Every input arrives as a [`Command`]
//! on one queue, so the machine is never touched concurrently; the loop
//! sleeps until the next protocol deadline when the queue is quiet.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::fsm::{Action, Winenet, WinenetState, WinenetStats, XmitId};
use crate::config::WinenetConfig;
use crate::core::{IfType, PeerId};
use crate::datalink::DatalinkError;
use crate::soolink::Registry;
use crate::transceiver::{Receiver, RxOutcome, Sender, TransceiverPacket};

type XmitReply = oneshot::Sender<Result<(), DatalinkError>>;

/// Input to the driver task.
#[derive(Debug)]
pub(crate) enum Command {
    Xmit {
        packet: Option<TransceiverPacket>,
        completed: bool,
        reply: XmitReply,
    },
    Rx(TransceiverPacket),
    NeighbourAdded(PeerId),
    NeighbourRemoved(PeerId),
    NeighbourUpdated(PeerId),
    Snapshot(oneshot::Sender<WinenetSnapshot>),
    Shutdown,
}

/// Point-in-time view of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinenetSnapshot {
    /// Current state.
    pub state: WinenetState,
    /// Speaker this node listens to.
    pub bound_speaker: Option<PeerId>,
    /// Neighbours confirmed by ping.
    pub valid_neighbours: Vec<PeerId>,
    /// Counters.
    pub stats: WinenetStats,
}

/// Handle to a running Winenet task.
#[derive(Debug, Clone)]
pub struct WinenetHandle {
    inbox: mpsc::Sender<Command>,
    state: watch::Receiver<WinenetState>,
}

impl WinenetHandle {
    /// Queue one data packet, or end of stream with `None`, and wait for the
    /// datalink to accept it.
    pub async fn xmit(
        &self,
        packet: Option<TransceiverPacket>,
        completed: bool,
    ) -> Result<(), DatalinkError> {
        let (reply, done) = oneshot::channel();
        self.inbox
            .send(Command::Xmit {
                packet,
                completed,
                reply,
            })
            .await
            .map_err(|_| DatalinkError::Stopped)?;
        done.await.map_err(|_| DatalinkError::Stopped)?
    }

    /// Hand a received envelope to the protocol.
    pub async fn rx(&self, packet: TransceiverPacket) {
        self.send(Command::Rx(packet)).await;
    }

    /// Discovery reported a new peer.
    pub async fn neighbour_added(&self, peer: PeerId) {
        self.send(Command::NeighbourAdded(peer)).await;
    }

    /// Discovery lost a peer.
    pub async fn neighbour_removed(&self, peer: PeerId) {
        self.send(Command::NeighbourRemoved(peer)).await;
    }

    /// Discovery saw a known peer again.
    pub async fn neighbour_updated(&self, peer: PeerId) {
        self.send(Command::NeighbourUpdated(peer)).await;
    }

    /// Current protocol state.
    pub fn state(&self) -> WinenetState {
        *self.state.borrow()
    }

    /// Wait until the protocol reaches `target`.
    pub async fn wait_for_state(&self, target: WinenetState) -> Result<(), DatalinkError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| DatalinkError::Stopped)
    }

    /// Full protocol view.
    pub async fn snapshot(&self) -> Result<WinenetSnapshot, DatalinkError> {
        let (reply, snapshot) = oneshot::channel();
        self.inbox
            .send(Command::Snapshot(reply))
            .await
            .map_err(|_| DatalinkError::Stopped)?;
        snapshot.await.map_err(|_| DatalinkError::Stopped)
    }

    /// Stop the task; pending transmissions fail with [`DatalinkError::Stopped`].
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) {
        if self.inbox.send(command).await.is_err() {
            tracing::trace!("winenet task gone, command dropped");
        }
    }
}

/// Collaborators the task drives.
#[derive(Debug, Clone)]
pub struct WinenetIo {
    /// Outbound path.
    pub sender: Arc<Sender>,
    /// Inbound reassembly.
    pub receiver: Arc<Receiver>,
    /// Descriptor lookup for delivery.
    pub registry: Arc<Registry>,
}

/// Start the Winenet task for node `local`.
pub fn spawn(
    local: PeerId,
    config: WinenetConfig,
    io: WinenetIo,
) -> (WinenetHandle, JoinHandle<()>) {
    let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(WinenetState::Init);
    let interface = config.interface;
    let fsm = Winenet::new(local, config);

    let task = tokio::spawn(run(fsm, inbox_rx, io, interface, state_tx));
    let handle = WinenetHandle {
        inbox: inbox_tx,
        state: state_rx,
    };
    (handle, task)
}

async fn run(
    mut fsm: Winenet,
    mut inbox: mpsc::Receiver<Command>,
    io: WinenetIo,
    interface: IfType,
    state: watch::Sender<WinenetState>,
) {
    let mut waiters: HashMap<XmitId, XmitReply> = HashMap::new();
    let mut next_id = 0u64;
    tracing::debug!(local = %fsm.local(), ?interface, "winenet started");

    loop {
        let deadline = fsm.next_deadline();
        tokio::select! {
            command = inbox.recv() => {
                let now = Instant::now();
                match command {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::Xmit { packet, completed, reply }) => {
                        let id = XmitId(next_id);
                        next_id += 1;
                        waiters.insert(id, reply);
                        fsm.xmit(id, packet, completed, now);
                    }
                    Some(Command::Rx(packet)) => fsm.on_packet(packet, now),
                    Some(Command::NeighbourAdded(peer)) => fsm.neighbour_added(peer, now),
                    Some(Command::NeighbourRemoved(peer)) => fsm.neighbour_removed(peer, now),
                    Some(Command::NeighbourUpdated(peer)) => fsm.neighbour_updated(peer, now),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(WinenetSnapshot {
                            state: fsm.state(),
                            bound_speaker: fsm.bound_speaker(),
                            valid_neighbours: fsm.neighbours().valid_ids(),
                            stats: fsm.stats(),
                        });
                    }
                }
            }
            _ = sleep_until_deadline(deadline) => fsm.on_timer(Instant::now()),
        }

        flush(&mut fsm, &io, interface, &mut waiters).await;
        let current = fsm.state();
        state.send_if_modified(|s| {
            let changed = *s != current;
            *s = current;
            changed
        });
    }

    for (_, reply) in waiters.drain() {
        let _ = reply.send(Err(DatalinkError::Stopped));
    }
    tracing::debug!(local = %fsm.local(), "winenet stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Carry out every action the machine produced, including those produced
/// while carrying them out.
async fn flush(
    fsm: &mut Winenet,
    io: &WinenetIo,
    interface: IfType,
    waiters: &mut HashMap<XmitId, XmitReply>,
) {
    while let Some(action) = fsm.poll_action() {
        match action {
            Action::Transmit(packet) => {
                if let Err(e) = io.sender.tx(interface, &packet).await {
                    tracing::debug!(dest = %packet.dest, error = %e, "transmission failed");
                }
            }
            Action::Deliver(packet) => {
                let Some(desc) = io.registry.find(packet.requester).await else {
                    tracing::trace!(req = ?packet.requester, "no requester for delivered packet");
                    continue;
                };
                // A block refused by one requester leaves the speaker binding alone.
                if io.receiver.rx(&desc, &packet).await == RxOutcome::Discarded {
                    io.receiver.cancel_block(desc.req_type(), packet.source).await;
                }
            }
            Action::CancelRx(peer) => {
                io.receiver.cancel(peer).await;
            }
            Action::XmitDone { id, result } => {
                if let Some(reply) = waiters.remove(&id) {
                    let _ = reply.send(result);
                }
            }
        }
    }
}
