//! SOOlink service.
//!
//! [`Soolink`] assembles one node's stack: plugins feed a receive worker,
//! the transceiver hands envelopes to the datalink, Winenet arbitrates the
//! shared channel, and requesters talk to it through [`SlDesc`] descriptors.

mod descriptor;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use descriptor::{Block, DescStats, SlDesc};
pub use registry::Registry;

use crate::config::SoolinkConfig;
use crate::core::{IfType, PeerId, ReqType, SoolinkError, SoolinkResult, TransMode};
use crate::datalink::winenet::{self, WinenetHandle, WinenetIo, WinenetSnapshot, WinenetState};
use crate::datalink::{Datalink, DatalinkError};
use crate::transceiver::{
    InboundFrame, Plugin, PluginSet, Receiver, Sender, Transceiver, TransceiverError,
};
use crate::transcoder::Coder;

/// A running SOOlink node.
#[derive(Debug)]
pub struct Soolink {
    local: PeerId,
    coder: Coder,
    transceiver: Transceiver,
    registry: Arc<Registry>,
    tasks: Mutex<Tasks>,
}

#[derive(Debug, Default)]
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    winenet: Option<JoinHandle<()>>,
    stopped: bool,
}

impl Soolink {
    /// Validate `config`, attach `plugins` and start the node's tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: SoolinkConfig, plugins: Vec<Arc<dyn Plugin>>) -> SoolinkResult<Self> {
        config.validate()?;
        let local = config.local_id;

        let mut set = PluginSet::new();
        for plugin in plugins {
            set.push(plugin);
        }
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        set.attach_all(&inbound_tx);

        let sender = Arc::new(Sender::new(set));
        let receiver = Arc::new(Receiver::new(config.decode_block_timeout));
        let registry = Arc::new(Registry::new(config.max_ready_blocks));

        let winenet_if = config.winenet.interface;
        let (handle, winenet_task) = winenet::spawn(
            local,
            config.winenet.clone(),
            WinenetIo {
                sender: Arc::clone(&sender),
                receiver: Arc::clone(&receiver),
                registry: Arc::clone(&registry),
            },
        );
        let datalink = Datalink::new(sender, Arc::clone(&receiver), Some(handle));
        let transceiver = Transceiver::new(local, datalink, Arc::clone(&registry));

        // Beacons travel under the datalink requester on the arbitrated route.
        registry
            .register(ReqType::Datalink, winenet_if, TransMode::Unibroad)
            .await?;

        let rx_worker = tokio::spawn(receive_worker(transceiver.clone(), inbound_rx));
        let watchdog = tokio::spawn(watchdog(config.watchdog_period, receiver));

        tracing::info!(%local, winenet_if = ?winenet_if, "soolink started");
        Ok(Self {
            local,
            coder: Coder::new(config.max_fragment_payload),
            transceiver,
            registry,
            tasks: Mutex::new(Tasks {
                workers: vec![rx_worker, watchdog],
                winenet: Some(winenet_task),
                stopped: false,
            }),
        })
    }

    /// Local identity.
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Register a requester.
    pub async fn register(
        &self,
        req_type: ReqType,
        if_type: IfType,
        trans_mode: TransMode,
    ) -> SoolinkResult<Arc<SlDesc>> {
        self.ensure_running().await?;
        self.registry.register(req_type, if_type, trans_mode).await
    }

    /// Unregister a requester; pending `recv` calls on it return
    /// [`SoolinkError::Shutdown`].
    pub async fn unregister(&self, desc: &SlDesc) -> SoolinkResult<()> {
        self.registry.unregister(desc).await
    }

    /// Send one block.
    ///
    /// `peer` is the destination of a unicast descriptor and ignored for the
    /// broadcast-like modes; a unicast send without one is refused. An empty `data` is the end-of-stream signal. A
    /// block abandoned by the datalink is counted on the descriptor and
    /// reported as sent.
    pub async fn send(
        &self,
        desc: &SlDesc,
        data: &[u8],
        peer: Option<PeerId>,
        priority: u32,
    ) -> SoolinkResult<()> {
        self.ensure_running().await?;
        self.ensure_registered(desc).await?;
        desc.set_priority(priority);

        let dest = match (desc.trans_mode(), peer) {
            (TransMode::Unicast, Some(peer)) if !peer.is_broadcast() => peer,
            (TransMode::Unicast, _) => {
                return Err(SoolinkError::MissingDestination(desc.req_type()));
            }
            _ => PeerId::BROADCAST,
        };

        match self
            .coder
            .encode(&self.transceiver, desc, data, dest)
            .await
        {
            Ok(_) => {
                if !data.is_empty() {
                    desc.record_sent(data.len());
                }
                Ok(())
            }
            Err(e) if e.is_abandoned() => {
                desc.record_abandoned();
                tracing::warn!(req = ?desc.req_type(), len = data.len(), "block abandoned");
                Ok(())
            }
            Err(TransceiverError::Datalink(DatalinkError::NoPeerReachable)) => {
                Err(SoolinkError::NoPeerReachable)
            }
            Err(TransceiverError::Datalink(DatalinkError::Stopped)) => Err(SoolinkError::Shutdown),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the next reassembled block.
    pub async fn recv(&self, desc: &SlDesc) -> SoolinkResult<Vec<u8>> {
        Ok(self.recv_from(desc).await?.data)
    }

    /// Wait for the next reassembled block along with its sender.
    pub async fn recv_from(&self, desc: &SlDesc) -> SoolinkResult<Block> {
        desc.next_block().await.ok_or(SoolinkError::Shutdown)
    }

    /// Discovery found `peer`.
    pub async fn neighbour_added(&self, peer: PeerId) {
        if let Some(winenet) = self.winenet() {
            winenet.neighbour_added(peer).await;
        }
    }

    /// Discovery lost `peer`.
    pub async fn neighbour_removed(&self, peer: PeerId) {
        if let Some(winenet) = self.winenet() {
            winenet.neighbour_removed(peer).await;
        }
    }

    /// Discovery saw `peer` again.
    pub async fn neighbour_updated(&self, peer: PeerId) {
        if let Some(winenet) = self.winenet() {
            winenet.neighbour_updated(peer).await;
        }
    }

    /// Current arbitration state.
    pub fn winenet_state(&self) -> Option<WinenetState> {
        self.winenet().map(WinenetHandle::state)
    }

    /// Full arbitration view.
    pub async fn winenet_snapshot(&self) -> SoolinkResult<WinenetSnapshot> {
        let winenet = self.winenet().ok_or(SoolinkError::Shutdown)?;
        winenet
            .snapshot()
            .await
            .map_err(|_| SoolinkError::Shutdown)
    }

    /// Live descriptors, in registration order.
    pub async fn descriptors(&self) -> Vec<Arc<SlDesc>> {
        self.registry.all().await
    }

    /// Stop every task and close every descriptor.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.stopped {
            return;
        }
        tasks.stopped = true;

        if let Some(winenet) = self.winenet() {
            winenet.shutdown().await;
        }
        for worker in tasks.workers.drain(..) {
            worker.abort();
        }
        if let Some(task) = tasks.winenet.take() {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "winenet task ended abnormally");
            }
        }
        self.registry.clear().await;
        tracing::info!(local = %self.local, "soolink stopped");
    }

    fn winenet(&self) -> Option<&WinenetHandle> {
        self.transceiver.datalink().winenet()
    }

    async fn ensure_running(&self) -> SoolinkResult<()> {
        if self.tasks.lock().await.stopped {
            return Err(SoolinkError::Shutdown);
        }
        Ok(())
    }

    async fn ensure_registered(&self, desc: &SlDesc) -> SoolinkResult<()> {
        match self.registry.find(desc.req_type()).await {
            Some(live) if std::ptr::eq(Arc::as_ptr(&live), desc) => Ok(()),
            _ => Err(SoolinkError::NotRegistered(desc.req_type())),
        }
    }
}

async fn receive_worker(transceiver: Transceiver, mut inbound: mpsc::Receiver<InboundFrame>) {
    while let Some(frame) = inbound.recv().await {
        transceiver.on_frame(frame).await;
    }
}

async fn watchdog(period: Duration, receiver: Arc<Receiver>) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        for (req, peer) in receiver.expire().await {
            tracing::debug!(?req, %peer, "stale partial block dropped");
        }
    }
}
