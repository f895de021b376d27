//! Winenet state machine.
//!
//! The machine performs no I/O. The owner feeds it events (received packets,
//! transmission requests, discovery signals, timer expiries) together with
//! the current instant, then drains the resulting [`Action`]s and arms a
//! timer for [`Winenet::next_deadline`].
//!
//! ```text
//!            first neighbour
//!   INIT ─────────────────────► IDLE ◄──────────────┐
//!                                │  ▲               │ GO_SPEAKER sent
//!         BROADCAST_SPEAKER      │  │ GO_SPEAKER    │
//!                 ┌──────────────┘  │ to another    │
//!                 ▼                 │               │
//!             LISTENER ─────────────┘           SPEAKER
//!                 │      GO_SPEAKER to us           ▲
//!                 └─────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::mem;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::time::Instant;

use super::beacon::{AckStatus, Beacon, BeaconBody, HandoffCause, PingKind, SpeakerCause};
use super::neighbour::NeighbourTable;
use super::retry::{AckWait, RetryEvent, RetryPolicy};
use crate::config::WinenetConfig;
use crate::core::PeerId;
use crate::datalink::DatalinkError;
use crate::transceiver::{PacketKind, TransId, TransceiverPacket};

/// Protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WinenetState {
    /// Startup, no neighbour known yet.
    Init,
    /// No active speaker bound; candidate listener.
    Idle,
    /// This node owns the channel.
    Speaker,
    /// Another node owns the channel; its fragments are consumed here.
    Listener,
}

/// Identifies one transmission request awaiting completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XmitId(pub u64);

/// Work the owner must perform on the machine's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send an envelope on the medium.
    Transmit(TransceiverPacket),
    /// Hand a received data envelope to the receiver.
    Deliver(TransceiverPacket),
    /// Drop any reassembly in progress from this peer.
    CancelRx(PeerId),
    /// Complete a transmission request.
    XmitDone {
        /// Request being completed.
        id: XmitId,
        /// Outcome.
        result: Result<(), DatalinkError>,
    },
}

/// Protocol counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WinenetStats {
    /// Retransmitted beacons and batches.
    pub retransmissions: u64,
    /// Beacons and packets recognised as already processed.
    pub duplicates: u64,
    /// Blocks fully acknowledged by every listener.
    pub blocks_sent: u64,
    /// Blocks abandoned after retry exhaustion or a producer stall.
    pub blocks_abandoned: u64,
    /// Token handoffs accepted by the next speaker.
    pub handoffs: u64,
    /// Neighbours invalidated for not answering.
    pub neighbours_invalidated: u64,
    /// Batches delivered to the receiver.
    pub frames_delivered: u64,
    /// Reassemblies cancelled because the speaker changed.
    pub rx_cancelled: u64,
}

/// Packets acknowledged together.
#[derive(Debug, Clone)]
struct Frame {
    packets: Vec<TransceiverPacket>,
    waiter: Option<XmitId>,
    last_of_block: bool,
}

/// Speaker activity.
#[derive(Debug)]
enum Phase {
    /// Not speaking.
    Off,
    /// Speaking, nothing in flight.
    Holding { until: Instant },
    /// Announcing to one neighbour at a time.
    Announcing {
        pending: VecDeque<PeerId>,
        wait: AckWait,
    },
    /// Sending the front frame to one listener at a time.
    Sending {
        remaining: VecDeque<PeerId>,
        wait: AckWait,
    },
}

/// Listener-side batch tracking.
#[derive(Debug, Default)]
struct RxWindow {
    expected: Option<u32>,
    frame_first: Option<u32>,
    buffer: Vec<TransceiverPacket>,
}

/// Winenet protocol context for one node.
#[derive(Debug)]
pub struct Winenet {
    local: PeerId,
    config: WinenetConfig,
    policy: RetryPolicy,
    state: WinenetState,
    prev_state: WinenetState,
    neighbours: NeighbourTable,

    bound: Option<PeerId>,
    last_bound: Option<PeerId>,
    rx: RxWindow,

    beacon_seq: u32,
    data_seq: u32,
    open_frame: Vec<TransceiverPacket>,
    outbox: VecDeque<Frame>,
    eos_waiters: Vec<XmitId>,
    mid_block: bool,
    /// The open block was abandoned; its remaining packets are refused.
    rejecting: bool,

    phase: Phase,
    listeners: Vec<PeerId>,
    announced: bool,
    /// GO_SPEAKER awaiting its acknowledgment.
    handoff: Option<AckWait>,
    idle_deadline: Option<Instant>,

    rng: StdRng,
    actions: VecDeque<Action>,
    stats: WinenetStats,
}

/// Whether `packet` can only come from a node holding or passing the token.
fn shows_speaker(packet: &TransceiverPacket) -> bool {
    match packet.kind {
        PacketKind::Data => true,
        PacketKind::Datalink => Beacon::decode(&packet.payload).is_ok_and(|b| {
            b.sender == packet.source
                && matches!(
                    b.body,
                    BeaconBody::BroadcastSpeaker(SpeakerCause::Announce)
                        | BeaconBody::GoSpeaker { .. }
                )
        }),
    }
}

impl Winenet {
    /// Create the context for node `local`.
    pub fn new(local: PeerId, config: WinenetConfig) -> Self {
        let policy = RetryPolicy {
            max_attempts: config.retries_max.max(1),
            ack_timeout: config.ack_timeout,
            min_backoff: config.min_drand,
            max_backoff: config.max_drand,
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ local.get()),
            None => StdRng::from_entropy(),
        };

        Self {
            local,
            config,
            policy,
            state: WinenetState::Init,
            prev_state: WinenetState::Init,
            neighbours: NeighbourTable::new(),
            bound: None,
            last_bound: None,
            rx: RxWindow::default(),
            beacon_seq: 0,
            data_seq: 0,
            open_frame: Vec::new(),
            outbox: VecDeque::new(),
            eos_waiters: Vec::new(),
            mid_block: false,
            rejecting: false,
            phase: Phase::Off,
            listeners: Vec::new(),
            announced: false,
            handoff: None,
            idle_deadline: None,
            rng,
            actions: VecDeque::new(),
            stats: WinenetStats::default(),
        }
    }

    /// Local identity.
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Current state.
    pub fn state(&self) -> WinenetState {
        self.state
    }

    /// State before the last transition.
    pub fn prev_state(&self) -> WinenetState {
        self.prev_state
    }

    /// Speaker this node listens to.
    pub fn bound_speaker(&self) -> Option<PeerId> {
        self.bound
    }

    /// Neighbour table.
    pub fn neighbours(&self) -> &NeighbourTable {
        &self.neighbours
    }

    /// Protocol counters.
    pub fn stats(&self) -> WinenetStats {
        self.stats
    }

    /// Retry parameters in use.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Next pending action.
    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Earliest instant at which [`Winenet::on_timer`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let phase = match &self.phase {
            Phase::Off => None,
            Phase::Holding { until } => Some(*until),
            Phase::Announcing { wait, .. } | Phase::Sending { wait, .. } => {
                Some(wait.next_deadline())
            }
        };
        let handoff = self.handoff.as_ref().map(AckWait::next_deadline);

        [phase, handoff, self.idle_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    // =========================================================================
    // Discovery signals
    // =========================================================================

    /// A peer appeared in discovery.
    pub fn neighbour_added(&mut self, peer: PeerId, now: Instant) {
        if peer == self.local {
            return;
        }
        self.leave_init();
        if self.neighbours.insert(peer) {
            tracing::debug!(local = %self.local, %peer, "neighbour added");
            if self.local < peer {
                self.send_ping(peer, now);
            }
        } else if !self.neighbours.is_valid(peer) {
            self.send_ping(peer, now);
        }
    }

    /// A known peer was seen again by discovery.
    pub fn neighbour_updated(&mut self, peer: PeerId, now: Instant) {
        if peer == self.local {
            return;
        }
        if !self.neighbours.is_valid(peer) {
            self.neighbours_insert_quiet(peer);
            self.send_ping(peer, now);
        }
    }

    /// A peer disappeared from discovery.
    pub fn neighbour_removed(&mut self, peer: PeerId, now: Instant) {
        if self.neighbours.remove(peer).is_none() {
            return;
        }
        tracing::debug!(local = %self.local, %peer, "neighbour removed");

        if self.bound == Some(peer) {
            self.cancel_peer(peer);
            self.unbind();
            self.set_state(WinenetState::Idle);
        }
        if self.last_bound == Some(peer) {
            self.last_bound = None;
        }
        self.listeners.retain(|id| *id != peer);

        if !self.neighbours.has_valid() {
            self.lost_all_neighbours();
        } else {
            self.arm_idle(now);
        }
    }

    // =========================================================================
    // Transmission requests
    // =========================================================================

    /// Queue one data packet for transmission, or signal end of stream with `None`.
    ///
    /// Completion is reported through [`Action::XmitDone`] with the same id:
    /// immediately if the packet only joined an open batch, otherwise once the
    /// batch is acknowledged by every listener.
    pub fn xmit(
        &mut self,
        id: XmitId,
        packet: Option<TransceiverPacket>,
        completed: bool,
        now: Instant,
    ) {
        let Some(mut packet) = packet else {
            if !self.open_frame.is_empty() {
                self.close_frame(None, false);
            }
            if self.state == WinenetState::Speaker || !self.outbox.is_empty() {
                self.eos_waiters.push(id);
                self.drive(now);
            } else {
                self.done(id, Ok(()));
            }
            return;
        };

        if self.rejecting {
            if completed {
                self.rejecting = false;
            }
            self.done(id, Err(DatalinkError::Abandoned));
            return;
        }
        if !self.neighbours.has_valid() {
            self.done(id, Err(DatalinkError::NoPeerReachable));
            return;
        }

        let seq = self.data_seq;
        self.data_seq = TransId::next_seq(seq);
        let mut trans_id = TransId::new(seq);
        if completed {
            trans_id = trans_id.with_last();
        }
        packet.trans_id = trans_id;
        packet.source = self.local;
        self.open_frame.push(packet);
        self.mid_block = !completed;

        if completed || self.open_frame.len() >= self.config.packets_per_frame.max(1) {
            self.close_frame(Some(id), completed);
        } else {
            self.done(id, Ok(()));
        }
        self.drive(now);
    }

    // =========================================================================
    // Reception
    // =========================================================================

    /// Process an envelope received from the medium.
    ///
    /// Envelopes addressed to other nodes are only inspected for signs of a
    /// live speaker, which keep the silence timer from expiring.
    pub fn on_packet(&mut self, packet: TransceiverPacket, now: Instant) {
        if packet.source == self.local {
            return;
        }
        if shows_speaker(&packet) {
            self.touch(now);
        }
        if !packet.is_for(self.local) {
            return;
        }
        match packet.kind {
            PacketKind::Datalink => match Beacon::decode(&packet.payload) {
                Ok(beacon) if beacon.sender == packet.source => self.on_beacon(beacon, now),
                Ok(_) => tracing::trace!(from = %packet.source, "beacon sender mismatch"),
                Err(e) => tracing::trace!(from = %packet.source, error = %e, "malformed beacon"),
            },
            PacketKind::Data => self.on_data(packet, now),
        }
    }

    fn on_beacon(&mut self, beacon: Beacon, now: Instant) {
        let from = beacon.sender;
        self.leave_init();
        if self.neighbours.insert(from) {
            tracing::debug!(local = %self.local, peer = %from, "neighbour discovered by beacon");
            if self.local < from {
                self.send_ping(from, now);
            }
        }

        if let BeaconBody::Ping(kind) = beacon.body {
            self.on_ping(from, beacon.seq, kind, now);
            return;
        }

        if !self.neighbours.is_valid(from) {
            tracing::trace!(local = %self.local, peer = %from, "beacon from unvalidated neighbour");
            self.send_ping(from, now);
            return;
        }

        let Some(neighbour) = self.neighbours.get_mut(from) else {
            return;
        };
        if neighbour.is_duplicate(beacon.seq) {
            self.stats.duplicates += 1;
            let replay = neighbour.last_trans_id == Some(beacon.seq);
            let last_ack = neighbour.last_ack;
            let wants_ack = match beacon.body {
                BeaconBody::BroadcastSpeaker(SpeakerCause::Announce) => true,
                BeaconBody::GoSpeaker { target, .. } => target == self.local,
                _ => false,
            };
            if let (true, true, Some(status)) = (replay, wants_ack, last_ack) {
                self.send_ack(from, status, beacon.seq);
            }
            return;
        }
        neighbour.last_trans_id = Some(beacon.seq);
        self.touch(now);

        match beacon.body {
            BeaconBody::BroadcastSpeaker(SpeakerCause::Announce) => {
                self.on_announce(from, beacon.seq, now)
            }
            BeaconBody::BroadcastSpeaker(SpeakerCause::Release) => self.on_release(from),
            BeaconBody::GoSpeaker { target, cause } => {
                self.on_go_speaker(from, beacon.seq, target, cause, now)
            }
            BeaconBody::Ack { status, acked } => self.on_ack(from, status, acked, now),
            BeaconBody::Ping(_) => {}
        }
    }

    fn on_ping(&mut self, from: PeerId, seq: u32, kind: PingKind, now: Instant) {
        if let Some(n) = self.neighbours.get_mut(from) {
            n.last_trans_id = Some(seq);
            n.last_ack = None;
        }
        let newly_valid = self.neighbours.set_valid(from, true);

        if kind == PingKind::Request {
            self.send_beacon(from, BeaconBody::Ping(PingKind::Response));
        }
        if newly_valid {
            tracing::debug!(local = %self.local, peer = %from, "neighbour valid");
            self.touch(now);
        }
    }

    fn on_announce(&mut self, from: PeerId, seq: u32, now: Instant) {
        if self.state == WinenetState::Speaker {
            tracing::debug!(local = %self.local, peer = %from, "announcement while speaking, refusing");
            self.send_ack(from, AckStatus::Abort, seq);
            return;
        }
        if self.handoff.as_ref().is_some_and(|h| h.peer == from) {
            self.handoff = None;
            self.stats.handoffs += 1;
        }

        self.bind(from);
        self.set_state(WinenetState::Listener);
        self.send_ack(from, AckStatus::Ok, seq);
        self.touch(now);
    }

    fn on_release(&mut self, from: PeerId) {
        if self.bound == Some(from) {
            tracing::debug!(local = %self.local, peer = %from, "speaker released us");
            self.cancel_peer(from);
            self.unbind();
            self.last_bound = None;
            self.set_state(WinenetState::Idle);
        }
    }

    fn on_go_speaker(
        &mut self,
        from: PeerId,
        seq: u32,
        target: PeerId,
        cause: HandoffCause,
        now: Instant,
    ) {
        self.neighbours.mark_processed(target);
        if self.handoff.as_ref().is_some_and(|h| h.peer == from) {
            // The node we handed the token to is already passing it on.
            self.handoff = None;
            self.stats.handoffs += 1;
        }

        if target == self.local {
            if self.state == WinenetState::Speaker {
                self.send_ack(from, AckStatus::Abort, seq);
                return;
            }
            self.leave_speaker_of(from, cause);
            self.send_ack(from, AckStatus::Ok, seq);
            self.handoff = None;
            self.become_speaker(now);
            return;
        }

        if self.state == WinenetState::Speaker {
            tracing::trace!(local = %self.local, peer = %from, "foreign handoff while speaking");
            return;
        }
        self.leave_speaker_of(from, cause);
        self.set_state(WinenetState::Idle);
        self.arm_idle(now);
    }

    /// Unbind on a handoff by `from`, cancelling reassembly if the turn
    /// ended abnormally or the previous speaker was someone else.
    fn leave_speaker_of(&mut self, from: PeerId, cause: HandoffCause) {
        if let Some(previous) = self.bound.or(self.last_bound) {
            if previous != from || cause == HandoffCause::Abandoned {
                self.cancel_peer(previous);
            }
        }
        self.unbind();
        self.last_bound = None;
    }

    fn on_ack(&mut self, from: PeerId, status: AckStatus, acked: u32, now: Instant) {
        if self.handoff.as_ref().is_some_and(|h| h.matches(from, acked)) {
            self.handoff = None;
            match status {
                AckStatus::Ok => {
                    self.stats.handoffs += 1;
                    tracing::debug!(local = %self.local, peer = %from, "handoff accepted");
                }
                AckStatus::Abort => {
                    tracing::debug!(local = %self.local, peer = %from, "handoff refused");
                }
            }
            return;
        }

        match &mut self.phase {
            Phase::Announcing { pending, wait } if wait.matches(from, acked) => {
                let pending = mem::take(pending);
                match status {
                    AckStatus::Ok => {
                        self.listeners.push(from);
                        self.announce_next(pending, now);
                    }
                    AckStatus::Abort => self.yield_turn(now),
                }
            }
            Phase::Sending { remaining, wait } if wait.matches(from, acked) => {
                let remaining = mem::take(remaining);
                if status == AckStatus::Abort {
                    self.listeners.retain(|id| *id != from);
                }
                self.send_frame_to_next(remaining, now);
            }
            _ => {
                tracing::trace!(local = %self.local, peer = %from, acked, "unexpected acknowledgment");
            }
        }
    }

    fn on_data(&mut self, packet: TransceiverPacket, now: Instant) {
        let from = packet.source;
        if self.state != WinenetState::Listener || self.bound != Some(from) {
            tracing::trace!(local = %self.local, peer = %from, "data from unpaired peer dropped");
            return;
        }
        self.touch(now);

        let id = packet.trans_id;
        let seq = id.seq();
        if let Some(expected) = self.rx.expected {
            if TransId::seq_before(seq, expected) {
                self.stats.duplicates += 1;
                if id.is_frame_end() && self.rx.buffer.is_empty() {
                    self.send_ack(from, AckStatus::Ok, seq);
                }
                return;
            }
            if seq != expected {
                tracing::debug!(
                    local = %self.local,
                    peer = %from,
                    expected,
                    got = seq,
                    "transaction chain broken, awaiting retransmission"
                );
                self.rx.buffer.clear();
                if let Some(first) = self.rx.frame_first.take() {
                    self.rx.expected = Some(first);
                }
                return;
            }
        }

        if self.rx.buffer.is_empty() {
            self.rx.frame_first = Some(seq);
        }
        self.rx.expected = Some(TransId::next_seq(seq));
        self.rx.buffer.push(packet);

        if id.is_frame_end() {
            for packet in self.rx.buffer.drain(..) {
                self.actions.push_back(Action::Deliver(packet));
            }
            self.rx.frame_first = None;
            self.stats.frames_delivered += 1;
            self.send_ack(from, AckStatus::Ok, seq);
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Process every timer due at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        if let Some(handoff) = self.handoff.as_mut() {
            match handoff.poll(&self.policy, &mut self.rng, now) {
                RetryEvent::Resend => {
                    let packets = handoff.packets.clone();
                    self.stats.retransmissions += 1;
                    self.emit_all(packets);
                }
                RetryEvent::Failed => self.handoff_failed(),
                RetryEvent::Idle | RetryEvent::BackingOff => {}
            }
        }

        match &mut self.phase {
            Phase::Off => {}
            Phase::Holding { until } => {
                if now >= *until {
                    self.hold_expired(now);
                }
            }
            Phase::Announcing { pending, wait } => {
                match wait.poll(&self.policy, &mut self.rng, now) {
                    RetryEvent::Resend => {
                        let packets = wait.packets.clone();
                        self.stats.retransmissions += 1;
                        self.emit_all(packets);
                    }
                    RetryEvent::Failed => {
                        let peer = wait.peer;
                        let pending = mem::take(pending);
                        self.invalidate(peer, "announcement");
                        self.announce_next(pending, now);
                    }
                    RetryEvent::Idle | RetryEvent::BackingOff => {}
                }
            }
            Phase::Sending { wait, .. } => match wait.poll(&self.policy, &mut self.rng, now) {
                RetryEvent::Resend => {
                    let packets = wait.packets.clone();
                    self.stats.retransmissions += 1;
                    tracing::debug!(
                        local = %self.local,
                        peer = %wait.peer,
                        attempt = wait.attempts(),
                        "retransmitting batch"
                    );
                    self.emit_all(packets);
                }
                RetryEvent::Failed => self.abandon_block(now),
                RetryEvent::Idle | RetryEvent::BackingOff => {}
            },
        }

        if self.idle_deadline.is_some_and(|d| now >= d) {
            self.idle_expired(now);
        }
    }

    fn idle_expired(&mut self, now: Instant) {
        self.idle_deadline = None;
        if self.state == WinenetState::Speaker {
            return;
        }
        if let Some(peer) = self.bound {
            tracing::debug!(local = %self.local, %peer, "speaker silent, unpairing");
            self.cancel_peer(peer);
            self.unbind();
            self.last_bound = None;
            self.set_state(WinenetState::Idle);
        }

        if self.handoff.is_none()
            && self.neighbours.has_valid()
            && self.neighbours.is_lowest(self.local)
        {
            tracing::info!(local = %self.local, "channel silent, claiming speaker role");
            self.become_speaker(now);
            return;
        }

        // Lower peers should have claimed the channel; confirm they are alive.
        let lower: Vec<PeerId> = self
            .neighbours
            .valid_ids()
            .into_iter()
            .filter(|id| *id < self.local)
            .collect();
        for peer in lower {
            self.neighbours.set_valid(peer, false);
            self.send_ping(peer, now);
        }
        self.arm_idle(now);
    }

    fn hold_expired(&mut self, now: Instant) {
        if !self.mid_block {
            self.hand_off(HandoffCause::Completed, now);
            return;
        }
        tracing::warn!(local = %self.local, "producer stalled mid-block, abandoning block");
        self.stats.blocks_abandoned += 1;
        self.open_frame.clear();
        self.mid_block = false;
        self.rejecting = true;
        self.hand_off(HandoffCause::Abandoned, now);
    }

    // =========================================================================
    // Speaker
    // =========================================================================

    fn become_speaker(&mut self, now: Instant) {
        if self.state == WinenetState::Speaker {
            return;
        }
        self.set_state(WinenetState::Speaker);
        self.unbind();
        self.idle_deadline = None;
        self.listeners.clear();
        self.announced = false;
        self.phase = Phase::Holding {
            until: now + self.hold_time(),
        };
        self.drive(now);
    }

    fn hold_time(&self) -> std::time::Duration {
        if self.mid_block && self.outbox.is_empty() {
            self.config.stall_timeout
        } else {
            self.config.token_hold
        }
    }

    /// Start the next exchange if the speaker is between exchanges.
    fn drive(&mut self, now: Instant) {
        if self.state != WinenetState::Speaker || !matches!(self.phase, Phase::Holding { .. }) {
            return;
        }
        if !self.outbox.is_empty() {
            if self.announced && !self.listeners.is_empty() {
                let remaining: VecDeque<PeerId> = self.listeners.iter().copied().collect();
                self.send_frame_to_next(remaining, now);
            } else {
                let pending: VecDeque<PeerId> = self.neighbours.valid_ids().into();
                self.listeners.clear();
                self.announce_next(pending, now);
            }
        } else if !self.eos_waiters.is_empty() {
            self.hand_off(HandoffCause::Completed, now);
        }
    }

    fn announce_next(&mut self, mut pending: VecDeque<PeerId>, now: Instant) {
        while let Some(peer) = pending.pop_front() {
            if !self.neighbours.is_valid(peer) {
                continue;
            }
            let (seq, packet) =
                self.beacon_packet(peer, BeaconBody::BroadcastSpeaker(SpeakerCause::Announce));
            self.emit(packet.clone());
            self.phase = Phase::Announcing {
                pending,
                wait: AckWait::start(peer, seq, vec![packet], &self.policy, now),
            };
            return;
        }

        self.announced = true;
        if self.listeners.is_empty() {
            if self.neighbours.has_valid() {
                self.hand_off(HandoffCause::Completed, now);
            } else {
                self.lost_all_neighbours();
            }
            return;
        }
        tracing::debug!(local = %self.local, listeners = self.listeners.len(), "speaker announced");
        self.phase = Phase::Holding { until: now };
        self.drive(now);
    }

    fn send_frame_to_next(&mut self, mut remaining: VecDeque<PeerId>, now: Instant) {
        let Some(frame) = self.outbox.front() else {
            self.phase = Phase::Holding {
                until: now + self.hold_time(),
            };
            return;
        };

        while let Some(peer) = remaining.pop_front() {
            if !self.listeners.contains(&peer) {
                continue;
            }
            let packets: Vec<TransceiverPacket> = frame
                .packets
                .iter()
                .cloned()
                .map(|mut p| {
                    p.dest = peer;
                    p
                })
                .collect();
            let expect = packets.last().map(|p| p.trans_id.seq()).unwrap_or_default();
            self.emit_all(packets.clone());
            self.phase = Phase::Sending {
                remaining,
                wait: AckWait::start(peer, expect, packets, &self.policy, now),
            };
            return;
        }

        if self.listeners.is_empty() {
            // Every listener left during this batch; announce again.
            self.announced = false;
            self.phase = Phase::Holding { until: now };
            self.drive(now);
            return;
        }
        self.frame_done(now);
    }

    fn frame_done(&mut self, now: Instant) {
        if let Some(frame) = self.outbox.pop_front() {
            if let Some(waiter) = frame.waiter {
                self.done(waiter, Ok(()));
            }
            if frame.last_of_block {
                self.stats.blocks_sent += 1;
            }
        }
        self.phase = Phase::Holding {
            until: now + self.hold_time(),
        };
        self.drive(now);
    }

    fn abandon_block(&mut self, now: Instant) {
        tracing::warn!(
            local = %self.local,
            attempts = self.policy.max_attempts,
            "no acknowledgment, abandoning block"
        );
        self.stats.blocks_abandoned += 1;
        if let Some(frame) = self.outbox.pop_front() {
            if let Some(waiter) = frame.waiter {
                self.done(waiter, Err(DatalinkError::Abandoned));
            }
        }
        self.open_frame.clear();
        self.mid_block = false;
        self.hand_off(HandoffCause::Abandoned, now);
    }

    /// Give up an announcement that another speaker refused.
    fn yield_turn(&mut self, now: Instant) {
        tracing::debug!(local = %self.local, "announcement refused, yielding");
        for listener in mem::take(&mut self.listeners) {
            self.send_beacon(listener, BeaconBody::BroadcastSpeaker(SpeakerCause::Release));
        }
        self.phase = Phase::Off;
        self.announced = false;
        self.set_state(WinenetState::Idle);
        self.arm_idle(now);
    }

    fn hand_off(&mut self, cause: HandoffCause, now: Instant) {
        self.phase = Phase::Off;
        self.listeners.clear();
        self.announced = false;
        self.set_state(WinenetState::Idle);
        for waiter in mem::take(&mut self.eos_waiters) {
            self.done(waiter, Ok(()));
        }
        self.start_handoff(cause, now);
        self.arm_idle(now);
    }

    fn start_handoff(&mut self, cause: HandoffCause, now: Instant) {
        let Some(target) = self.neighbours.next_speaker(self.local) else {
            tracing::debug!(local = %self.local, "no neighbour to hand the token to");
            self.handoff = None;
            return;
        };

        let (seq, packet) = self.beacon_packet(
            PeerId::BROADCAST,
            BeaconBody::GoSpeaker { target, cause },
        );
        self.emit(packet.clone());
        tracing::debug!(local = %self.local, %target, ?cause, "handing off speaker role");
        self.handoff = Some(AckWait::start(target, seq, vec![packet], &self.policy, now));
    }

    /// The target never acknowledged GO_SPEAKER.
    ///
    /// It may still have taken the token with only its acknowledgments lost,
    /// so the token is not offered to anyone else. If the target is gone,
    /// silence recovery hands the channel to the lowest valid node.
    fn handoff_failed(&mut self) {
        let Some(wait) = self.handoff.take() else {
            return;
        };
        self.invalidate(wait.peer, "handoff");
        if !self.neighbours.has_valid() {
            self.lost_all_neighbours();
        }
    }

    fn lost_all_neighbours(&mut self) {
        tracing::info!(local = %self.local, "no valid neighbour left");
        for frame in mem::take(&mut self.outbox) {
            if let Some(waiter) = frame.waiter {
                self.done(waiter, Err(DatalinkError::NoPeerReachable));
            }
        }
        for waiter in mem::take(&mut self.eos_waiters) {
            self.done(waiter, Ok(()));
        }
        self.open_frame.clear();
        self.mid_block = false;
        self.phase = Phase::Off;
        self.listeners.clear();
        self.announced = false;
        self.handoff = None;
        self.idle_deadline = None;
        if let Some(peer) = self.bound {
            self.cancel_peer(peer);
        }
        self.unbind();
        self.last_bound = None;
        if self.state != WinenetState::Init {
            self.set_state(WinenetState::Idle);
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn set_state(&mut self, next: WinenetState) {
        if next != self.state {
            tracing::debug!(local = %self.local, from = ?self.state, to = ?next, "state change");
            self.prev_state = self.state;
            self.state = next;
        }
    }

    fn leave_init(&mut self) {
        if self.state == WinenetState::Init {
            self.set_state(WinenetState::Idle);
        }
    }

    fn neighbours_insert_quiet(&mut self, peer: PeerId) {
        self.leave_init();
        self.neighbours.insert(peer);
    }

    fn bind(&mut self, speaker: PeerId) {
        if let Some(previous) = self.bound.or(self.last_bound) {
            if previous != speaker {
                self.cancel_peer(previous);
            }
        }
        if self.bound != Some(speaker) {
            self.rx = RxWindow::default();
        }
        self.bound = Some(speaker);
        self.last_bound = Some(speaker);
    }

    fn unbind(&mut self) {
        self.bound = None;
        self.rx = RxWindow::default();
    }

    fn cancel_peer(&mut self, peer: PeerId) {
        self.stats.rx_cancelled += 1;
        self.actions.push_back(Action::CancelRx(peer));
    }

    fn invalidate(&mut self, peer: PeerId, during: &'static str) {
        if self.neighbours.set_valid(peer, false) {
            tracing::warn!(local = %self.local, %peer, during, "neighbour not answering, invalidated");
            self.stats.neighbours_invalidated += 1;
        }
        self.listeners.retain(|id| *id != peer);
    }

    /// Reset the silence timer.
    fn touch(&mut self, now: Instant) {
        if matches!(self.state, WinenetState::Idle | WinenetState::Listener)
            && self.neighbours.has_valid()
        {
            self.idle_deadline = Some(now + self.config.listener_timeout);
        }
    }

    /// Start the silence timer if it is not running.
    fn arm_idle(&mut self, now: Instant) {
        if self.idle_deadline.is_none() {
            self.touch(now);
        }
    }

    fn close_frame(&mut self, waiter: Option<XmitId>, last_of_block: bool) {
        let mut packets = mem::take(&mut self.open_frame);
        if let Some(last) = packets.last_mut() {
            last.trans_id = last.trans_id.with_frame_end();
        }
        self.outbox.push_back(Frame {
            packets,
            waiter,
            last_of_block,
        });
    }

    fn done(&mut self, id: XmitId, result: Result<(), DatalinkError>) {
        self.actions.push_back(Action::XmitDone { id, result });
    }

    fn beacon_packet(&mut self, dest: PeerId, body: BeaconBody) -> (u32, TransceiverPacket) {
        let seq = self.beacon_seq;
        self.beacon_seq = TransId::next_seq(seq);
        let beacon = Beacon {
            sender: self.local,
            seq,
            body,
        };
        let mut packet = TransceiverPacket::datalink(self.local, dest, beacon.encode());
        packet.trans_id = TransId::new(seq);
        (seq, packet)
    }

    fn send_beacon(&mut self, dest: PeerId, body: BeaconBody) {
        let (_, packet) = self.beacon_packet(dest, body);
        self.emit(packet);
    }

    fn send_ack(&mut self, to: PeerId, status: AckStatus, acked: u32) {
        if let Some(n) = self.neighbours.get_mut(to) {
            n.last_ack = Some(status);
        }
        self.send_beacon(to, BeaconBody::Ack { status, acked });
    }

    /// Send a ping request, at most once per ack timeout per peer.
    fn send_ping(&mut self, peer: PeerId, now: Instant) {
        let timeout = self.config.ack_timeout;
        let Some(n) = self.neighbours.get_mut(peer) else {
            return;
        };
        if n.last_ping.is_some_and(|at| now < at + timeout) {
            return;
        }
        n.last_ping = Some(now);
        self.send_beacon(peer, BeaconBody::Ping(PingKind::Request));
    }

    fn emit(&mut self, packet: TransceiverPacket) {
        self.actions.push_back(Action::Transmit(packet));
    }

    fn emit_all(&mut self, packets: Vec<TransceiverPacket>) {
        for packet in packets {
            self.emit(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::ReqType;
    use crate::core::constants::WNET_LISTENER_TIMEOUT;

    fn id(raw: u64) -> PeerId {
        PeerId::new(raw)
    }

    fn config() -> WinenetConfig {
        WinenetConfig {
            seed: Some(7),
            ..WinenetConfig::default()
        }
    }

    fn drain(w: &mut Winenet) -> Vec<Action> {
        std::iter::from_fn(|| w.poll_action()).collect()
    }

    fn sent_beacons(actions: &[Action]) -> Vec<(PeerId, Beacon)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Transmit(p) if p.kind == PacketKind::Datalink => {
                    Beacon::decode(&p.payload).ok().map(|b| (p.dest, b))
                }
                _ => None,
            })
            .collect()
    }

    fn sent_data(actions: &[Action]) -> Vec<TransceiverPacket> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Transmit(p) if p.kind == PacketKind::Data => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn beacon_from(from: u64, to: PeerId, seq: u32, body: BeaconBody) -> TransceiverPacket {
        let beacon = Beacon {
            sender: id(from),
            seq,
            body,
        };
        let mut p = TransceiverPacket::datalink(id(from), to, beacon.encode());
        p.trans_id = TransId::new(seq);
        p
    }

    fn data_from(from: u64, to: PeerId, trans_id: TransId) -> TransceiverPacket {
        let mut p = TransceiverPacket::data(ReqType::Dcm, id(from), to, vec![trans_id.seq() as u8]);
        p.trans_id = trans_id;
        p
    }

    fn payload(local: u64) -> TransceiverPacket {
        TransceiverPacket::data(ReqType::Dcm, id(local), PeerId::BROADCAST, vec![0xab; 4])
    }

    /// Node `local` with `peers` validated through ping requests (their seq 0).
    fn node_with(local: u64, peers: &[u64], config: WinenetConfig, now: Instant) -> Winenet {
        let mut w = Winenet::new(id(local), config);
        for peer in peers {
            w.on_packet(
                beacon_from(*peer, id(local), 0, BeaconBody::Ping(PingKind::Request)),
                now,
            );
        }
        drain(&mut w);
        w
    }

    /// Let the silence timer elapse so the lowest node claims the channel.
    fn claim(w: &mut Winenet) -> Instant {
        let now = w.next_deadline().unwrap();
        w.on_timer(now);
        assert_eq!(w.state(), WinenetState::Speaker);
        now
    }

    fn announce_seq(actions: &[Action], to: PeerId) -> u32 {
        sent_beacons(actions)
            .into_iter()
            .find(|(dest, b)| {
                *dest == to && b.body == BeaconBody::BroadcastSpeaker(SpeakerCause::Announce)
            })
            .map(|(_, b)| b.seq)
            .unwrap()
    }

    #[test]
    fn test_lower_identity_pings_first() {
        let now = Instant::now();
        let mut a = Winenet::new(id(1), config());
        let mut b = Winenet::new(id(2), config());

        a.neighbour_added(id(2), now);
        b.neighbour_added(id(1), now);
        assert_eq!(a.state(), WinenetState::Idle);
        assert_eq!(b.state(), WinenetState::Idle);

        let from_a = drain(&mut a);
        assert!(drain(&mut b).is_empty());
        let pings = sent_beacons(&from_a);
        assert_eq!(pings.len(), 1);
        assert_eq!(pings[0].0, id(2));
        assert_eq!(pings[0].1.body, BeaconBody::Ping(PingKind::Request));

        for action in from_a {
            if let Action::Transmit(p) = action {
                b.on_packet(p, now);
            }
        }
        assert!(b.neighbours().is_valid(id(1)));

        let from_b = drain(&mut b);
        assert_eq!(
            sent_beacons(&from_b)[0].1.body,
            BeaconBody::Ping(PingKind::Response)
        );
        for action in from_b {
            if let Action::Transmit(p) = action {
                a.on_packet(p, now);
            }
        }
        assert!(a.neighbours().is_valid(id(2)));
    }

    #[test]
    fn test_ping_rate_limited() {
        let now = Instant::now();
        let mut w = Winenet::new(id(1), config());
        w.neighbour_added(id(2), now);
        w.neighbour_updated(id(2), now + Duration::from_millis(10));
        assert_eq!(sent_beacons(&drain(&mut w)).len(), 1);

        w.neighbour_updated(id(2), now + Duration::from_secs(1));
        assert_eq!(sent_beacons(&drain(&mut w)).len(), 1);
    }

    #[test]
    fn test_unvalidated_beacon_ignored() {
        let now = Instant::now();
        let mut w = Winenet::new(id(5), config());
        w.on_packet(
            beacon_from(
                2,
                id(5),
                3,
                BeaconBody::BroadcastSpeaker(SpeakerCause::Announce),
            ),
            now,
        );

        assert_eq!(w.state(), WinenetState::Idle);
        assert_eq!(w.bound_speaker(), None);
        let beacons = sent_beacons(&drain(&mut w));
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].1.body, BeaconBody::Ping(PingKind::Request));
    }

    #[test]
    fn test_lowest_claims_then_hands_off() {
        let start = Instant::now();
        let mut w = node_with(1, &[2, 3], config(), start);

        let claimed = claim(&mut w);
        assert_eq!(claimed, start + WNET_LISTENER_TIMEOUT);

        let now = w.next_deadline().unwrap();
        assert_eq!(now, claimed + w.config.token_hold);
        w.on_timer(now);
        assert_eq!(w.state(), WinenetState::Idle);

        let beacons = sent_beacons(&drain(&mut w));
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].0, PeerId::BROADCAST);
        assert_eq!(
            beacons[0].1.body,
            BeaconBody::GoSpeaker {
                target: id(2),
                cause: HandoffCause::Completed
            }
        );
    }

    #[test]
    fn test_higher_identity_does_not_claim() {
        let start = Instant::now();
        let mut w = node_with(4, &[2], config(), start);
        let now = w.next_deadline().unwrap();
        w.on_timer(now);
        assert_eq!(w.state(), WinenetState::Idle);
    }

    #[test]
    fn test_block_abandoned_after_retries() {
        let start = Instant::now();
        let mut w = node_with(1, &[2], config(), start);
        let t = claim(&mut w);

        w.xmit(XmitId(1), Some(payload(1)), true, t);
        let seq = announce_seq(&drain(&mut w), id(2));
        w.on_packet(
            beacon_from(
                2,
                id(1),
                1,
                BeaconBody::Ack {
                    status: AckStatus::Ok,
                    acked: seq,
                },
            ),
            t,
        );

        let mut data = sent_data(&drain(&mut w));
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].dest, id(2));
        assert!(data[0].trans_id.is_last());
        assert!(data[0].trans_id.is_frame_end());

        let mut now = t;
        let mut actions = Vec::new();
        while !actions
            .iter()
            .any(|a| matches!(a, Action::XmitDone { .. }))
        {
            now = w.next_deadline().unwrap();
            w.on_timer(now);
            actions = drain(&mut w);
            data.extend(sent_data(&actions));
        }

        assert_eq!(data.len(), 3);
        assert!(actions.contains(&Action::XmitDone {
            id: XmitId(1),
            result: Err(DatalinkError::Abandoned)
        }));
        assert!(now - t <= w.retry_policy().worst_case());
        assert_eq!(w.state(), WinenetState::Idle);
        assert_eq!(w.stats().blocks_abandoned, 1);

        let go = sent_beacons(&actions);
        assert!(go.iter().any(|(dest, b)| *dest == PeerId::BROADCAST
            && b.body
                == BeaconBody::GoSpeaker {
                    target: id(2),
                    cause: HandoffCause::Abandoned
                }));
    }

    #[test]
    fn test_stalled_block_abandoned() {
        let start = Instant::now();
        let mut w = node_with(1, &[2], config(), start);
        let t = claim(&mut w);

        w.xmit(XmitId(1), Some(payload(1)), false, t);
        let seq = announce_seq(&drain(&mut w), id(2));
        w.on_packet(
            beacon_from(
                2,
                id(1),
                1,
                BeaconBody::Ack {
                    status: AckStatus::Ok,
                    acked: seq,
                },
            ),
            t,
        );
        let data = sent_data(&drain(&mut w));
        assert_eq!(data.len(), 1);
        w.on_packet(
            beacon_from(
                2,
                id(1),
                2,
                BeaconBody::Ack {
                    status: AckStatus::Ok,
                    acked: data[0].trans_id.seq(),
                },
            ),
            t,
        );
        assert!(drain(&mut w).contains(&Action::XmitDone {
            id: XmitId(1),
            result: Ok(())
        }));

        // The producer goes quiet with its block open.
        let stalled = w.next_deadline().unwrap();
        assert_eq!(stalled, t + w.config.stall_timeout);
        w.on_timer(stalled);
        let beacons = sent_beacons(&drain(&mut w));
        assert!(beacons.iter().any(|(_, b)| b.body
            == BeaconBody::GoSpeaker {
                target: id(2),
                cause: HandoffCause::Abandoned
            }));
        assert_eq!(w.state(), WinenetState::Idle);
        assert_eq!(w.stats().blocks_abandoned, 1);

        // The rest of that block is refused, the next block is taken.
        w.xmit(XmitId(2), Some(payload(1)), false, stalled);
        w.xmit(XmitId(3), Some(payload(1)), true, stalled);
        let refused = drain(&mut w);
        for id in [XmitId(2), XmitId(3)] {
            assert!(refused.contains(&Action::XmitDone {
                id,
                result: Err(DatalinkError::Abandoned)
            }));
        }
        w.xmit(XmitId(4), Some(payload(1)), true, stalled);
        assert!(
            !drain(&mut w)
                .iter()
                .any(|a| matches!(a, Action::XmitDone { id: XmitId(4), .. }))
        );
    }

    #[test]
    fn test_abandoned_handoff_cancels_reception() {
        let now = Instant::now();
        let mut w = node_with(2, &[1], config(), now);

        w.on_packet(
            beacon_from(
                1,
                id(2),
                1,
                BeaconBody::BroadcastSpeaker(SpeakerCause::Announce),
            ),
            now,
        );
        assert_eq!(w.state(), WinenetState::Listener);
        assert_eq!(w.bound_speaker(), Some(id(1)));
        drain(&mut w);

        w.on_packet(
            beacon_from(
                1,
                PeerId::BROADCAST,
                2,
                BeaconBody::GoSpeaker {
                    target: id(2),
                    cause: HandoffCause::Abandoned,
                },
            ),
            now,
        );
        let actions = drain(&mut w);
        assert!(actions.contains(&Action::CancelRx(id(1))));
        assert_eq!(w.state(), WinenetState::Speaker);
        assert_eq!(w.bound_speaker(), None);

        let acks = sent_beacons(&actions);
        assert_eq!(
            acks[0].1.body,
            BeaconBody::Ack {
                status: AckStatus::Ok,
                acked: 2
            }
        );
    }

    #[test]
    fn test_completed_handoff_keeps_reception() {
        let now = Instant::now();
        let mut w = node_with(2, &[1, 3], config(), now);
        w.on_packet(
            beacon_from(
                1,
                id(2),
                1,
                BeaconBody::BroadcastSpeaker(SpeakerCause::Announce),
            ),
            now,
        );
        drain(&mut w);

        w.on_packet(
            beacon_from(
                1,
                PeerId::BROADCAST,
                2,
                BeaconBody::GoSpeaker {
                    target: id(3),
                    cause: HandoffCause::Completed,
                },
            ),
            now,
        );
        assert!(!drain(&mut w).contains(&Action::CancelRx(id(1))));
        assert_eq!(w.state(), WinenetState::Idle);
    }

    #[test]
    fn test_new_speaker_cancels_previous() {
        let now = Instant::now();
        let mut w = node_with(2, &[1, 3], config(), now);

        w.on_packet(
            beacon_from(
                1,
                id(2),
                1,
                BeaconBody::BroadcastSpeaker(SpeakerCause::Announce),
            ),
            now,
        );
        assert!(!drain(&mut w).iter().any(|a| matches!(a, Action::CancelRx(_))));

        w.on_packet(
            beacon_from(
                3,
                id(2),
                1,
                BeaconBody::BroadcastSpeaker(SpeakerCause::Announce),
            ),
            now,
        );
        let actions = drain(&mut w);
        assert!(actions.contains(&Action::CancelRx(id(1))));
        assert_eq!(w.bound_speaker(), Some(id(3)));
        assert_eq!(w.state(), WinenetState::Listener);
    }

    #[test]
    fn test_duplicate_go_speaker_reacknowledged() {
        let now = Instant::now();
        let mut w = node_with(2, &[1], config(), now);
        let go = beacon_from(
            1,
            PeerId::BROADCAST,
            5,
            BeaconBody::GoSpeaker {
                target: id(2),
                cause: HandoffCause::Completed,
            },
        );

        w.on_packet(go.clone(), now);
        drain(&mut w);
        assert_eq!(w.state(), WinenetState::Speaker);

        w.on_packet(go, now);
        let beacons = sent_beacons(&drain(&mut w));
        assert_eq!(beacons.len(), 1);
        assert_eq!(
            beacons[0].1.body,
            BeaconBody::Ack {
                status: AckStatus::Ok,
                acked: 5
            }
        );
        assert_eq!(w.state(), WinenetState::Speaker);
        assert_eq!(w.stats().duplicates, 1);
    }

    fn listening(local: u64, speaker: u64, now: Instant) -> Winenet {
        let mut w = node_with(local, &[speaker], config(), now);
        w.on_packet(
            beacon_from(
                speaker,
                id(local),
                1,
                BeaconBody::BroadcastSpeaker(SpeakerCause::Announce),
            ),
            now,
        );
        drain(&mut w);
        w
    }

    fn delivered(actions: &[Action]) -> Vec<u32> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Deliver(p) => Some(p.trans_id.seq()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_duplicate_data_delivered_once() {
        let now = Instant::now();
        let mut w = listening(2, 1, now);
        let packet = data_from(1, id(2), TransId::new(0).with_last().with_frame_end());

        w.on_packet(packet.clone(), now);
        let first = drain(&mut w);
        assert_eq!(delivered(&first), vec![0]);

        w.on_packet(packet, now);
        let second = drain(&mut w);
        assert!(delivered(&second).is_empty());
        assert_eq!(
            sent_beacons(&second)[0].1.body,
            BeaconBody::Ack {
                status: AckStatus::Ok,
                acked: 0
            }
        );
        assert_eq!(w.stats().duplicates, 1);
    }

    #[test]
    fn test_gap_discards_partial_frame() {
        let now = Instant::now();
        let mut w = listening(2, 1, now);

        w.on_packet(data_from(1, id(2), TransId::new(0)), now);
        w.on_packet(data_from(1, id(2), TransId::new(2).with_frame_end()), now);
        assert!(delivered(&drain(&mut w)).is_empty());

        w.on_packet(data_from(1, id(2), TransId::new(0)), now);
        w.on_packet(data_from(1, id(2), TransId::new(1)), now);
        w.on_packet(data_from(1, id(2), TransId::new(2).with_frame_end()), now);
        let actions = drain(&mut w);
        assert_eq!(delivered(&actions), vec![0, 1, 2]);
        assert_eq!(w.stats().frames_delivered, 1);
    }

    #[test]
    fn test_data_from_unbound_peer_dropped() {
        let now = Instant::now();
        let mut w = node_with(2, &[1], config(), now);
        w.on_packet(data_from(1, id(2), TransId::new(0).with_frame_end()), now);
        assert!(drain(&mut w).is_empty());
    }

    #[test]
    fn test_speaker_refuses_announcement() {
        let start = Instant::now();
        let mut w = node_with(1, &[2], config(), start);
        let now = claim(&mut w);

        w.on_packet(
            beacon_from(
                2,
                id(1),
                1,
                BeaconBody::BroadcastSpeaker(SpeakerCause::Announce),
            ),
            now,
        );
        let beacons = sent_beacons(&drain(&mut w));
        assert_eq!(
            beacons[0].1.body,
            BeaconBody::Ack {
                status: AckStatus::Abort,
                acked: 1
            }
        );
        assert_eq!(w.state(), WinenetState::Speaker);
    }

    #[test]
    fn test_refused_announcement_yields_and_keeps_queue() {
        let start = Instant::now();
        let mut w = node_with(1, &[2], config(), start);
        let now = claim(&mut w);

        w.xmit(XmitId(1), Some(payload(1)), true, now);
        let seq = announce_seq(&drain(&mut w), id(2));
        w.on_packet(
            beacon_from(
                2,
                id(1),
                1,
                BeaconBody::Ack {
                    status: AckStatus::Abort,
                    acked: seq,
                },
            ),
            now,
        );
        let actions = drain(&mut w);
        assert!(!actions.iter().any(|a| matches!(a, Action::XmitDone { .. })));
        assert_eq!(w.state(), WinenetState::Idle);

        // Token comes back: the queued block is announced again.
        w.on_packet(
            beacon_from(
                2,
                PeerId::BROADCAST,
                2,
                BeaconBody::GoSpeaker {
                    target: id(1),
                    cause: HandoffCause::Completed,
                },
            ),
            now,
        );
        let actions = drain(&mut w);
        assert_eq!(w.state(), WinenetState::Speaker);
        announce_seq(&actions, id(2));
    }

    #[test]
    fn test_no_neighbour_fails_immediately() {
        let mut w = Winenet::new(id(1), config());
        w.xmit(XmitId(3), Some(payload(1)), true, Instant::now());
        assert_eq!(
            drain(&mut w),
            vec![Action::XmitDone {
                id: XmitId(3),
                result: Err(DatalinkError::NoPeerReachable)
            }]
        );
    }

    #[test]
    fn test_losing_last_neighbour_fails_queue() {
        let start = Instant::now();
        let mut w = node_with(1, &[2], config(), start);
        let now = claim(&mut w);
        w.xmit(XmitId(1), Some(payload(1)), true, now);
        drain(&mut w);

        w.neighbour_removed(id(2), now);
        assert!(drain(&mut w).contains(&Action::XmitDone {
            id: XmitId(1),
            result: Err(DatalinkError::NoPeerReachable)
        }));
        assert_eq!(w.state(), WinenetState::Idle);
        assert_eq!(w.next_deadline(), None);
    }

    #[test]
    fn test_unanswered_handoff_not_offered_elsewhere() {
        let start = Instant::now();
        let mut w = node_with(1, &[2, 3], config(), start);
        claim(&mut w);

        let mut targets = Vec::new();
        let mut failed = false;
        for _ in 0..32 {
            let Some(now) = w.next_deadline() else { break };
            w.on_timer(now);
            let beacons = sent_beacons(&drain(&mut w));
            if !failed && !w.neighbours().is_valid(id(2)) {
                // Node 2 may hold the token with its acks lost.
                failed = true;
                assert!(beacons.is_empty());
                assert_eq!(w.state(), WinenetState::Idle);
                assert_eq!(w.next_deadline(), w.idle_deadline);
            }
            for (_, b) in beacons {
                if let BeaconBody::GoSpeaker { target, .. } = b.body {
                    targets.push(target.get());
                }
            }
            if targets.contains(&3) {
                break;
            }
        }

        // Node 3 is only offered the token after a silent period let node 1
        // reclaim it.
        assert!(failed);
        assert_eq!(targets, vec![2, 2, 2, 3]);
        assert_eq!(w.prev_state(), WinenetState::Speaker);
        assert_eq!(w.stats().neighbours_invalidated, 1);
    }

    #[test]
    fn test_handoff_ack_ends_retries() {
        let start = Instant::now();
        let mut w = node_with(1, &[2], config(), start);
        let t = claim(&mut w);
        let now = t + w.config.token_hold;
        w.on_timer(now);
        let go = sent_beacons(&drain(&mut w))[0].1;

        w.on_packet(
            beacon_from(
                2,
                id(1),
                1,
                BeaconBody::Ack {
                    status: AckStatus::Ok,
                    acked: go.seq,
                },
            ),
            now,
        );
        assert_eq!(w.stats().handoffs, 1);
        // Only the silence timer remains.
        assert_eq!(w.next_deadline(), Some(now + w.config.listener_timeout));
    }

    #[test]
    fn test_batch_acknowledged_as_a_whole() {
        let start = Instant::now();
        let cfg = WinenetConfig {
            packets_per_frame: 2,
            ..config()
        };
        let mut w = node_with(1, &[2], cfg, start);
        let now = claim(&mut w);

        w.xmit(XmitId(1), Some(payload(1)), false, now);
        assert_eq!(
            drain(&mut w),
            vec![Action::XmitDone {
                id: XmitId(1),
                result: Ok(())
            }]
        );

        w.xmit(XmitId(2), Some(payload(1)), true, now);
        let seq = announce_seq(&drain(&mut w), id(2));
        w.on_packet(
            beacon_from(
                2,
                id(1),
                1,
                BeaconBody::Ack {
                    status: AckStatus::Ok,
                    acked: seq,
                },
            ),
            now,
        );
        let data = sent_data(&drain(&mut w));
        assert_eq!(data.len(), 2);
        assert!(!data[0].trans_id.is_frame_end());
        assert!(!data[0].trans_id.is_last());
        assert!(data[1].trans_id.is_frame_end());
        assert!(data[1].trans_id.is_last());

        w.on_packet(
            beacon_from(
                2,
                id(1),
                2,
                BeaconBody::Ack {
                    status: AckStatus::Ok,
                    acked: data[1].trans_id.seq(),
                },
            ),
            now,
        );
        assert!(drain(&mut w).contains(&Action::XmitDone {
            id: XmitId(2),
            result: Ok(())
        }));
        assert_eq!(w.stats().blocks_sent, 1);
    }

    #[test]
    fn test_end_of_stream_releases_token() {
        let start = Instant::now();
        let mut w = node_with(1, &[2], config(), start);
        let now = claim(&mut w);

        w.xmit(XmitId(9), None, true, now);
        let actions = drain(&mut w);
        assert!(actions.contains(&Action::XmitDone {
            id: XmitId(9),
            result: Ok(())
        }));
        assert_eq!(w.state(), WinenetState::Idle);

        let mut idle = Winenet::new(id(5), config());
        idle.xmit(XmitId(1), None, true, now);
        assert_eq!(drain(&mut idle).len(), 1);
    }

    #[test]
    fn test_silent_speaker_unbound() {
        let now = Instant::now();
        let mut w = listening(2, 1, now);
        let deadline = w.next_deadline().unwrap();
        w.on_timer(deadline);

        assert!(drain(&mut w).contains(&Action::CancelRx(id(1))));
        assert_eq!(w.bound_speaker(), None);
        assert_eq!(w.state(), WinenetState::Idle);
    }
}
