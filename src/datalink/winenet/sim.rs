//! Deterministic multi-node harness for the Winenet machine.
//!
//! Nodes share one broadcast medium with instant propagation. Time only
//! moves when every queue is drained, jumping to the earliest deadline.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use super::fsm::{Action, Winenet, WinenetState, XmitId};
use crate::config::WinenetConfig;
use crate::core::{PeerId, ReqType};
use crate::datalink::DatalinkError;
use crate::transceiver::{PacketKind, TransceiverPacket};

pub(crate) struct Net {
    pub nodes: Vec<Winenet>,
    pub now: Instant,
    pub delivered: Vec<Vec<TransceiverPacket>>,
    pub done: Vec<Vec<(XmitId, Result<(), DatalinkError>)>>,
    pub cancelled: Vec<Vec<PeerId>>,
    /// Speaker of each turn, in order.
    pub turns: Vec<PeerId>,
    /// Most nodes seen in SPEAKER at once.
    pub max_speakers: usize,
    cut: HashSet<(usize, usize)>,
    cut_data: HashSet<(usize, usize)>,
    loss: f64,
    rng: StdRng,
    next_id: u64,
}

impl Net {
    pub fn new(ids: &[u64], config: WinenetConfig) -> Self {
        let n = ids.len();
        Self {
            nodes: ids
                .iter()
                .map(|id| Winenet::new(PeerId::new(*id), config.clone()))
                .collect(),
            now: Instant::now(),
            delivered: vec![Vec::new(); n],
            done: vec![Vec::new(); n],
            cancelled: vec![Vec::new(); n],
            turns: Vec::new(),
            max_speakers: 0,
            cut: HashSet::new(),
            cut_data: HashSet::new(),
            loss: 0.0,
            rng: StdRng::seed_from_u64(0x5001),
            next_id: 0,
        }
    }

    /// Drop each transmission independently with probability `loss`.
    pub fn with_loss(mut self, loss: f64, seed: u64) -> Self {
        self.loss = loss;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn id(&self, node: usize) -> PeerId {
        self.nodes[node].local()
    }

    /// Report every other node to every node, as discovery would.
    pub fn discover_all(&mut self) {
        let ids: Vec<PeerId> = self.nodes.iter().map(|n| n.local()).collect();
        for i in 0..self.nodes.len() {
            for peer in &ids {
                if *peer != ids[i] {
                    self.nodes[i].neighbour_added(*peer, self.now);
                }
            }
            self.pump();
        }
    }

    /// Stop frames from `from` reaching `to`.
    pub fn cut(&mut self, from: usize, to: usize) {
        self.cut.insert((from, to));
    }

    /// Stop data envelopes from `from` reaching `to`; beacons still pass.
    pub fn cut_data(&mut self, from: usize, to: usize) {
        self.cut_data.insert((from, to));
    }

    pub fn xmit(&mut self, node: usize, payload: &[u8], completed: bool) -> XmitId {
        let id = XmitId(self.next_id);
        self.next_id += 1;
        let packet = TransceiverPacket::data(
            ReqType::Dcm,
            self.id(node),
            PeerId::BROADCAST,
            payload.to_vec(),
        );
        self.nodes[node].xmit(id, Some(packet), completed, self.now);
        self.pump();
        id
    }

    /// Propagate every pending action until the medium is quiet.
    pub fn pump(&mut self) {
        let mut medium: VecDeque<(usize, TransceiverPacket)> = VecDeque::new();
        loop {
            for i in 0..self.nodes.len() {
                while let Some(action) = self.nodes[i].poll_action() {
                    match action {
                        Action::Transmit(p) => medium.push_back((i, p)),
                        Action::Deliver(p) => self.delivered[i].push(p),
                        Action::CancelRx(peer) => self.cancelled[i].push(peer),
                        Action::XmitDone { id, result } => self.done[i].push((id, result)),
                    }
                }
            }
            self.observe();

            let Some((from, packet)) = medium.pop_front() else {
                break;
            };
            for to in 0..self.nodes.len() {
                if to == from || self.cut.contains(&(from, to)) {
                    continue;
                }
                if packet.kind == PacketKind::Data && self.cut_data.contains(&(from, to)) {
                    continue;
                }
                if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
                    continue;
                }
                self.nodes[to].on_packet(packet.clone(), self.now);
            }
        }
    }

    fn observe(&mut self) {
        let speakers: Vec<PeerId> = self
            .nodes
            .iter()
            .filter(|n| n.state() == WinenetState::Speaker)
            .map(|n| n.local())
            .collect();
        self.max_speakers = self.max_speakers.max(speakers.len());
        if let [speaker] = speakers.as_slice() {
            if self.turns.last() != Some(speaker) {
                self.turns.push(*speaker);
            }
        }
    }

    /// Advance to the next deadline. Returns `false` if nothing is scheduled.
    pub fn step(&mut self) -> bool {
        let Some(next) = self.nodes.iter().filter_map(|n| n.next_deadline()).min() else {
            return false;
        };
        self.now = self.now.max(next);
        for i in 0..self.nodes.len() {
            if self.nodes[i].next_deadline().is_some_and(|d| d <= self.now) {
                self.nodes[i].on_timer(self.now);
                self.pump();
            }
        }
        true
    }

    /// Step until `done` holds or `limit` of simulated time passes.
    pub fn run_until(&mut self, limit: Duration, done: impl Fn(&Net) -> bool) -> bool {
        let end = self.now + limit;
        while !done(self) {
            if self.now >= end || !self.step() {
                return false;
            }
        }
        true
    }

    pub fn completed(&self, node: usize, id: XmitId) -> Option<Result<(), DatalinkError>> {
        self.done[node]
            .iter()
            .find(|(done, _)| *done == id)
            .map(|(_, r)| *r)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config() -> WinenetConfig {
        WinenetConfig {
            seed: Some(11),
            ..WinenetConfig::default()
        }
    }

    fn three() -> Net {
        let mut net = Net::new(&[1, 2, 3], config());
        net.discover_all();
        net
    }

    #[test]
    fn test_discovery_validates_everyone() {
        let net = three();
        for node in &net.nodes {
            assert_eq!(node.state(), WinenetState::Idle);
            assert_eq!(node.neighbours().valid_ids().len(), 2);
        }
    }

    #[test]
    fn test_single_speaker_and_round_robin() {
        let mut net = three();
        assert!(net.run_until(Duration::from_secs(5), |n| n.turns.len() >= 9));

        assert_eq!(net.max_speakers, 1);
        let ids: Vec<u64> = net.turns.iter().map(|id| id.get()).collect();
        assert_eq!(&ids[..6], &[1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_every_node_speaks_within_k_turns() {
        let mut net = three();
        net.run_until(Duration::from_secs(5), |n| n.turns.len() >= 12);

        for window in net.turns.windows(3) {
            let distinct: HashSet<PeerId> = window.iter().copied().collect();
            assert_eq!(distinct.len(), 3, "turns {:?}", net.turns);
        }
    }

    #[test]
    fn test_blocks_from_every_node_delivered_once_in_order() {
        let mut net = three();
        let mut pending = Vec::new();
        for node in 0..3 {
            for i in 0..3u8 {
                let id = net.xmit(node, &[node as u8, i], i == 2);
                pending.push((node, id));
            }
        }

        assert!(net.run_until(Duration::from_secs(10), |n| {
            pending.iter().all(|(node, id)| n.completed(*node, *id).is_some())
        }));
        for (node, id) in &pending {
            assert_eq!(net.completed(*node, *id), Some(Ok(())));
        }
        assert_eq!(net.max_speakers, 1);

        for listener in 0..3 {
            for speaker in 0..3 {
                if listener == speaker {
                    continue;
                }
                let got: Vec<Vec<u8>> = net.delivered[listener]
                    .iter()
                    .filter(|p| p.source == net.id(speaker))
                    .map(|p| p.payload.clone())
                    .collect();
                let want: Vec<Vec<u8>> = (0..3u8).map(|i| vec![speaker as u8, i]).collect();
                assert_eq!(got, want);
            }
        }
    }

    #[test]
    fn test_unreachable_listener_abandons_and_hands_off() {
        let mut net = Net::new(&[1, 2], config());
        net.discover_all();
        assert!(net.run_until(Duration::from_secs(5), |n| {
            n.nodes[0].state() == WinenetState::Speaker
        }));

        // Node 1 keeps the token while the block is open; its data stops arriving.
        let first = net.xmit(0, b"a", false);
        net.cut_data(0, 1);
        let second = net.xmit(0, b"b", false);
        let start = net.now;

        assert!(net.run_until(Duration::from_secs(10), |n| {
            n.completed(0, second).is_some()
        }));
        assert_eq!(net.completed(0, first), Some(Ok(())));
        assert_eq!(net.completed(0, second), Some(Err(DatalinkError::Abandoned)));
        assert!(net.now - start <= net.nodes[0].retry_policy().worst_case());
        assert_eq!(net.nodes[0].state(), WinenetState::Idle);

        // Node 2 got the abandoned handoff and cancelled node 1's reassembly.
        assert!(net.cancelled[1].contains(&net.id(0)));
        assert_eq!(net.nodes[1].state(), WinenetState::Speaker);
        assert_eq!(net.max_speakers, 1);
    }

    #[test]
    fn test_silent_lowest_node_is_replaced() {
        let mut net = three();
        assert!(net.run_until(Duration::from_secs(5), |n| n.turns.len() >= 3));

        // Node 1 falls silent and deaf.
        for other in 1..3 {
            net.cut(0, other);
            net.cut(other, 0);
        }
        let before = net.turns.len();
        assert!(net.run_until(Duration::from_secs(30), |n| {
            n.turns[before..].iter().filter(|id| id.get() != 1).count() >= 4
        }));

        let tail: Vec<u64> = net.turns[before..].iter().map(|id| id.get()).collect();
        assert!(tail.contains(&2) && tail.contains(&3), "turns {tail:?}");
    }

    #[test]
    fn test_lossy_medium_never_duplicates_or_reorders() {
        let mut net = Net::new(&[1, 2, 3], config()).with_loss(0.05, 42);
        net.discover_all();

        let mut ids = Vec::new();
        for round in 0..4u8 {
            for node in 0..3 {
                ids.push((node, net.xmit(node, &[node as u8, round], true)));
            }
        }
        assert!(net.run_until(Duration::from_secs(60), |n| {
            ids.iter().all(|(node, id)| n.completed(*node, *id).is_some())
        }));
        assert_eq!(net.max_speakers, 1);

        let mut total = 0;
        for listener in 0..3 {
            let mut last: HashMap<PeerId, u32> = HashMap::new();
            for p in &net.delivered[listener] {
                let seq = p.trans_id.seq();
                if let Some(prev) = last.insert(p.source, seq) {
                    assert!(seq > prev, "node {listener} got {seq} after {prev}");
                }
                total += 1;
            }
        }
        assert!(total > 0);
    }

    #[test]
    fn test_retrying_speaker_keeps_other_listener_bound() {
        let mut net = three();
        assert!(net.run_until(Duration::from_secs(5), |n| {
            n.nodes[1].state() == WinenetState::Speaker
        }));
        let before = net.turns.len();

        // Node 2 retries towards node 3 while node 1 only overhears it.
        net.cut_data(1, 2);
        let x = net.xmit(1, b"x", true);
        net.run_until(Duration::from_secs(5), |_| false);

        assert_eq!(net.max_speakers, 1);
        assert_eq!(net.completed(1, x), Some(Err(DatalinkError::Abandoned)));
        assert_eq!(net.turns[before], net.id(2));
    }
}
