//! Hierarchical heartbeat propagation
//!
//! Every node broadcasts its own heartbeats to its region. The region's
//! aggregation point (lowest active node_id) relays them to the aggregation
//! points of other regions, at most `max_fanout` of them. A node that is not
//! the aggregation point relays only heartbeats it received straight from
//! their origin, and only up to its own aggregation point.
//!
//! Outgoing messages sit in one bounded queue per peer and are drained
//! round-robin, so a slow peer fills its own queue and nobody else's.

use crate::config::DedupMode;
use crate::types::{Heartbeat, NodeId, Region};
use siphasher::sip::SipHasher13;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::hash::Hasher;

/// Dedup key for a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Sequence(NodeId, u64),
    Content(u64),
}

impl MessageKey {
    pub fn of(hb: &Heartbeat, mode: DedupMode) -> Self {
        match mode {
            DedupMode::BySequence => Self::Sequence(hb.node_id.clone(), hb.sequence),
            DedupMode::ByContent => {
                let mut h = SipHasher13::new_with_keys(0x5055_4c53_4543_4841, 0x494e_4842_5f56_3100);
                h.write(&hb.signed_bytes());
                Self::Content(h.finish())
            }
        }
    }
}

/// Bounded FIFO set of recently seen keys
#[derive(Debug)]
pub struct SeenCache {
    order: VecDeque<MessageKey>,
    set: HashSet<MessageKey>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), set: HashSet::new(), capacity: capacity.max(1) }
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.set.contains(key)
    }

    /// Returns false if already present
    pub fn insert(&mut self, key: MessageKey) -> bool {
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Aggregation point of each region: the lowest active node_id
pub fn aggregation_points<'a>(members: impl IntoIterator<Item = (&'a NodeId, &'a Region)>) -> BTreeMap<Region, NodeId> {
    let mut points: BTreeMap<Region, NodeId> = BTreeMap::new();
    for (node, region) in members {
        match points.get(region) {
            Some(current) if current <= node => {}
            _ => {
                points.insert(region.clone(), node.clone());
            }
        }
    }
    points
}

/// Where an accepted heartbeat goes next
pub fn relay_targets(
    me: &NodeId,
    my_region: &Region,
    origin: &NodeId,
    received_from: &NodeId,
    points: &BTreeMap<Region, NodeId>,
    max_fanout: usize,
) -> Vec<NodeId> {
    let Some(my_point) = points.get(my_region) else {
        return Vec::new();
    };
    if my_point == me {
        points
            .iter()
            .filter(|(region, point)| *region != my_region && *point != origin && *point != received_from)
            .map(|(_, point)| point.clone())
            .take(max_fanout)
            .collect()
    } else if received_from == origin && my_point != origin {
        vec![my_point.clone()]
    } else {
        Vec::new()
    }
}

/// Per-peer bounded outgoing queues
#[derive(Debug)]
pub struct PeerQueues {
    queues: BTreeMap<NodeId, VecDeque<Vec<u8>>>,
    capacity: usize,
    cursor: Option<NodeId>,
    dropped: u64,
}

impl PeerQueues {
    pub fn new(capacity: usize) -> Self {
        Self { queues: BTreeMap::new(), capacity: capacity.max(1), cursor: None, dropped: 0 }
    }

    /// Returns false (and counts a drop) if the peer's queue is full
    pub fn enqueue(&mut self, peer: NodeId, bytes: Vec<u8>) -> bool {
        let q = self.queues.entry(peer).or_default();
        if q.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        q.push_back(bytes);
        true
    }

    /// Up to `max` messages, one per peer per pass, resuming after the last
    /// peer served.
    pub fn drain(&mut self, max: usize) -> Vec<(NodeId, Vec<u8>)> {
        let mut out = Vec::new();
        while out.len() < max {
            let next = match &self.cursor {
                Some(c) => self
                    .queues
                    .range::<NodeId, _>((std::ops::Bound::Excluded(c), std::ops::Bound::Unbounded))
                    .find(|(_, q)| !q.is_empty())
                    .or_else(|| self.queues.iter().find(|(_, q)| !q.is_empty()))
                    .map(|(p, _)| p.clone()),
                None => self.queues.iter().find(|(_, q)| !q.is_empty()).map(|(p, _)| p.clone()),
            };
            let Some(peer) = next else { break };
            if let Some(bytes) = self.queues.get_mut(&peer).and_then(VecDeque::pop_front) {
                out.push((peer.clone(), bytes));
            }
            self.cursor = Some(peer);
        }
        self.queues.retain(|_, q| !q.is_empty());
        out
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Fill level of the fullest queue, in [0, 1]
    pub fn pressure(&self) -> f64 {
        let worst = self.queues.values().map(VecDeque::len).max().unwrap_or(0);
        worst as f64 / self.capacity as f64
    }
}
