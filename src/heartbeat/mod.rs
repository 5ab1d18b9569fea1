//! Heartbeat engine
//!
//! Nodes emit signed heartbeats referencing their region's PoH chain at an
//! adaptive interval. Each receiver checks them in a fixed order:
//!
//! 1. sender known, in this region, not excluded
//! 2. ML-DSA-65 signature (failure: drop, penalize the delivering peer, no suspicion)
//! 3. duplicate by dedup key (drop silently)
//! 4. sequence above the last accepted one (else replay: suspect)
//! 5. slot not ahead of the local tip, not more than K behind (else suspect)
//! 6. `poh_hash` matches the local entry at that slot (else suspect)
//! 7. timestamp within the skew bound of the local clock (else suspect)
//!
//! Accepted heartbeats accumulate in the open evaluation window. Closing the
//! window runs clustering and settles each node's liveness state.

pub mod cluster;
pub mod liveness;
pub mod propagation;

use crate::config::{HeartbeatPolicy, OutlierPolicy};
use crate::crypto::{self, Keypair};
use crate::error::{SignatureError, TimingError};
use crate::poh::ChainView;
use crate::registry::NodeRegistry;
use crate::types::{Heartbeat, NodeId, PoHEntry, Region};
use cluster::{ClusterResult, Sample, StrikeTracker};
use liveness::{LivenessState, NodeLiveness, ReadmitError, Transition};
use propagation::{MessageKey, SeenCache};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatRejection {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("node {0} is excluded")]
    Excluded(NodeId),
    #[error("node {node} belongs to region {region}")]
    ForeignRegion { node: NodeId, region: Region },
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("duplicate heartbeat {node}#{sequence}")]
    Duplicate { node: NodeId, sequence: u64 },
    #[error("{node}: {source}")]
    Timing { node: NodeId, source: TimingError },
    #[error("{node} references slot {slot} with a hash unknown to the local chain")]
    PohMismatch { node: NodeId, slot: u64 },
    #[error("slot {slot} is ahead of local tip {tip}")]
    AheadOfTip { slot: u64, tip: u64 },
}

impl HeartbeatRejection {
    /// Moves the sender to SUSPECTED
    pub fn suspects_sender(&self) -> bool {
        matches!(self, Self::Timing { .. } | Self::PohMismatch { .. })
    }
}

// =============================================================================
// EMISSION
// =============================================================================

/// Interval for a load in [0, 1]: the maximum when idle, the minimum at full load
pub fn adaptive_interval(load: f64, policy: &HeartbeatPolicy) -> Duration {
    let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 1.0 };
    let span = policy.max_interval_ms.saturating_sub(policy.min_interval_ms) as f64;
    let ms = policy.max_interval_ms as f64 - span * load;
    Duration::from_millis(ms.round() as u64)
}

/// Signs this node's heartbeats with a strictly increasing sequence
#[derive(Debug)]
pub struct HeartbeatEmitter {
    node_id: NodeId,
    keypair: Keypair,
    sequence: u64,
}

impl HeartbeatEmitter {
    /// The first heartbeat carries `last_sequence + 1`
    pub fn new(node_id: NodeId, keypair: Keypair, last_sequence: u64) -> Self {
        Self { node_id, keypair, sequence: last_sequence }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Jump to a fresh range after administrative re-entry
    pub fn restart_at(&mut self, floor: u64) {
        self.sequence = floor.saturating_sub(1);
    }

    pub fn emit(&mut self, entry: &PoHEntry, now_ms: u64) -> Heartbeat {
        self.sequence += 1;
        let msg = Heartbeat::message_to_sign(entry.index, &entry.hash, &self.node_id, self.sequence, now_ms);
        Heartbeat {
            poh_slot: entry.index,
            poh_hash: entry.hash,
            node_id: self.node_id.clone(),
            sequence: self.sequence,
            timestamp: now_ms,
            signature: self.keypair.sign(&msg),
        }
    }
}

// =============================================================================
// INGESTION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub node_id: NodeId,
    pub sequence: u64,
    pub transition: Option<Transition>,
}

/// Receive latency, last N samples
#[derive(Debug, Clone, Default)]
struct Latency {
    samples: VecDeque<u64>,
}

impl Latency {
    fn push(&mut self, ms: u64, cap: usize) {
        self.samples.push_back(ms);
        while self.samples.len() > cap {
            self.samples.pop_front();
        }
    }

    fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub state: LivenessState,
    pub last_accepted_sequence: u64,
    pub avg_latency_ms: Option<f64>,
    pub outlier_streak: u32,
}

/// Everything the validator needs from one closed window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowReport {
    pub window_id: u64,
    /// Accepted heartbeats, in arrival order
    pub heartbeats: Vec<Heartbeat>,
    /// Suspected at any point in the window: no quorum weight
    pub suspected: BTreeSet<NodeId>,
    pub outlier_heartbeats: BTreeSet<(NodeId, u64)>,
    /// Reached the consecutive-strike threshold this window
    pub flagged_outliers: Vec<NodeId>,
    /// Entered SUSPECTED during the window or at its close
    pub newly_suspected: Vec<NodeId>,
    pub newly_excluded: Vec<NodeId>,
    pub signature_failures: Vec<NodeId>,
}

#[derive(Debug, Default)]
struct OpenWindow {
    heartbeats: Vec<Heartbeat>,
    newly_suspected: Vec<NodeId>,
    signature_failures: Vec<NodeId>,
}

/// One node's view of its region's heartbeat traffic
#[derive(Debug)]
pub struct HeartbeatEngine {
    region: Region,
    policy: HeartbeatPolicy,
    outlier: OutlierPolicy,
    nodes: BTreeMap<NodeId, NodeLiveness>,
    last_accepted: BTreeMap<NodeId, u64>,
    seen: SeenCache,
    window_id: u64,
    open: OpenWindow,
    strikes: StrikeTracker,
    latency: BTreeMap<NodeId, Latency>,
}

impl HeartbeatEngine {
    pub fn new(region: Region, policy: HeartbeatPolicy, outlier: OutlierPolicy) -> Self {
        Self {
            region,
            seen: SeenCache::new(policy.dedup_capacity),
            policy,
            outlier,
            nodes: BTreeMap::new(),
            last_accepted: BTreeMap::new(),
            window_id: 0,
            open: OpenWindow::default(),
            strikes: StrikeTracker::default(),
            latency: BTreeMap::new(),
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn policy(&self) -> &HeartbeatPolicy {
        &self.policy
    }

    pub fn window_id(&self) -> u64 {
        self.window_id
    }

    pub fn state(&self, node: &NodeId) -> LivenessState {
        self.nodes.get(node).map(NodeLiveness::state).unwrap_or(LivenessState::Idle)
    }

    pub fn last_accepted(&self, node: &NodeId) -> Option<u64> {
        self.last_accepted.get(node).copied()
    }

    pub fn status(&self, node: &NodeId) -> NodeStatus {
        NodeStatus {
            state: self.state(node),
            last_accepted_sequence: self.last_accepted.get(node).copied().unwrap_or(0),
            avg_latency_ms: self.latency.get(node).and_then(Latency::average),
            outlier_streak: self.strikes.streak(node),
        }
    }

    /// Validate one heartbeat against the local chain at `now_ms`.
    ///
    /// `from` is the peer the transport delivered it from. A bad signature is
    /// charged to that peer, never to the node the heartbeat names.
    pub fn ingest(
        &mut self,
        hb: &Heartbeat,
        from: &NodeId,
        registry: &NodeRegistry,
        chain: &ChainView,
        now_ms: u64,
    ) -> Result<Accepted, HeartbeatRejection> {
        let node = &hb.node_id;
        let record = registry.get(node).ok_or_else(|| HeartbeatRejection::UnknownNode(node.clone()))?;
        if record.region != self.region {
            return Err(HeartbeatRejection::ForeignRegion { node: node.clone(), region: record.region.clone() });
        }
        if self.nodes.get(node).is_some_and(NodeLiveness::is_excluded) {
            return Err(HeartbeatRejection::Excluded(node.clone()));
        }

        if !crypto::verify(&record.public_key, &hb.signed_bytes(), &hb.signature) {
            warn!(node = %node, via = %from, sequence = hb.sequence, "Heartbeat signature invalid");
            self.open.signature_failures.push(from.clone());
            return Err(SignatureError::Heartbeat(node.clone()).into());
        }

        let key = MessageKey::of(hb, self.policy.dedup);
        if self.seen.contains(&key) {
            debug!(node = %node, sequence = hb.sequence, "Duplicate heartbeat");
            return Err(HeartbeatRejection::Duplicate { node: node.clone(), sequence: hb.sequence });
        }

        if let Err(rejection) = self.check_timeline(hb, record.last_accepted_sequence, chain, now_ms) {
            if rejection.suspects_sender() {
                self.suspect(node, &rejection);
            } else {
                debug!(node = %node, "Heartbeat dropped: {}", rejection);
            }
            return Err(rejection);
        }

        self.seen.insert(key);
        self.last_accepted.insert(node.clone(), hb.sequence);
        self.latency
            .entry(node.clone())
            .or_default()
            .push(now_ms.saturating_sub(hb.timestamp), self.policy.latency_samples);
        self.open.heartbeats.push(hb.clone());

        let transition = self.nodes.entry(node.clone()).or_default().on_valid_heartbeat();
        if let Some(t) = transition {
            info!(node = %node, "Liveness {} -> {}", t.from, t.to);
        }
        Ok(Accepted { node_id: node.clone(), sequence: hb.sequence, transition })
    }

    fn check_timeline(
        &self,
        hb: &Heartbeat,
        registry_last: u64,
        chain: &ChainView,
        now_ms: u64,
    ) -> Result<(), HeartbeatRejection> {
        let node = &hb.node_id;
        let timing = |source| HeartbeatRejection::Timing { node: node.clone(), source };

        let last = self.last_accepted.get(node).copied().unwrap_or(registry_last);
        if hb.sequence <= last {
            return Err(timing(TimingError::Replay { sequence: hb.sequence, last }));
        }

        let tip = chain.tip().map(|e| e.index);
        match tip {
            Some(tip) if hb.poh_slot <= tip => {
                let threshold = self.policy.stale_slot_threshold;
                if tip - hb.poh_slot > threshold {
                    return Err(timing(TimingError::StaleSlot { slot: hb.poh_slot, tip, threshold }));
                }
            }
            _ => return Err(HeartbeatRejection::AheadOfTip { slot: hb.poh_slot, tip: tip.unwrap_or(0) }),
        }

        match chain.entry_at(hb.poh_slot) {
            Some(entry) if entry.hash == hb.poh_hash => {}
            Some(_) => return Err(HeartbeatRejection::PohMismatch { node: node.clone(), slot: hb.poh_slot }),
            None => {
                let tip = tip.unwrap_or(0);
                return Err(timing(TimingError::StaleSlot { slot: hb.poh_slot, tip, threshold: self.policy.stale_slot_threshold }));
            }
        }

        let skew_ms = now_ms.abs_diff(hb.timestamp);
        if skew_ms > self.policy.skew_bound_ms {
            return Err(timing(TimingError::ClockSkew { skew_ms, bound_ms: self.policy.skew_bound_ms }));
        }
        Ok(())
    }

    fn suspect(&mut self, node: &NodeId, why: &HeartbeatRejection) {
        warn!(node = %node, "Heartbeat violation: {}", why);
        if let Some(t) = self.nodes.entry(node.clone()).or_default().on_violation() {
            info!(node = %node, "Liveness {} -> {}", t.from, t.to);
            self.open.newly_suspected.push(node.clone());
        }
    }

    /// Close the open window and start the next one.
    ///
    /// Every active node of the region in `registry` is settled, including
    /// nodes that sent nothing.
    pub fn close_window(&mut self, registry: &NodeRegistry) -> WindowReport {
        for record in registry.active_in_region(&self.region) {
            self.nodes.entry(record.node_id.clone()).or_default();
        }

        let samples: Vec<Sample> = self
            .open
            .heartbeats
            .iter()
            .map(|hb| Sample {
                node_id: hb.node_id.clone(),
                sequence: hb.sequence,
                slot: hb.poh_slot,
                timestamp: hb.timestamp,
            })
            .collect();
        let ClusterResult { outlier_heartbeats, struck } = cluster::detect(&samples, &self.outlier);
        let flagged_outliers = self.strikes.close_window(&struck, &self.outlier);
        for node in &flagged_outliers {
            warn!(node = %node, window = self.window_id, "Heartbeat clock outlier");
        }

        let suspected: BTreeSet<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, l)| l.suspect_this_window())
            .map(|(n, _)| n.clone())
            .collect();

        let open = std::mem::take(&mut self.open);
        let mut newly_suspected = open.newly_suspected;
        let mut newly_excluded = Vec::new();
        for (node, liveness) in self.nodes.iter_mut() {
            let Some(t) = liveness.close_window(self.policy.exclude_after_windows) else {
                continue;
            };
            info!(node = %node, window = self.window_id, "Liveness {} -> {}", t.from, t.to);
            match t.to {
                LivenessState::Suspected { .. } if !matches!(t.from, LivenessState::Suspected { .. }) => {
                    newly_suspected.push(node.clone());
                }
                LivenessState::Excluded => newly_excluded.push(node.clone()),
                _ => {}
            }
        }

        let report = WindowReport {
            window_id: self.window_id,
            heartbeats: open.heartbeats,
            suspected,
            outlier_heartbeats,
            flagged_outliers,
            newly_suspected,
            newly_excluded,
            signature_failures: open.signature_failures,
        };
        self.window_id += 1;
        report
    }

    /// EXCLUDED → EMITTING with a fresh sequence range starting at `floor`
    pub fn readmit(&mut self, node: &NodeId, floor: u64) -> Result<Transition, ReadmitError> {
        let last = self.last_accepted.get(node).copied().unwrap_or(0);
        let liveness = self.nodes.entry(node.clone()).or_default();
        let t = liveness.readmit(floor, last)?;
        self.last_accepted.insert(node.clone(), floor - 1);
        info!(node = %node, floor, "Readmitted: {} -> {}", t.from, t.to);
        Ok(t)
    }
}
