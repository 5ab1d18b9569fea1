//! PulseChain Consensus Engine
//!
//! Интегрирует все слои одного узла:
//! - poh.rs: chain snapshots (read only, the sequencer is the writer)
//! - election.rs: VRF proofs at epoch boundaries, schedule per window
//! - heartbeat/: emission, ingestion, liveness, relay
//! - validator.rs: segment finalization and trust feedback
//! - net.rs: transport
//!
//! Heartbeats from other regions arrive through aggregation points; they are
//! deduplicated and counted, nothing more.
//!
//! Everything mutable lives in one `State` behind a lock. Three events drive it:
//! a new chain tip, an inbound message, and the heartbeat timer.

use crate::config::Config;
use crate::crypto::NodeIdentity;
use crate::db::{DbError, Storage};
use crate::election::{
    boundary_index, elect, epoch_of, is_epoch_boundary, verify_and_select, Ballot, CandidateProof, ElectionError,
    ElectionOutcome, ScheduleBook,
};
use crate::heartbeat::liveness::{LivenessState, ReadmitError, Transition};
use crate::heartbeat::propagation::{aggregation_points, relay_targets, MessageKey, PeerQueues, SeenCache};
use crate::heartbeat::{adaptive_interval, HeartbeatEmitter, HeartbeatEngine, NodeStatus};
use crate::net::{Envelope, NetError, Transport, VrfAnnouncement, WireMessage};
use crate::poh::{ChainView, PayloadQueue, PohReader, QueueFull};
use crate::registry::{NodeRegistry, RegistryError};
use crate::types::{millis_to_string, now_millis, short_hex, Heartbeat, LeaderSchedule, NodeId, PoHEntry, Region};
use crate::validator::{Disqualified, Finalization, FinalizationResult, ReelectionRequest, Validator};
use crate::vrf::VrfSecret;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

/// Proofs announced more than this many epochs away from the tip are ignored
const EPOCH_HORIZON: u64 = 1;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueFull),
    #[error("readmission refused: {0}")]
    Readmit(#[from] ReadmitError),
    #[error("network error: {0}")]
    Net(#[from] NetError),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What drives the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The sequencer published a new tip
    Tick(ChainView),
    Message(Envelope),
    EmitHeartbeat,
}

/// Consensus notifications
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    Finalized(Finalization),
    LeaderElected(LeaderSchedule),
    NodeExcluded(NodeId),
}

/// Shared handles the engine reads from and sends through
pub struct Wiring {
    pub reader: PohReader,
    pub payloads: Arc<Mutex<PayloadQueue>>,
    pub transport: Arc<dyn Transport>,
}

struct State {
    registry: NodeRegistry,
    heartbeats: HeartbeatEngine,
    emitter: HeartbeatEmitter,
    validator: Validator,
    book: ScheduleBook,
    boundaries: BTreeMap<u64, PoHEntry>,
    proofs: BTreeMap<u64, BTreeMap<NodeId, CandidateProof>>,
    relay: PeerQueues,
    foreign_seen: SeenCache,
    /// Distinct heartbeats heard from other regions, per region
    foreign_heard: BTreeMap<Region, u64>,
    last_tick: Option<u64>,
    last_finalization: Option<Finalization>,
    persisted_history: BTreeMap<NodeId, usize>,
}

/// One node's consensus participation
pub struct ConsensusEngine {
    node_id: NodeId,
    region: Region,
    config: Config,
    vrf: VrfSecret,
    reader: PohReader,
    payloads: Arc<Mutex<PayloadQueue>>,
    transport: Arc<dyn Transport>,
    storage: Option<Arc<Storage>>,
    state: RwLock<State>,
    events: broadcast::Sender<ConsensusEvent>,
}

impl ConsensusEngine {
    pub fn new(config: Config, identity: NodeIdentity, registry: NodeRegistry, wiring: Wiring) -> Self {
        let NodeIdentity { node_id, region, keypair, vrf } = identity;
        let last_sequence = registry.get(&node_id).map(|r| r.last_accepted_sequence).unwrap_or(0);
        let state = State {
            heartbeats: HeartbeatEngine::new(region.clone(), config.heartbeat, config.outlier),
            emitter: HeartbeatEmitter::new(node_id.clone(), keypair, last_sequence),
            validator: Validator::new(region.clone(), config.quorum, config.epoch_length),
            book: ScheduleBook::new(),
            boundaries: BTreeMap::new(),
            proofs: BTreeMap::new(),
            relay: PeerQueues::new(config.heartbeat.peer_queue_capacity),
            foreign_seen: SeenCache::new(config.heartbeat.dedup_capacity),
            foreign_heard: BTreeMap::new(),
            last_tick: None,
            last_finalization: None,
            persisted_history: BTreeMap::new(),
            registry,
        };
        let (events, _) = broadcast::channel(256);
        Self {
            node_id,
            region,
            config,
            vrf,
            reader: wiring.reader,
            payloads: wiring.payloads,
            transport: wiring.transport,
            storage: None,
            state: RwLock::new(state),
            events,
        }
    }

    /// Persist schedules, node records and trust history
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: ConsensusEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // APPLICATION SURFACE
    // =========================================================================

    /// Most recent confirmed segment of this node's region
    pub async fn latest_confirmed_segment(&self) -> Option<FinalizationResult> {
        self.state.read().await.validator.latest_confirmed().map(FinalizationResult::Confirmed)
    }

    /// Outcome of the last closed window, confirmed or not
    pub async fn last_finalization(&self) -> Option<Finalization> {
        self.state.read().await.last_finalization.clone()
    }

    /// Leader of the current epoch, or of the latest epoch elected so far
    pub async fn current_leader(&self, region: &Region) -> Option<NodeId> {
        let epoch = self.reader.tip().map(|t| epoch_of(t.index, self.config.epoch_length)).unwrap_or(0);
        let st = self.state.read().await;
        st.book.latest_up_to(epoch, region).map(|s| s.leader_node_id.clone())
    }

    /// Queue an opaque payload; returns the tick it is expected to appear in.
    /// Inclusion is eventual, not tied to that tick.
    pub async fn submit_payload(&self, payload: &[u8]) -> Result<u64, EngineError> {
        let next = self.reader.tip().map(|t| t.index.saturating_add(1)).unwrap_or(0);
        Ok(self.payloads.lock().await.push(payload, next)?)
    }

    /// Administrative re-entry of an excluded node with a fresh sequence range
    pub async fn readmit(&self, node: &NodeId, sequence_floor: u64) -> Result<Transition, EngineError> {
        let mut guard = self.state.write().await;
        let st = &mut *guard;
        let t = st.heartbeats.readmit(node, sequence_floor)?;
        st.registry.reset_sequence_floor(node, sequence_floor)?;
        if *node == self.node_id {
            st.emitter.restart_at(sequence_floor);
        }
        Ok(t)
    }

    pub async fn status(&self, node: &NodeId) -> NodeStatus {
        self.state.read().await.heartbeats.status(node)
    }

    /// Heartbeats relayed in from other regions. They are observed only and
    /// never count toward this region's liveness or quorum.
    pub async fn foreign_heartbeats(&self) -> BTreeMap<Region, u64> {
        self.state.read().await.foreign_heard.clone()
    }

    pub async fn trust(&self, node: &NodeId) -> Option<u8> {
        self.state.read().await.registry.get(node).map(|r| r.trust_score)
    }

    // =========================================================================
    // EVENT HANDLING
    // =========================================================================

    pub async fn handle_event(&self, event: EngineEvent) -> Result<(), EngineError> {
        match event {
            EngineEvent::Tick(view) => self.on_tick(view).await,
            EngineEvent::Message(envelope) => self.on_message(envelope).await,
            EngineEvent::EmitHeartbeat => self.on_emit().await,
        }
    }

    async fn on_tick(&self, view: ChainView) -> Result<(), EngineError> {
        let Some(tip) = view.tip().map(|t| t.index) else {
            return Ok(());
        };
        let mut announcements = Vec::new();
        {
            let mut guard = self.state.write().await;
            let st = &mut *guard;
            let from = match st.last_tick {
                Some(last) => last.saturating_add(1),
                // Joining a running chain: start at the current epoch's boundary
                None => {
                    let epoch = epoch_of(tip, self.config.epoch_length);
                    let start = boundary_index(epoch, self.config.epoch_length).unwrap_or(0);
                    start.max(view.first_index().unwrap_or(0))
                }
            };
            // The watch channel coalesces appends; walk every index we missed
            for index in from..=tip {
                let Some(entry) = view.entry_at(index) else { continue };
                if is_epoch_boundary(index, self.config.epoch_length) {
                    announcements.extend(self.on_boundary(st, entry));
                }
                if (index + 1) % self.config.window_ticks == 0 {
                    self.close_window(st, &view, index)?;
                }
            }
            st.last_tick = Some(tip);
        }
        for announcement in announcements {
            let bytes = WireMessage::VrfProof(announcement).encode()?;
            self.transport.broadcast(&self.region, bytes).await?;
        }
        Ok(())
    }

    fn on_boundary(&self, st: &mut State, entry: &PoHEntry) -> Option<VrfAnnouncement> {
        let epoch = epoch_of(entry.index, self.config.epoch_length);
        st.boundaries.insert(epoch, entry.clone());
        let candidates: Vec<_> = st.registry.active_in_region(&self.region).cloned().collect();
        match elect(entry, &candidates, &self.vrf) {
            Ok(proof) => {
                debug!(node = %self.node_id, epoch, output = %short_hex(proof.output.as_bytes()), "VRF evaluated");
                st.proofs.entry(epoch).or_default().insert(self.node_id.clone(), proof.clone());
                Some(VrfAnnouncement { epoch_id: epoch, region: self.region.clone(), boundary_index: entry.index, proof })
            }
            Err(e) => {
                debug!(node = %self.node_id, epoch, "Not standing for election: {}", e);
                None
            }
        }
    }

    fn run_election(
        &self,
        st: &State,
        epoch: u64,
        round: u32,
        excluded: &BTreeSet<NodeId>,
    ) -> Option<Result<ElectionOutcome, ElectionError>> {
        let boundary = st.boundaries.get(&epoch)?;
        let proofs: Vec<CandidateProof> = st.proofs.get(&epoch).map(|p| p.values().cloned().collect()).unwrap_or_default();
        let records: Vec<_> = st.registry.records().cloned().collect();
        let ballot = Ballot {
            boundary,
            epoch_id: epoch,
            epoch_length: self.config.epoch_length,
            region: &self.region,
            round,
            excluded,
        };
        Some(verify_and_select(&ballot, &records, &proofs))
    }

    fn record_schedule(&self, st: &mut State, schedule: LeaderSchedule) -> Result<(), EngineError> {
        match st.book.insert(schedule.clone()) {
            Ok(true) => {
                if let Some(storage) = &self.storage {
                    storage.put_schedule(&schedule)?;
                }
                self.notify(ConsensusEvent::LeaderElected(schedule));
            }
            Ok(false) => {}
            Err(e) => warn!(node = %self.node_id, "Schedule rejected: {}", e),
        }
        Ok(())
    }

    /// Decide round 0 of `epoch` once, from the proofs gathered so far
    fn settle_election(&self, st: &mut State, epoch: u64, now_ms: u64) -> Result<(), EngineError> {
        if st.book.active(epoch, &self.region).is_some() {
            return Ok(());
        }
        match self.run_election(st, epoch, 0, &BTreeSet::new()) {
            Some(Ok(outcome)) => {
                st.validator.penalize_invalid_proofs(&mut st.registry, &outcome.invalid, now_ms);
                self.record_schedule(st, outcome.schedule)?;
            }
            Some(Err(e)) => warn!(node = %self.node_id, epoch, "Election failed: {}", e),
            None => debug!(node = %self.node_id, epoch, "Boundary entry not seen, election skipped"),
        }
        Ok(())
    }

    fn reelect(&self, st: &mut State, request: &ReelectionRequest) -> Result<(), EngineError> {
        let mut excluded = st.book.deposed(request.epoch, &request.region);
        excluded.insert(request.exclude.clone());
        match self.run_election(st, request.epoch, request.round, &excluded) {
            Some(Ok(outcome)) => {
                info!(
                    epoch = request.epoch,
                    round = request.round,
                    deposed = %request.exclude,
                    leader = %outcome.schedule.leader_node_id,
                    "Re-election"
                );
                self.record_schedule(st, outcome.schedule)?;
            }
            Some(Err(e)) => warn!(epoch = request.epoch, round = request.round, "Re-election failed: {}", e),
            None => warn!(epoch = request.epoch, "Re-election impossible: boundary entry no longer retained"),
        }
        Ok(())
    }

    fn close_window(&self, st: &mut State, view: &ChainView, at_index: u64) -> Result<(), EngineError> {
        let now = now_millis();
        let epoch = epoch_of(at_index, self.config.epoch_length);
        self.settle_election(st, epoch, now)?;

        let report = st.heartbeats.close_window(&st.registry);
        st.validator.apply_window(&mut st.registry, &report, now);
        for node in &report.newly_excluded {
            self.notify(ConsensusEvent::NodeExcluded(node.clone()));
        }

        let from = st.validator.pending_from().max(view.first_index().unwrap_or(0));
        let segment = view.range(from..=at_index);
        let schedules: Vec<LeaderSchedule> = st.book.for_region(&self.region).cloned().collect();
        let finalization = st.validator.finalize(
            &mut st.registry,
            &segment,
            &report.heartbeats,
            &schedules,
            &Disqualified::from(&report),
            now,
        );

        if let FinalizationResult::Rejected(reason) = &finalization.result {
            if reason.is_integrity_violation() {
                warn!(node = %self.node_id, range = ?finalization.range, ?reason, "Segment failed integrity checks");
            }
            if !reason.is_retryable() {
                if let Some(last) = segment.last() {
                    st.validator.skip_to(last.clone());
                }
            }
        }
        if let Some(request) = &finalization.reelection {
            self.reelect(st, request)?;
        }

        st.proofs.retain(|e, _| e + 2 >= epoch);
        st.boundaries.retain(|e, _| e + 2 >= epoch);
        self.persist(st)?;
        st.last_finalization = Some(finalization.clone());
        self.notify(ConsensusEvent::Finalized(finalization));
        Ok(())
    }

    fn persist(&self, st: &mut State) -> Result<(), EngineError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        for record in st.registry.records() {
            storage.put_node(record)?;
            let history = st.registry.history(&record.node_id);
            let done = st.persisted_history.entry(record.node_id.clone()).or_insert(0);
            for event in &history[*done..] {
                storage.append_trust_event(&record.node_id, event)?;
            }
            *done = history.len();
        }
        Ok(())
    }

    async fn on_message(&self, envelope: Envelope) -> Result<(), EngineError> {
        let message = match WireMessage::decode(&envelope.bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(from = %envelope.from, "Undecodable message: {}", e);
                return Ok(());
            }
        };
        trace!(from = %envelope.from, command = message.command(), "Message received");
        match message {
            WireMessage::Heartbeat(hb) => self.on_heartbeat(hb, &envelope.from).await,
            WireMessage::VrfProof(announcement) => {
                self.on_announcement(announcement, &envelope.from).await;
                Ok(())
            }
        }
    }

    async fn on_announcement(&self, a: VrfAnnouncement, from: &NodeId) {
        if a.region != self.region || a.proof.node_id != *from {
            debug!(from = %from, "VRF announcement ignored");
            return;
        }
        if boundary_index(a.epoch_id, self.config.epoch_length) != Some(a.boundary_index) {
            return;
        }
        let current = self.reader.tip().map(|t| epoch_of(t.index, self.config.epoch_length)).unwrap_or(0);
        if a.epoch_id.saturating_add(EPOCH_HORIZON) < current || a.epoch_id > current.saturating_add(EPOCH_HORIZON) {
            return;
        }
        let mut st = self.state.write().await;
        st.proofs.entry(a.epoch_id).or_default().entry(a.proof.node_id.clone()).or_insert(a.proof);
    }

    async fn on_heartbeat(&self, hb: Heartbeat, from: &NodeId) -> Result<(), EngineError> {
        let view = self.reader.snapshot();
        let now = now_millis();
        let outgoing = {
            let mut guard = self.state.write().await;
            let st = &mut *guard;
            let Some(origin_region) = st.registry.get(&hb.node_id).map(|r| r.region.clone()) else {
                debug!(node = %hb.node_id, "Heartbeat from unknown node");
                return Ok(());
            };
            if origin_region != self.region {
                if st.foreign_seen.insert(MessageKey::of(&hb, self.config.heartbeat.dedup)) {
                    debug!(node = %hb.node_id, region = %origin_region, via = %from, "Foreign heartbeat");
                    *st.foreign_heard.entry(origin_region).or_insert(0) += 1;
                }
                return Ok(());
            }

            match st.heartbeats.ingest(&hb, from, &st.registry, &view, now) {
                Ok(accepted) => {
                    st.registry.set_last_accepted(&accepted.node_id, accepted.sequence)?;
                    let points = aggregation_points(
                        st.registry.records().filter(|r| r.active).map(|r| (&r.node_id, &r.region)),
                    );
                    let targets = relay_targets(
                        &self.node_id,
                        &self.region,
                        &hb.node_id,
                        from,
                        &points,
                        self.config.heartbeat.max_fanout,
                    );
                    if !targets.is_empty() {
                        let bytes = WireMessage::Heartbeat(hb).encode()?;
                        for target in targets {
                            st.relay.enqueue(target, bytes.clone());
                        }
                    }
                }
                Err(rejection) => debug!(node = %hb.node_id, "Heartbeat not accepted: {}", rejection),
            }
            st.relay.drain(self.config.heartbeat.max_fanout.max(1))
        };
        for (peer, bytes) in outgoing {
            if let Err(e) = self.transport.send(&peer, bytes).await {
                debug!(peer = %peer, "Relay failed: {}", e);
            }
        }
        Ok(())
    }

    async fn on_emit(&self) -> Result<(), EngineError> {
        let view = self.reader.snapshot();
        let Some(tip) = view.tip().cloned() else {
            return Ok(());
        };
        let now = now_millis();
        let bytes = {
            let mut guard = self.state.write().await;
            let st = &mut *guard;
            if st.heartbeats.state(&self.node_id) == LivenessState::Excluded {
                return Ok(());
            }
            if !st.registry.get(&self.node_id).is_some_and(|r| r.active) {
                return Ok(());
            }
            let hb = st.emitter.emit(&tip, now);
            debug!(node = %self.node_id, sequence = hb.sequence, slot = tip.index, at = %millis_to_string(now), "Heartbeat emitted");
            match st.heartbeats.ingest(&hb, &self.node_id, &st.registry, &view, now) {
                Ok(accepted) => st.registry.set_last_accepted(&accepted.node_id, accepted.sequence)?,
                Err(rejection) => debug!(node = %self.node_id, "Own heartbeat not accepted: {}", rejection),
            }
            WireMessage::Heartbeat(hb).encode()?
        };
        self.transport.broadcast(&self.region, bytes).await?;
        Ok(())
    }

    /// Load in [0, 1] for the adaptive heartbeat interval
    async fn load(&self, received_since_emit: u64) -> f64 {
        let pressure = self.state.read().await.relay.pressure();
        let traffic = received_since_emit as f64 / self.config.heartbeat.peer_queue_capacity.max(1) as f64;
        pressure.max(traffic).min(1.0)
    }

    // =========================================================================
    // MAIN LOOP
    // =========================================================================

    /// Run until `shutdown` flips to true, the chain writer goes away, or the
    /// inbox closes. Event errors are logged and do not stop the loop.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Envelope>, mut shutdown: watch::Receiver<bool>) {
        let mut reader = self.reader.clone();
        let mut next_emit = Instant::now();
        let mut received = 0u64;
        info!(node = %self.node_id, region = %self.region, "Engine started");

        loop {
            let result = tokio::select! {
                view = reader.changed() => match view {
                    Ok(view) => self.handle_event(EngineEvent::Tick(view)).await,
                    Err(_) => break,
                },
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => {
                        received += 1;
                        self.handle_event(EngineEvent::Message(envelope)).await
                    }
                    None => break,
                },
                _ = time::sleep_until(next_emit) => {
                    let result = self.handle_event(EngineEvent::EmitHeartbeat).await;
                    let load = self.load(received).await;
                    received = 0;
                    next_emit = Instant::now() + adaptive_interval(load, &self.config.heartbeat);
                    result
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(node = %self.node_id, "Event failed: {}", e);
            }
        }

        info!(node = %self.node_id, "Engine stopped");
    }
}
