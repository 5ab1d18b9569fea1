//! End-to-end scenarios through the public API
//!
//! Chain integrity, aggregation determinism, heartbeat replay and staleness,
//! VRF verifiability, election determinism and quorum finalization.

use async_trait::async_trait;
use proptest::prelude::*;
use pulsechain::config::{HeartbeatPolicy, OutlierPolicy, QuorumMode, QuorumPolicy, TrustPolicy};
use pulsechain::election::{election_input, Ballot};
use pulsechain::error::TimingError;
use pulsechain::heartbeat::liveness::LivenessState;
use pulsechain::heartbeat::HeartbeatRejection;
use pulsechain::validator::{Disqualified, RejectReason};
use pulsechain::vrf::{self, VrfOutput, VrfSecret};
use pulsechain::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const NOW: u64 = 1_700_000_000_000;

mod common {
    use super::*;

    pub fn snapshot(i: u64) -> EnvironmentalSnapshot {
        EnvironmentalSnapshot { tick_index: i, source_ids: vec![], weighted_digest: sha3(&i.to_le_bytes()), raw_values: vec![] }
    }

    pub fn chain(n: u64) -> PohLog {
        let mut log = PohLog::new(Region::from("eu"), 1_024);
        for i in 0..n {
            let entry = tick(log.tip(), &snapshot(i), vec![], NOW + i * 400).unwrap();
            log.append(entry).unwrap();
        }
        log
    }

    /// Five equal-stake nodes of region "eu"
    pub struct Region5 {
        pub registry: NodeRegistry,
        pub emitters: Vec<HeartbeatEmitter>,
        pub vrf: Vec<VrfSecret>,
    }

    pub fn region5(stake: u64) -> Region5 {
        let mut registry = NodeRegistry::new(TrustPolicy::default());
        let mut emitters = Vec::new();
        let mut vrf = Vec::new();
        for i in 0..5 {
            let identity = NodeIdentity::generate(NodeId::new(format!("node-{i}")), Region::from("eu"));
            registry.register(identity.record(stake, 50)).unwrap();
            let NodeIdentity { node_id, keypair, vrf: secret, .. } = identity;
            emitters.push(HeartbeatEmitter::new(node_id, keypair, 0));
            vrf.push(secret);
        }
        Region5 { registry, emitters, vrf }
    }

    pub fn elect_epoch0(net: &Region5, boundary: &PoHEntry) -> LeaderSchedule {
        let records: Vec<NodeRecord> = net.registry.records().cloned().collect();
        let proofs: Vec<CandidateProof> = net.vrf.iter().map(|k| elect(boundary, &records, k).unwrap()).collect();
        let excluded = BTreeSet::new();
        let region = Region::from("eu");
        let ballot = Ballot { boundary, epoch_id: 0, epoch_length: 64, region: &region, round: 0, excluded: &excluded };
        verify_and_select(&ballot, &records, &proofs).unwrap().schedule
    }

    pub fn index_of(node: &NodeId) -> usize {
        node.as_str().trim_start_matches("node-").parse().unwrap()
    }
}

use common::*;

// =============================================================================
// CHAIN
// =============================================================================

#[test]
fn test_genesis_then_ten_ticks() {
    let log = chain(11);
    let entries = log.export(0..=10);
    assert_eq!(entries.len(), 11);
    assert_eq!(entries[0].previous_hash, ZERO_HASH);
    assert!(entries.windows(2).all(|w| w[1].index == w[0].index + 1 && w[1].previous_hash == w[0].hash));
    assert!(verify_chain(&entries));
}

proptest! {
    #[test]
    fn prop_single_byte_mutation_breaks_chain(entry in 0usize..8, field in 0usize..4, byte in 0usize..32, flip in 1u8..=255) {
        let mut entries = chain(8).export(0..=7);
        let target = &mut entries[entry];
        let bytes = match field {
            0 => &mut target.previous_hash,
            1 => &mut target.env_digest,
            2 => &mut target.payload_digest,
            _ => &mut target.hash,
        };
        bytes[byte] ^= flip;
        prop_assert!(!verify_chain(&entries));
    }
}

// =============================================================================
// AGGREGATION
// =============================================================================

fn sources() -> Vec<SourceSpec> {
    vec![SourceSpec::new("weather", 0.5), SourceSpec::new("seismic", 0.25), SourceSpec::new("acoustic", 0.25)]
}

fn reading_strategy() -> impl Strategy<Value = EnvironmentalReading> {
    (0usize..3, -20.0f64..40.0, 0.0f64..100.0, 950.0f64..1_050.0, 0u64..5_000).prop_map(|(s, t, h, p, age)| {
        let spec = &sources()[s];
        let mut r = EnvironmentalReading::new(spec.source_id.clone(), NOW - age, spec.weight);
        r.temperature = Some(t);
        r.humidity = Some(h);
        r.pressure = Some(p);
        r
    })
}

proptest! {
    #[test]
    fn prop_aggregate_ignores_arrival_order(
        (readings, shuffled) in prop::collection::vec(reading_strategy(), 0..8)
            .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
    ) {
        let base = Aggregator::new(&sources(), 0.001).unwrap();
        let a = base.clone().aggregate(readings, 3, NOW);
        let b = base.clone().aggregate(shuffled, 3, NOW);
        prop_assert_eq!(a, b);
    }
}

struct FixedSource;

#[async_trait]
impl EnvironmentalSource for FixedSource {
    async fn fetch(&self, source_id: &str, as_of_ms: u64) -> Result<EnvironmentalReading, Unavailable> {
        let weight = sources().into_iter().find(|s| s.source_id == source_id).map(|s| s.weight).unwrap_or(0.0);
        let mut r = EnvironmentalReading::new(source_id, as_of_ms, weight);
        r.temperature = Some(21.5);
        Ok(r)
    }
}

#[tokio::test]
async fn test_sequencer_folds_payloads_into_ticks() {
    let payloads = Arc::new(Mutex::new(PayloadQueue::new(2, 16)));
    let aggregator = Aggregator::new(&sources(), 0.001).unwrap();
    let mut seq = Sequencer::new(
        PohLog::new(Region::from("eu"), 64),
        aggregator,
        Arc::new(FixedSource),
        Arc::clone(&payloads),
        Duration::from_millis(400),
    );
    for p in [&b"a"[..], b"b", b"c"] {
        payloads.lock().await.push(p, 0).unwrap();
    }
    let genesis = seq.step().await.unwrap();
    let second = seq.step().await.unwrap();
    assert_eq!(genesis.payload_hashes.len(), 2);
    assert_eq!(second.payload_hashes.len(), 1);
    assert_ne!(genesis.env_digest, ZERO_HASH);

    let proof = MerkleTree::new(genesis.payload_hashes.clone()).proof(1).unwrap();
    assert!(proof.verify(merkle::payload_hash(b"b"), genesis.payload_digest));
    assert!(verify_chain(&seq.log().export(0..=1)));
}

// =============================================================================
// HEARTBEATS
// =============================================================================

#[test]
fn test_replayed_sequence_is_rejected() {
    let mut net = region5(20);
    let log = chain(20);
    let view = log.reader().snapshot();
    let tip = view.tip().unwrap().clone();
    let mut engine = HeartbeatEngine::new(Region::from("eu"), HeartbeatPolicy::default(), OutlierPolicy::default());

    let first = net.emitters[0].emit(&tip, NOW);
    let second = net.emitters[0].emit(&tip, NOW);
    engine.ingest(&second, &second.node_id, &net.registry, &view, NOW).unwrap();
    let err = engine.ingest(&first, &first.node_id, &net.registry, &view, NOW).unwrap_err();
    assert!(matches!(err, HeartbeatRejection::Timing { source: TimingError::Replay { sequence: 1, last: 2 }, .. }));
    assert!(matches!(engine.state(&NodeId::from("node-0")), LivenessState::Suspected { .. }));
}

#[test]
fn test_forged_heartbeats_do_not_cost_the_named_node_trust() {
    let mut net = region5(20);
    let log = chain(20);
    let view = log.reader().snapshot();
    let tip = view.tip().unwrap().clone();
    let mut engine = HeartbeatEngine::new(Region::from("eu"), HeartbeatPolicy::default(), OutlierPolicy::default());
    let validator = Validator::new(Region::from("eu"), QuorumPolicy::default(), 64);
    let victim = NodeId::from("node-0");
    let sender = NodeId::from("node-1");

    for window in 0..10u64 {
        let junk = Heartbeat {
            poh_slot: tip.index,
            poh_hash: tip.hash,
            node_id: victim.clone(),
            sequence: window + 1,
            timestamp: NOW,
            signature: vec![0; 10],
        };
        let err = engine.ingest(&junk, &sender, &net.registry, &view, NOW).unwrap_err();
        assert!(matches!(err, HeartbeatRejection::Signature(_)));
        let report = engine.close_window(&net.registry);
        assert_eq!(report.signature_failures, vec![sender.clone()]);
        validator.apply_window(&mut net.registry, &report, NOW);
    }

    let record = net.registry.get(&victim).unwrap();
    assert_eq!(record.trust_score, 50);
    assert!(record.active);
    assert!(net.registry.get(&sender).unwrap().trust_score < 50);
}

#[test]
fn test_stale_slot_suspects_and_loses_quorum_weight() {
    let mut net = region5(20);
    let log = chain(60);
    let view = log.reader().snapshot();
    let entries = log.export(0..=59);
    let schedule = elect_epoch0(&net, &entries[0]);
    let leader = index_of(&schedule.leader_node_id);
    let stale = (leader + 1) % 5;
    let stale_id = NodeId::new(format!("node-{stale}"));

    let mut engine = HeartbeatEngine::new(Region::from("eu"), HeartbeatPolicy::default(), OutlierPolicy::default());
    // tip is 59, slot 9 is 50 behind with K = 10
    let old = net.emitters[stale].emit(&entries[9], NOW);
    let err = engine.ingest(&old, &old.node_id, &net.registry, &view, NOW).unwrap_err();
    assert!(matches!(err, HeartbeatRejection::Timing { source: TimingError::StaleSlot { slot: 9, .. }, .. }));
    assert!(matches!(engine.state(&stale_id), LivenessState::Suspected { .. }));

    // A fresh heartbeat later in the same window still does not count
    for i in 0..5 {
        let hb = net.emitters[i].emit(&entries[59], NOW);
        engine.ingest(&hb, &hb.node_id, &net.registry, &view, NOW).unwrap();
    }
    let report = engine.close_window(&net.registry);
    assert!(report.suspected.contains(&stale_id));

    let mut validator = Validator::new(Region::from("eu"), QuorumPolicy { mode: QuorumMode::Stake, threshold_percent: 60 }, 64);
    let f = validator.finalize(
        &mut net.registry,
        &entries,
        &report.heartbeats,
        &[schedule],
        &Disqualified::from(&report),
        NOW,
    );
    assert_eq!(f.result, FinalizationResult::Confirmed(SegmentRange { first: 0, last: 59 }));
    assert_eq!(f.contributors.len(), 4);
    assert!(!f.contributors.contains(&stale_id));
}

// =============================================================================
// ELECTION
// =============================================================================

#[test]
fn test_vrf_verifies_only_for_its_key_and_output() {
    let log = chain(1);
    let input = election_input(log.tip().unwrap());
    let mine = VrfSecret::from_seed([1u8; 32]);
    let theirs = VrfSecret::from_seed([2u8; 32]);

    let (output, proof) = mine.prove(&input);
    assert!(vrf::verify(&output, &proof, &input, &mine.public_key()));
    assert!(!vrf::verify(&output, &proof, &input, &theirs.public_key()));

    let (their_output, their_proof) = theirs.prove(&input);
    assert!(!vrf::verify(&their_output, &their_proof, &input, &mine.public_key()));

    let mut tampered = output.0;
    tampered[0] ^= 1;
    assert!(!vrf::verify(&VrfOutput(tampered), &proof, &input, &mine.public_key()));
}

#[test]
fn test_election_is_deterministic_across_nodes() {
    let net = region5(20);
    let log = chain(1);
    let boundary = log.tip().unwrap().clone();
    let records: Vec<NodeRecord> = net.registry.records().cloned().collect();
    let proofs: Vec<CandidateProof> = net.vrf.iter().map(|k| elect(&boundary, &records, k).unwrap()).collect();
    let mut reversed = proofs.clone();
    reversed.reverse();

    let excluded = BTreeSet::new();
    let region = Region::from("eu");
    let ballot = Ballot { boundary: &boundary, epoch_id: 0, epoch_length: 64, region: &region, round: 0, excluded: &excluded };
    let a = verify_and_select(&ballot, &records, &proofs).unwrap();
    let b = verify_and_select(&ballot, &records, &reversed).unwrap();
    assert_eq!(a.schedule, b.schedule);
    assert!(a.invalid.is_empty());

    let mut book = ScheduleBook::new();
    assert!(book.insert(a.schedule.clone()).unwrap());
    assert!(!book.insert(b.schedule).unwrap());
    assert_eq!(book.active(0, &region), Some(&a.schedule));
}

// =============================================================================
// FINALIZATION
// =============================================================================

#[test]
fn test_two_of_five_at_sixty_percent_is_held() {
    let mut net = region5(20);
    let entries = chain(8).export(0..=7);
    let schedule = elect_epoch0(&net, &entries[0]);
    let leader = index_of(&schedule.leader_node_id);
    let other = (leader + 1) % 5;
    let hbs: Vec<Heartbeat> = [leader, other].iter().map(|&i| net.emitters[i].emit(&entries[4], NOW)).collect();

    let mut validator = Validator::new(Region::from("eu"), QuorumPolicy { mode: QuorumMode::Stake, threshold_percent: 60 }, 64);
    let f = validator.finalize(&mut net.registry, &entries, &hbs, &[schedule], &Disqualified::default(), NOW);
    assert_eq!(f.result, FinalizationResult::Rejected(RejectReason::InsufficientQuorum { have: 40, need: 60 }));
    assert!(f.reelection.is_none());
    assert_eq!(validator.pending_from(), 0);
    assert!(validator.latest_confirmed().is_none());
}
