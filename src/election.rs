//! VRF leader election
//!
//! Each region elects one leader per epoch from the first entry of that epoch.
//!
//! ```text
//! input   = "PULSECHAIN_ELECTION_V1:" ‖ boundary.hash ‖ boundary.index_le
//! prove   = VRF(sk, input)                                  (every candidate)
//! seed    = SHA3("PULSECHAIN_DRAW_V1" ‖ boundary.hash ‖ epoch ‖ region ‖ round
//!                ‖ (node_id ‖ output) for each valid candidate, sorted by node_id)
//! weight  = stake_weight × trust_score
//! order   = (output as integer, node_id) ascending
//! leader  = first candidate whose cumulative weight exceeds ChaCha20(seed) mod total
//! ```
//!
//! The seed mixes every valid output, so no single candidate picks the draw.
//! Everything above is a pure function of the boundary entry and the
//! (record, proof) set: two nodes holding the same set compute the same
//! schedule.

use crate::crypto::sha3_parts;
use crate::types::{short_hex, Hash, LeaderSchedule, NodeId, NodeRecord, PoHEntry, Region};
use crate::vrf::{self, VrfOutput, VrfProof, VrfSecret};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

const DOMAIN_INPUT: &[u8] = b"PULSECHAIN_ELECTION_V1:";
const DOMAIN_DRAW: &[u8] = b"PULSECHAIN_DRAW_V1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElectionError {
    #[error("key does not belong to any candidate")]
    NotACandidate,
    #[error("no valid candidates for epoch {epoch} in {region}")]
    NoValidCandidates { epoch: u64, region: Region },
    #[error("entry {index} is not the boundary of epoch {epoch}")]
    NotBoundary { index: u64, epoch: u64 },
    #[error("conflicting schedule for epoch {epoch} in {region}, round {round}")]
    Conflict { epoch: u64, region: Region, round: u32 },
}

// =============================================================================
// EPOCHS
// =============================================================================

pub fn epoch_of(index: u64, epoch_length: u64) -> u64 {
    index / epoch_length.max(1)
}

pub fn is_epoch_boundary(index: u64, epoch_length: u64) -> bool {
    index % epoch_length.max(1) == 0
}

/// Index of the entry that seeds `epoch`
pub fn boundary_index(epoch: u64, epoch_length: u64) -> Option<u64> {
    epoch.checked_mul(epoch_length.max(1))
}

pub fn election_input(boundary: &PoHEntry) -> Vec<u8> {
    input_for(&boundary.hash, boundary.index)
}

fn input_for(hash: &Hash, index: u64) -> Vec<u8> {
    let mut input = Vec::with_capacity(DOMAIN_INPUT.len() + 40);
    input.extend_from_slice(DOMAIN_INPUT);
    input.extend_from_slice(hash);
    input.extend_from_slice(&index.to_le_bytes());
    input
}

// =============================================================================
// PROVING
// =============================================================================

/// A candidate's announced VRF evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateProof {
    pub node_id: NodeId,
    pub output: VrfOutput,
    pub proof: VrfProof,
}

/// Evaluate the VRF over `boundary` with our key.
///
/// The key must belong to one of `candidates`.
pub fn elect(
    boundary: &PoHEntry,
    candidates: &[NodeRecord],
    key: &VrfSecret,
) -> Result<CandidateProof, ElectionError> {
    let public = key.public_key();
    let me = candidates
        .iter()
        .find(|c| c.vrf_public_key == public)
        .ok_or(ElectionError::NotACandidate)?;
    let (output, proof) = key.prove(&election_input(boundary));
    Ok(CandidateProof { node_id: me.node_id.clone(), output, proof })
}

// =============================================================================
// SELECTION
// =============================================================================

/// Which election is being decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ballot<'a> {
    pub boundary: &'a PoHEntry,
    pub epoch_id: u64,
    pub epoch_length: u64,
    pub region: &'a Region,
    pub round: u32,
    /// Leaders removed by earlier rounds
    pub excluded: &'a BTreeSet<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOutcome {
    pub schedule: LeaderSchedule,
    /// Candidates whose proof failed; the caller penalizes them
    pub invalid: Vec<NodeId>,
}

struct Contender<'a> {
    record: &'a NodeRecord,
    proof: &'a CandidateProof,
    weight: u128,
}

/// Verify every proof and draw the leader for `ballot`.
///
/// Only active records of the ballot's region are eligible. Proofs from unknown
/// nodes are ignored; proofs that fail verification are reported in
/// [`ElectionOutcome::invalid`].
pub fn verify_and_select(
    ballot: &Ballot<'_>,
    records: &[NodeRecord],
    proofs: &[CandidateProof],
) -> Result<ElectionOutcome, ElectionError> {
    if boundary_index(ballot.epoch_id, ballot.epoch_length) != Some(ballot.boundary.index) {
        return Err(ElectionError::NotBoundary { index: ballot.boundary.index, epoch: ballot.epoch_id });
    }

    let eligible: BTreeMap<&NodeId, &NodeRecord> = records
        .iter()
        .filter(|r| r.active && &r.region == ballot.region && !ballot.excluded.contains(&r.node_id))
        .map(|r| (&r.node_id, r))
        .collect();

    // first proof per node, in node_id order
    let mut by_node: BTreeMap<&NodeId, &CandidateProof> = BTreeMap::new();
    for p in proofs {
        if eligible.contains_key(&p.node_id) {
            by_node.entry(&p.node_id).or_insert(p);
        }
    }

    let input = election_input(ballot.boundary);
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for (node_id, proof) in by_node {
        let record = eligible[node_id];
        match vrf::check(node_id, &proof.output, &proof.proof, &input, &record.vrf_public_key) {
            Ok(()) => {
                let weight = record.stake_weight as u128 * record.trust_score as u128;
                valid.push(Contender { record, proof, weight });
            }
            Err(e) => {
                warn!(epoch = ballot.epoch_id, region = %ballot.region, "{}", e);
                invalid.push(node_id.clone());
            }
        }
    }

    if valid.is_empty() {
        return Err(ElectionError::NoValidCandidates { epoch: ballot.epoch_id, region: ballot.region.clone() });
    }

    let seed = draw_seed(ballot, &valid);
    valid.sort_by(|a, b| {
        a.proof.output.cmp(&b.proof.output).then_with(|| a.record.node_id.cmp(&b.record.node_id))
    });

    let total: u128 = valid.iter().map(|c| c.weight).sum();
    let winner = if total == 0 {
        valid.iter().min_by(|a, b| a.record.node_id.cmp(&b.record.node_id))
    } else {
        let target = ChaCha20Rng::from_seed(seed).gen_range(0..total);
        let mut cumulative = 0u128;
        valid.iter().find(|c| {
            cumulative += c.weight;
            cumulative > target
        })
    };
    let Some(winner) = winner else {
        return Err(ElectionError::NoValidCandidates { epoch: ballot.epoch_id, region: ballot.region.clone() });
    };

    let schedule = LeaderSchedule {
        epoch_id: ballot.epoch_id,
        region: ballot.region.clone(),
        round: ballot.round,
        leader_node_id: winner.record.node_id.clone(),
        vrf_output: winner.proof.output.0,
        vrf_proof: winner.proof.proof.to_bytes().to_vec(),
        boundary_index: ballot.boundary.index,
        boundary_hash: ballot.boundary.hash,
    };

    info!(
        epoch = schedule.epoch_id,
        region = %schedule.region,
        round = schedule.round,
        leader = %schedule.leader_node_id,
        candidates = valid.len(),
        output = %short_hex(&schedule.vrf_output),
        "Leader elected"
    );
    Ok(ElectionOutcome { schedule, invalid })
}

fn draw_seed(ballot: &Ballot<'_>, valid: &[Contender<'_>]) -> Hash {
    let mut sorted: Vec<&Contender<'_>> = valid.iter().collect();
    sorted.sort_by(|a, b| a.record.node_id.cmp(&b.record.node_id));

    let epoch = ballot.epoch_id.to_le_bytes();
    let round = ballot.round.to_le_bytes();
    let mut parts: Vec<&[u8]> = vec![
        &ballot.boundary.hash,
        &epoch,
        ballot.region.as_str().as_bytes(),
        &round,
    ];
    for c in &sorted {
        parts.push(c.record.node_id.as_str().as_bytes());
        parts.push(c.proof.output.as_bytes());
    }
    sha3_parts(DOMAIN_DRAW, &parts)
}

/// Check a stored schedule's proof against the leader's key
pub fn verify_schedule(schedule: &LeaderSchedule, leader: &NodeRecord) -> bool {
    if schedule.leader_node_id != leader.node_id {
        return false;
    }
    let Some(proof) = VrfProof::from_slice(&schedule.vrf_proof) else {
        return false;
    };
    let input = input_for(&schedule.boundary_hash, schedule.boundary_index);
    vrf::verify(&VrfOutput(schedule.vrf_output), &proof, &input, &leader.vrf_public_key)
}

// =============================================================================
// SCHEDULE BOOK
// =============================================================================

/// All schedules, at most one per (epoch, region, round). The highest round of
/// an (epoch, region) is the active one.
#[derive(Debug, Default, Clone)]
pub struct ScheduleBook {
    schedules: BTreeMap<(u64, Region), BTreeMap<u32, LeaderSchedule>>,
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the identical schedule was already recorded.
    pub fn insert(&mut self, schedule: LeaderSchedule) -> Result<bool, ElectionError> {
        let rounds = self.schedules.entry((schedule.epoch_id, schedule.region.clone())).or_default();
        match rounds.get(&schedule.round) {
            Some(existing) if *existing == schedule => Ok(false),
            Some(_) => Err(ElectionError::Conflict {
                epoch: schedule.epoch_id,
                region: schedule.region,
                round: schedule.round,
            }),
            None => {
                rounds.insert(schedule.round, schedule);
                Ok(true)
            }
        }
    }

    pub fn active(&self, epoch: u64, region: &Region) -> Option<&LeaderSchedule> {
        self.schedules
            .get(&(epoch, region.clone()))
            .and_then(|rounds| rounds.last_key_value())
            .map(|(_, s)| s)
    }

    /// Active schedule of the latest epoch not after `epoch`
    pub fn latest_up_to(&self, epoch: u64, region: &Region) -> Option<&LeaderSchedule> {
        self.schedules
            .range(..=(epoch, region.clone()))
            .rev()
            .filter(|((_, r), _)| r == region)
            .find_map(|(_, rounds)| rounds.last_key_value().map(|(_, s)| s))
    }

    pub fn next_round(&self, epoch: u64, region: &Region) -> u32 {
        self.active(epoch, region).map(|s| s.round.saturating_add(1)).unwrap_or(0)
    }

    /// Leaders already removed from (epoch, region) by re-elections
    pub fn deposed(&self, epoch: u64, region: &Region) -> BTreeSet<NodeId> {
        let Some(rounds) = self.schedules.get(&(epoch, region.clone())) else {
            return BTreeSet::new();
        };
        let active = rounds.keys().next_back().copied();
        rounds
            .iter()
            .filter(|(round, _)| Some(**round) != active)
            .map(|(_, s)| s.leader_node_id.clone())
            .collect()
    }

    /// All schedules of one region, oldest first
    pub fn for_region<'a>(&'a self, region: &'a Region) -> impl Iterator<Item = &'a LeaderSchedule> + 'a {
        self.schedules
            .iter()
            .filter(move |((_, r), _)| r == region)
            .flat_map(|(_, rounds)| rounds.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poh::tick;
    use crate::types::EnvironmentalSnapshot;

    fn boundary() -> PoHEntry {
        let snap = EnvironmentalSnapshot {
            tick_index: 0,
            source_ids: vec![],
            weighted_digest: [3u8; 32],
            raw_values: vec![],
        };
        tick(None, &snap, vec![], 0).unwrap()
    }

    fn node(i: u8, stake: u64, trust: u8) -> (NodeRecord, VrfSecret) {
        let key = VrfSecret::from_seed([i; 32]);
        let record = NodeRecord::new(
            NodeId::new(format!("node-{i}")),
            vec![],
            key.public_key(),
            Region::from("eu"),
            stake,
            trust,
        );
        (record, key)
    }

    fn setup(n: u8) -> (Vec<NodeRecord>, Vec<CandidateProof>) {
        let b = boundary();
        let nodes: Vec<_> = (1..=n).map(|i| node(i, 100, 50)).collect();
        let records: Vec<_> = nodes.iter().map(|(r, _)| r.clone()).collect();
        let proofs = nodes.iter().map(|(_, k)| elect(&b, &records, k).unwrap()).collect();
        (records, proofs)
    }

    #[test]
    fn test_selection_is_deterministic() {
        let b = boundary();
        let region = Region::from("eu");
        let excluded = BTreeSet::new();
        let ballot = Ballot { boundary: &b, epoch_id: 0, epoch_length: 64, region: &region, round: 0, excluded: &excluded };
        let (records, proofs) = setup(5);
        let a = verify_and_select(&ballot, &records, &proofs).unwrap();
        let mut reversed = proofs.clone();
        reversed.reverse();
        let b2 = verify_and_select(&ballot, &records, &reversed).unwrap();
        assert_eq!(a, b2);
        assert!(a.invalid.is_empty());
        assert!(verify_schedule(&a.schedule, records.iter().find(|r| r.node_id == a.schedule.leader_node_id).unwrap()));
    }

    #[test]
    fn test_invalid_proof_excluded() {
        let b = boundary();
        let region = Region::from("eu");
        let excluded = BTreeSet::new();
        let ballot = Ballot { boundary: &b, epoch_id: 0, epoch_length: 64, region: &region, round: 0, excluded: &excluded };
        let (records, mut proofs) = setup(3);
        proofs[0].output.0[0] ^= 1;
        let outcome = verify_and_select(&ballot, &records, &proofs).unwrap();
        assert_eq!(outcome.invalid, vec![NodeId::from("node-1")]);
        assert_ne!(outcome.schedule.leader_node_id, NodeId::from("node-1"));
    }

    #[test]
    fn test_zero_weight_falls_back_to_lowest_id() {
        let b = boundary();
        let region = Region::from("eu");
        let excluded = BTreeSet::new();
        let ballot = Ballot { boundary: &b, epoch_id: 0, epoch_length: 64, region: &region, round: 0, excluded: &excluded };
        let nodes: Vec<_> = [3u8, 1, 2].iter().map(|&i| node(i, 0, 50)).collect();
        let records: Vec<_> = nodes.iter().map(|(r, _)| r.clone()).collect();
        let proofs: Vec<_> = nodes.iter().map(|(_, k)| elect(&b, &records, k).unwrap()).collect();
        let outcome = verify_and_select(&ballot, &records, &proofs).unwrap();
        assert_eq!(outcome.schedule.leader_node_id, NodeId::from("node-1"));
    }

    #[test]
    fn test_only_weighted_candidate_wins() {
        let b = boundary();
        let region = Region::from("eu");
        let excluded = BTreeSet::new();
        let ballot = Ballot { boundary: &b, epoch_id: 0, epoch_length: 64, region: &region, round: 0, excluded: &excluded };
        let nodes = vec![node(1, 0, 50), node(2, 100, 0), node(3, 10, 10)];
        let records: Vec<_> = nodes.iter().map(|(r, _)| r.clone()).collect();
        let proofs: Vec<_> = nodes.iter().map(|(_, k)| elect(&b, &records, k).unwrap()).collect();
        let outcome = verify_and_select(&ballot, &records, &proofs).unwrap();
        assert_eq!(outcome.schedule.leader_node_id, NodeId::from("node-3"));
    }

    #[test]
    fn test_excluded_and_foreign_nodes_ignored() {
        let b = boundary();
        let region = Region::from("eu");
        let (mut records, proofs) = setup(3);
        records[1].region = Region::from("us");
        let excluded = BTreeSet::from([NodeId::from("node-1")]);
        let ballot = Ballot { boundary: &b, epoch_id: 0, epoch_length: 64, region: &region, round: 1, excluded: &excluded };
        let outcome = verify_and_select(&ballot, &records, &proofs).unwrap();
        assert_eq!(outcome.schedule.leader_node_id, NodeId::from("node-3"));
        assert_eq!(outcome.schedule.round, 1);
    }

    #[test]
    fn test_no_candidates() {
        let b = boundary();
        let region = Region::from("eu");
        let excluded = BTreeSet::new();
        let ballot = Ballot { boundary: &b, epoch_id: 0, epoch_length: 64, region: &region, round: 0, excluded: &excluded };
        assert!(matches!(verify_and_select(&ballot, &[], &[]), Err(ElectionError::NoValidCandidates { .. })));
    }

    #[test]
    fn test_elect_requires_membership() {
        let (records, _) = setup(2);
        let stranger = VrfSecret::from_seed([99; 32]);
        assert_eq!(elect(&boundary(), &records, &stranger), Err(ElectionError::NotACandidate));
    }

    #[test]
    fn test_schedule_book() {
        let b = boundary();
        let region = Region::from("eu");
        let excluded = BTreeSet::new();
        let ballot = Ballot { boundary: &b, epoch_id: 0, epoch_length: 64, region: &region, round: 0, excluded: &excluded };
        let (records, proofs) = setup(3);
        let s0 = verify_and_select(&ballot, &records, &proofs).unwrap().schedule;

        let mut book = ScheduleBook::new();
        assert_eq!(book.insert(s0.clone()), Ok(true));
        assert_eq!(book.insert(s0.clone()), Ok(false));

        let mut forged = s0.clone();
        forged.leader_node_id = NodeId::from("mallory");
        assert!(matches!(book.insert(forged), Err(ElectionError::Conflict { .. })));

        assert_eq!(book.next_round(0, &region), 1);
        let mut s1 = s0.clone();
        s1.round = 1;
        s1.leader_node_id = NodeId::from("node-x");
        book.insert(s1.clone()).unwrap();
        assert_eq!(book.active(0, &region), Some(&s1));
        assert_eq!(book.deposed(0, &region), BTreeSet::from([s0.leader_node_id.clone()]));
        assert_eq!(book.latest_up_to(5, &region), Some(&s1));
        assert_eq!(book.latest_up_to(5, &Region::from("us")), None);
    }

    #[test]
    fn test_epoch_math() {
        assert_eq!(epoch_of(63, 64), 0);
        assert_eq!(epoch_of(64, 64), 1);
        assert!(is_epoch_boundary(128, 64));
        assert!(!is_epoch_boundary(129, 64));
        assert_eq!(boundary_index(3, 64), Some(192));
        assert_eq!(boundary_index(u64::MAX, 64), None);
    }
}
