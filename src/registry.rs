//! Node registry and trust history

use crate::config::TrustPolicy;
use crate::types::{NodeId, NodeRecord, Region, TRUST_MAX, TRUST_MIN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node {0} already registered")]
    Duplicate(NodeId),
    #[error("unknown node {0}")]
    Unknown(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustReason {
    InvalidVrfProof,
    Outlier,
    BadSignature,
    LeaderFault,
    Suspected,
    Confirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEvent {
    pub at_ms: u64,
    pub delta: i16,
    pub reason: TrustReason,
    pub score_after: u8,
}

#[derive(Debug, Clone)]
pub struct NodeRegistry {
    records: BTreeMap<NodeId, NodeRecord>,
    history: BTreeMap<NodeId, Vec<TrustEvent>>,
    streaks: BTreeMap<NodeId, u32>,
    policy: TrustPolicy,
}

impl NodeRegistry {
    pub fn new(policy: TrustPolicy) -> Self {
        Self { records: BTreeMap::new(), history: BTreeMap::new(), streaks: BTreeMap::new(), policy }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn register(&mut self, record: NodeRecord) -> Result<(), RegistryError> {
        if self.records.contains_key(&record.node_id) {
            return Err(RegistryError::Duplicate(record.node_id));
        }
        info!(node = %record.node_id, region = %record.region, stake = record.stake_weight, trust = record.trust_score, "Node registered");
        self.records.insert(record.node_id.clone(), record);
        Ok(())
    }

    pub fn get(&self, node: &NodeId) -> Option<&NodeRecord> {
        self.records.get(node)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.values()
    }

    /// Active records of `region`, in node_id order
    pub fn active_in_region<'a, 'b>(&'a self, region: &'b Region) -> impl Iterator<Item = &'a NodeRecord> + use<'a, 'b> {
        self.records.values().filter(move |r| r.active && &r.region == region)
    }

    /// Lowest active node_id of the region
    pub fn aggregation_point(&self, region: &Region) -> Option<&NodeId> {
        self.active_in_region(region).next().map(|r| &r.node_id)
    }

    pub fn history(&self, node: &NodeId) -> &[TrustEvent] {
        self.history.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Written by the heartbeat engine only
    pub fn set_last_accepted(&mut self, node: &NodeId, sequence: u64) -> Result<(), RegistryError> {
        let record = self.records.get_mut(node).ok_or_else(|| RegistryError::Unknown(node.clone()))?;
        record.last_accepted_sequence = record.last_accepted_sequence.max(sequence);
        Ok(())
    }

    /// Readmission starts a new sequence range; the record follows the engine
    pub fn reset_sequence_floor(&mut self, node: &NodeId, floor: u64) -> Result<(), RegistryError> {
        let record = self.records.get_mut(node).ok_or_else(|| RegistryError::Unknown(node.clone()))?;
        record.last_accepted_sequence = floor.saturating_sub(1);
        Ok(())
    }

    fn penalty(&self, reason: TrustReason) -> u8 {
        match reason {
            TrustReason::InvalidVrfProof => self.policy.invalid_vrf_penalty,
            TrustReason::Outlier => self.policy.outlier_penalty,
            TrustReason::BadSignature => self.policy.bad_signature_penalty,
            TrustReason::LeaderFault => self.policy.leader_fault_penalty,
            TrustReason::Suspected => self.policy.suspect_penalty,
            TrustReason::Confirmation => 0,
        }
    }

    /// Decrease trust for a detected violation; resets the recovery streak.
    /// Trust at zero marks the node inactive.
    pub fn penalize(&mut self, node: &NodeId, reason: TrustReason, at_ms: u64) -> Option<TrustEvent> {
        let amount = self.penalty(reason);
        self.streaks.remove(node);
        let record = self.records.get_mut(node)?;
        let before = record.trust_score;
        record.trust_score = before.saturating_sub(amount).max(TRUST_MIN);
        let event = TrustEvent {
            at_ms,
            delta: record.trust_score as i16 - before as i16,
            reason,
            score_after: record.trust_score,
        };
        warn!(node = %node, ?reason, before, after = record.trust_score, "Trust penalized");
        if record.trust_score == TRUST_MIN && record.active {
            record.active = false;
            warn!(node = %node, "Trust exhausted, node marked inactive");
        }
        self.history.entry(node.clone()).or_default().push(event.clone());
        Some(event)
    }

    /// One confirmed window with this node contributing. Every
    /// `recovery_streak` consecutive confirmations add `recovery_step`.
    pub fn record_confirmation(&mut self, node: &NodeId, at_ms: u64) -> Option<TrustEvent> {
        let record = self.records.get_mut(node)?;
        if !record.active {
            return None;
        }
        let streak = self.streaks.entry(node.clone()).or_insert(0);
        *streak += 1;
        if *streak < self.policy.recovery_streak {
            return None;
        }
        *streak = 0;
        let before = record.trust_score;
        record.trust_score = before.saturating_add(self.policy.recovery_step).min(TRUST_MAX);
        if record.trust_score == before {
            return None;
        }
        let event = TrustEvent {
            at_ms,
            delta: record.trust_score as i16 - before as i16,
            reason: TrustReason::Confirmation,
            score_after: record.trust_score,
        };
        self.history.entry(node.clone()).or_default().push(event.clone());
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        let mut r = NodeRegistry::new(TrustPolicy::default());
        for (id, region) in [("b", "eu"), ("a", "eu"), ("c", "us")] {
            r.register(NodeRecord::new(NodeId::from(id), vec![], [0u8; 32], Region::from(region), 10, 50))
                .unwrap();
        }
        r
    }

    #[test]
    fn test_duplicate_registration() {
        let mut r = registry();
        let dup = NodeRecord::new(NodeId::from("a"), vec![], [0u8; 32], Region::from("eu"), 1, 1);
        assert_eq!(r.register(dup), Err(RegistryError::Duplicate(NodeId::from("a"))));
    }

    #[test]
    fn test_aggregation_point() {
        let r = registry();
        assert_eq!(r.aggregation_point(&Region::from("eu")), Some(&NodeId::from("a")));
        assert_eq!(r.aggregation_point(&Region::from("ap")), None);
    }

    #[test]
    fn test_penalty_and_history() {
        let mut r = registry();
        let a = NodeId::from("a");
        let e = r.penalize(&a, TrustReason::LeaderFault, 7).unwrap();
        assert_eq!(e.delta, -20);
        assert_eq!(e.score_after, 30);
        assert_eq!(r.history(&a), &[e]);
    }

    #[test]
    fn test_trust_zero_marks_inactive() {
        let mut r = registry();
        let a = NodeId::from("a");
        for _ in 0..3 {
            r.penalize(&a, TrustReason::LeaderFault, 0);
        }
        let rec = r.get(&a).unwrap();
        assert_eq!(rec.trust_score, 0);
        assert!(!rec.active);
        assert_eq!(r.aggregation_point(&Region::from("eu")), Some(&NodeId::from("b")));
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_recovery_is_slow_and_streak_resets() {
        let mut r = registry();
        let a = NodeId::from("a");
        for _ in 0..3 {
            assert!(r.record_confirmation(&a, 0).is_none());
        }
        r.penalize(&a, TrustReason::Suspected, 0);
        for _ in 0..3 {
            assert!(r.record_confirmation(&a, 0).is_none());
        }
        let e = r.record_confirmation(&a, 0).unwrap();
        assert_eq!(e.delta, 1);
        assert_eq!(e.score_after, 49);
    }

    #[test]
    fn test_last_accepted_never_regresses() {
        let mut r = registry();
        let a = NodeId::from("a");
        r.set_last_accepted(&a, 9).unwrap();
        r.set_last_accepted(&a, 4).unwrap();
        assert_eq!(r.get(&a).unwrap().last_accepted_sequence, 9);
        r.reset_sequence_floor(&a, 100).unwrap();
        assert_eq!(r.get(&a).unwrap().last_accepted_sequence, 99);
    }
}
