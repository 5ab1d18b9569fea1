//! Consensus validator
//!
//! Confirms or rejects a PoH segment once its evaluation window closes. The
//! checks run in a fixed order and the first failure decides the reason:
//!
//! 1. `StaleSegment`: nothing past the last confirmed entry
//! 2. `ChainBroken(index)`: hash recomputation or link to the last confirmed
//!    entry. A segment that starts past the next pending index is broken at
//!    that index; nobody is blamed for the gap.
//! 3. `InsufficientQuorum`: weight of valid, non-suspect, non-outlier heartbeats
//!    referencing a slot of the segment
//! 4. `LeaderAbsent`: the active leader has no such heartbeat
//!
//! Only `InsufficientQuorum` is retryable. `ChainBroken` and `LeaderAbsent`
//! penalize the responsible leader and request a re-election round that
//! excludes it.

use crate::config::{QuorumMode, QuorumPolicy};
use crate::crypto;
use crate::election::{epoch_of, verify_schedule};
use crate::error::QuorumError;
use crate::heartbeat::WindowReport;
use crate::poh::{check_chain, check_link};
use crate::registry::{NodeRegistry, TrustReason};
use crate::types::{Heartbeat, LeaderSchedule, NodeId, NodeRecord, PoHEntry, Region};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRange {
    pub first: u64,
    pub last: u64,
}

impl fmt::Display for SegmentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..={}]", self.first, self.last)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    ChainBroken(u64),
    InsufficientQuorum { have: u64, need: u64 },
    LeaderAbsent,
    StaleSegment,
}

impl RejectReason {
    /// Not enough evidence yet; the segment is held and retried next window
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InsufficientQuorum { .. })
    }

    /// The segment must not be trusted
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::ChainBroken(_))
    }
}

impl From<QuorumError> for RejectReason {
    fn from(e: QuorumError) -> Self {
        Self::InsufficientQuorum { have: e.have, need: e.need }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizationResult {
    Confirmed(SegmentRange),
    Rejected(RejectReason),
}

impl FinalizationResult {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

/// Ask the elector for another round of (epoch, region) without `exclude`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReelectionRequest {
    pub epoch: u64,
    pub region: Region,
    pub round: u32,
    pub exclude: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalization {
    pub range: Option<SegmentRange>,
    pub result: FinalizationResult,
    /// Nodes whose heartbeats counted toward quorum
    pub contributors: Vec<NodeId>,
    pub reelection: Option<ReelectionRequest>,
}

/// Heartbeats a closed window disqualifies from quorum
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disqualified {
    pub suspected: BTreeSet<NodeId>,
    pub outlier_heartbeats: BTreeSet<(NodeId, u64)>,
}

impl From<&WindowReport> for Disqualified {
    fn from(report: &WindowReport) -> Self {
        Self { suspected: report.suspected.clone(), outlier_heartbeats: report.outlier_heartbeats.clone() }
    }
}

// =============================================================================
// VALIDATOR
// =============================================================================

#[derive(Debug)]
pub struct Validator {
    region: Region,
    quorum: QuorumPolicy,
    epoch_length: u64,
    last_confirmed: Option<PoHEntry>,
    last_result: Option<FinalizationResult>,
    last_confirmed_range: Option<SegmentRange>,
}

impl Validator {
    pub fn new(region: Region, quorum: QuorumPolicy, epoch_length: u64) -> Self {
        Self {
            region,
            quorum,
            epoch_length,
            last_confirmed: None,
            last_result: None,
            last_confirmed_range: None,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Index of the next entry waiting for confirmation
    pub fn pending_from(&self) -> u64 {
        self.last_confirmed.as_ref().map(|e| e.index + 1).unwrap_or(0)
    }

    pub fn last_result(&self) -> Option<FinalizationResult> {
        self.last_result
    }

    pub fn latest_confirmed(&self) -> Option<SegmentRange> {
        self.last_confirmed_range
    }

    /// Move past a segment rejected for good, so the next one is judged on its own
    pub fn skip_to(&mut self, entry: PoHEntry) {
        if self.last_confirmed.as_ref().is_none_or(|c| c.index < entry.index) {
            self.last_confirmed = Some(entry);
        }
    }

    fn weight(&self, record: &NodeRecord) -> u64 {
        match self.quorum.mode {
            QuorumMode::Stake => record.stake_weight,
            QuorumMode::Count => 1,
        }
    }

    /// Active leader for the segment ending at `last`: highest (epoch, round)
    /// of this region not after that epoch, with a proof that checks out.
    fn responsible_leader<'a>(
        &self,
        registry: &'a NodeRegistry,
        schedules: &'a [LeaderSchedule],
        last: u64,
    ) -> Option<(&'a LeaderSchedule, &'a NodeRecord)> {
        let epoch = epoch_of(last, self.epoch_length);
        let mut candidates: Vec<&LeaderSchedule> = schedules
            .iter()
            .filter(|s| s.region == self.region && s.epoch_id <= epoch)
            .collect();
        candidates.sort_by_key(|s| (s.epoch_id, s.round));
        candidates.into_iter().rev().find_map(|s| {
            let record = registry.get(&s.leader_node_id)?;
            if verify_schedule(s, record) {
                Some((s, record))
            } else {
                warn!(epoch = s.epoch_id, round = s.round, leader = %s.leader_node_id, "Schedule proof invalid, ignored");
                None
            }
        })
    }

    /// Nodes with at least one qualifying heartbeat, with their quorum weight
    fn contributors(
        &self,
        registry: &NodeRegistry,
        segment: &[PoHEntry],
        heartbeats: &[Heartbeat],
        disqualified: &Disqualified,
    ) -> BTreeMap<NodeId, u64> {
        let (Some(first), Some(last)) = (segment.first(), segment.last()) else {
            return BTreeMap::new();
        };
        let mut out = BTreeMap::new();
        for hb in heartbeats {
            if out.contains_key(&hb.node_id) || disqualified.suspected.contains(&hb.node_id) {
                continue;
            }
            if disqualified.outlier_heartbeats.contains(&(hb.node_id.clone(), hb.sequence)) {
                continue;
            }
            let Some(record) = registry.get(&hb.node_id) else { continue };
            if !record.active || record.region != self.region {
                continue;
            }
            if hb.poh_slot < first.index || hb.poh_slot > last.index {
                continue;
            }
            match segment.get((hb.poh_slot - first.index) as usize) {
                Some(entry) if entry.hash == hb.poh_hash => {}
                _ => continue,
            }
            if !crypto::verify(&record.public_key, &hb.signed_bytes(), &hb.signature) {
                debug!(node = %hb.node_id, "Heartbeat signature invalid at finalization");
                continue;
            }
            out.insert(hb.node_id.clone(), self.weight(record));
        }
        out
    }

    fn check_quorum(&self, registry: &NodeRegistry, have: u64) -> Result<(), QuorumError> {
        let total: u64 = registry.active_in_region(&self.region).map(|r| self.weight(r)).sum();
        let need = self.quorum.need(total);
        if have >= need {
            Ok(())
        } else {
            Err(QuorumError { have, need })
        }
    }

    /// Judge one segment.
    ///
    /// `segment` must be contiguous entries of this region; `schedules` may
    /// contain any region's schedules.
    pub fn finalize(
        &mut self,
        registry: &mut NodeRegistry,
        segment: &[PoHEntry],
        heartbeats: &[Heartbeat],
        schedules: &[LeaderSchedule],
        disqualified: &Disqualified,
        now_ms: u64,
    ) -> Finalization {
        let pending_from = self.pending_from();
        let fresh: &[PoHEntry] = match segment.iter().position(|e| e.index >= pending_from) {
            Some(start) => &segment[start..],
            None => &[],
        };
        let (Some(first), Some(last)) = (fresh.first(), fresh.last()) else {
            return self.conclude(FinalizationResult::Rejected(RejectReason::StaleSegment), None, Vec::new(), None);
        };
        let range = SegmentRange { first: first.index, last: last.index };

        let leader = self
            .responsible_leader(registry, schedules, range.last)
            .map(|(s, r)| (s.clone(), r.node_id.clone()));

        // Entries between the confirmed tip and this segment were never judged
        if self.last_confirmed.is_some() && first.index != pending_from {
            warn!(region = %self.region, %range, pending_from, "Segment does not extend the confirmed tip");
            return self.conclude(FinalizationResult::Rejected(RejectReason::ChainBroken(pending_from)), Some(range), Vec::new(), None);
        }

        let mut integrity = check_chain(fresh).err().map(|e| e.index);
        if integrity.is_none() {
            if let Some(prev) = self.last_confirmed.as_ref().filter(|p| p.index + 1 == first.index) {
                integrity = check_link(prev, first).err().map(|e| e.index);
            }
        }
        if let Some(index) = integrity {
            warn!(region = %self.region, %range, index, "Segment chain broken");
            let reelection = self.fault(registry, leader.as_ref(), now_ms);
            return self.conclude(FinalizationResult::Rejected(RejectReason::ChainBroken(index)), Some(range), Vec::new(), reelection);
        }

        let contributors = self.contributors(registry, fresh, heartbeats, disqualified);
        let have: u64 = contributors.values().sum();
        if let Err(e) = self.check_quorum(registry, have) {
            info!(region = %self.region, %range, have = e.have, need = e.need, "Segment held: {}", e);
            let ids = contributors.into_keys().collect();
            return self.conclude(FinalizationResult::Rejected(e.into()), Some(range), ids, None);
        }

        let leader_present = leader.as_ref().is_some_and(|(_, id)| contributors.contains_key(id));
        if !leader_present {
            warn!(region = %self.region, %range, leader = ?leader.as_ref().map(|(_, id)| id.as_str()), "Segment leader absent");
            let reelection = self.fault(registry, leader.as_ref(), now_ms);
            let ids = contributors.into_keys().collect();
            return self.conclude(FinalizationResult::Rejected(RejectReason::LeaderAbsent), Some(range), ids, reelection);
        }

        let ids: Vec<NodeId> = contributors.into_keys().collect();
        for node in &ids {
            registry.record_confirmation(node, now_ms);
        }
        self.last_confirmed = Some(last.clone());
        self.last_confirmed_range = Some(range);
        info!(region = %self.region, %range, contributors = ids.len(), have, "Segment confirmed");
        self.conclude(FinalizationResult::Confirmed(range), Some(range), ids, None)
    }

    fn fault(
        &self,
        registry: &mut NodeRegistry,
        leader: Option<&(LeaderSchedule, NodeId)>,
        now_ms: u64,
    ) -> Option<ReelectionRequest> {
        let (schedule, node) = leader?;
        registry.penalize(node, TrustReason::LeaderFault, now_ms);
        Some(ReelectionRequest {
            epoch: schedule.epoch_id,
            region: self.region.clone(),
            round: schedule.round.saturating_add(1),
            exclude: node.clone(),
        })
    }

    fn conclude(
        &mut self,
        result: FinalizationResult,
        range: Option<SegmentRange>,
        contributors: Vec<NodeId>,
        reelection: Option<ReelectionRequest>,
    ) -> Finalization {
        self.last_result = Some(result);
        Finalization { range, result, contributors, reelection }
    }

    /// Trust penalties for what a closed window detected. Forged signatures
    /// count once per node per window.
    pub fn apply_window(&self, registry: &mut NodeRegistry, report: &WindowReport, now_ms: u64) {
        for node in &report.flagged_outliers {
            registry.penalize(node, TrustReason::Outlier, now_ms);
        }
        for node in &report.newly_suspected {
            registry.penalize(node, TrustReason::Suspected, now_ms);
        }
        let forged: BTreeSet<&NodeId> = report.signature_failures.iter().collect();
        for node in forged {
            registry.penalize(node, TrustReason::BadSignature, now_ms);
        }
    }

    pub fn penalize_invalid_proofs(&self, registry: &mut NodeRegistry, invalid: &[NodeId], now_ms: u64) {
        for node in invalid {
            registry.penalize(node, TrustReason::InvalidVrfProof, now_ms);
        }
    }
}
