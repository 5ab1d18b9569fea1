//! Clock-drift clustering
//!
//! Within a window, heartbeats are grouped by the slot they reference. For each
//! group of at least `min_cluster` heartbeats the Tukey fences
//! `[Q1 − k·IQR, Q3 + k·IQR]` over the heartbeat timestamps bound what an honest
//! clock looks like for that slot. A heartbeat outside the fences is a strike for
//! its sender; strikes in `strike_windows` consecutive windows flag the node.

use crate::config::OutlierPolicy;
use crate::types::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// One accepted heartbeat as seen by clustering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub node_id: NodeId,
    pub sequence: u64,
    pub slot: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterResult {
    /// (node, sequence) of heartbeats outside their slot's fences
    pub outlier_heartbeats: BTreeSet<(NodeId, u64)>,
    /// Nodes with at least one outlier heartbeat this window
    pub struck: BTreeSet<NodeId>,
}

/// Linear-interpolated quantile of sorted values
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

pub fn fences(timestamps: &[u64], policy: &OutlierPolicy) -> Option<(f64, f64)> {
    if timestamps.len() < policy.min_cluster.max(2) {
        return None;
    }
    let mut sorted: Vec<f64> = timestamps.iter().map(|&t| t as f64).collect();
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let spread = ((q3 - q1) * policy.iqr_multiplier).max(policy.min_spread_ms as f64);
    Some((q1 - spread, q3 + spread))
}

pub fn detect(samples: &[Sample], policy: &OutlierPolicy) -> ClusterResult {
    let mut by_slot: BTreeMap<u64, Vec<&Sample>> = BTreeMap::new();
    for s in samples {
        by_slot.entry(s.slot).or_default().push(s);
    }

    let mut result = ClusterResult::default();
    for group in by_slot.values() {
        let timestamps: Vec<u64> = group.iter().map(|s| s.timestamp).collect();
        let Some((lo, hi)) = fences(&timestamps, policy) else {
            continue;
        };
        for s in group {
            let t = s.timestamp as f64;
            if t < lo || t > hi {
                result.outlier_heartbeats.insert((s.node_id.clone(), s.sequence));
                result.struck.insert(s.node_id.clone());
            }
        }
    }
    result
}

/// Consecutive-window strike counter
#[derive(Debug, Default, Clone)]
pub struct StrikeTracker {
    streaks: BTreeMap<NodeId, u32>,
}

impl StrikeTracker {
    /// Fold in one window's strikes; returns nodes that just reached the flag threshold.
    pub fn close_window(&mut self, struck: &BTreeSet<NodeId>, policy: &OutlierPolicy) -> Vec<NodeId> {
        self.streaks.retain(|node, _| struck.contains(node));
        let mut flagged = Vec::new();
        for node in struck {
            let streak = self.streaks.entry(node.clone()).or_insert(0);
            *streak = streak.saturating_add(1);
            if *streak >= policy.strike_windows {
                flagged.push(node.clone());
            }
        }
        flagged
    }

    pub fn streak(&self, node: &NodeId) -> u32 {
        self.streaks.get(node).copied().unwrap_or(0)
    }
}
