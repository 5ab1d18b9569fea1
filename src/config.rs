//! Node configuration: JSON, validated once at startup

use crate::aggregator::{validate_sources, SourceSpec};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Minimum lifetime of the u64 tick counter at the configured rate
pub const COUNTER_HORIZON_YEARS: u64 = 100;

/// Hard bounds of the adaptive heartbeat interval
pub const HEARTBEAT_FLOOR_MS: u64 = 50;
pub const HEARTBEAT_CEILING_MS: u64 = 500;

const MS_PER_YEAR: u64 = 31_557_600_000; // 365.25 days

// =============================================================================
// POLICIES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumMode {
    /// Share of total stake of active region nodes
    Stake,
    /// Share of active region nodes, one vote each
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumPolicy {
    pub mode: QuorumMode,
    pub threshold_percent: u8,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self { mode: QuorumMode::Stake, threshold_percent: 51 }
    }
}

impl QuorumPolicy {
    /// ceil(total · threshold / 100), at least 1
    pub fn need(&self, total: u64) -> u64 {
        let scaled = total as u128 * self.threshold_percent as u128;
        let need = scaled.div_ceil(100) as u64;
        need.max(1)
    }
}

/// Trust adjustments. Penalties are subtracted, recovery is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    pub initial: u8,
    pub invalid_vrf_penalty: u8,
    pub outlier_penalty: u8,
    pub bad_signature_penalty: u8,
    pub leader_fault_penalty: u8,
    pub suspect_penalty: u8,
    /// Consecutive confirmed windows needed for one recovery step
    pub recovery_streak: u32,
    pub recovery_step: u8,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            initial: 50,
            invalid_vrf_penalty: 10,
            outlier_penalty: 5,
            bad_signature_penalty: 5,
            leader_fault_penalty: 20,
            suspect_penalty: 2,
            recovery_streak: 4,
            recovery_step: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierPolicy {
    /// Tukey fence multiplier
    pub iqr_multiplier: f64,
    /// Smallest slot group the fences are computed for
    pub min_cluster: usize,
    /// Fence padding so that identical clocks do not flag on jitter
    pub min_spread_ms: u64,
    /// Consecutive windows with a strike before a node is flagged
    pub strike_windows: u32,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self { iqr_multiplier: 1.5, min_cluster: 4, min_spread_ms: 50, strike_windows: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// Key on (node_id, sequence)
    BySequence,
    /// Key on a hash of the signed bytes
    ByContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatPolicy {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// K: how far behind the local tip a referenced slot may be
    pub stale_slot_threshold: u64,
    pub skew_bound_ms: u64,
    /// M: consecutive silent suspect windows before exclusion
    pub exclude_after_windows: u32,
    pub dedup: DedupMode,
    /// Remembered message keys
    pub dedup_capacity: usize,
    pub max_fanout: usize,
    pub peer_queue_capacity: usize,
    pub latency_samples: usize,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            min_interval_ms: HEARTBEAT_FLOOR_MS,
            max_interval_ms: HEARTBEAT_CEILING_MS,
            stale_slot_threshold: 10,
            skew_bound_ms: 2_000,
            exclude_after_windows: 3,
            dedup: DedupMode::BySequence,
            dedup_capacity: 1_000,
            max_fanout: 8,
            peer_queue_capacity: 256,
            latency_samples: 100,
        }
    }
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tick_interval_ms: u64,
    /// Ticks per epoch; the first entry of each epoch seeds its election
    pub epoch_length: u64,
    /// Ticks per evaluation window
    pub window_ticks: u64,
    /// Entries kept in memory by the PoH log
    pub retain_entries: usize,
    pub max_payloads_per_tick: usize,
    pub payload_queue_capacity: usize,

    pub sources: Vec<SourceSpec>,
    pub weight_tolerance: f64,
    pub fetch_timeout_ms: u64,
    pub max_reading_age_ms: u64,

    pub heartbeat: HeartbeatPolicy,
    pub quorum: QuorumPolicy,
    pub trust: TrustPolicy,
    pub outlier: OutlierPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: 400,
            epoch_length: 64,
            window_ticks: 8,
            retain_entries: 4_096,
            max_payloads_per_tick: 256,
            payload_queue_capacity: 65_536,
            sources: vec![
                SourceSpec::new("weather", 0.4),
                SourceSpec::new("seismic", 0.3),
                SourceSpec::new("acoustic", 0.3),
            ],
            weight_tolerance: 0.001,
            fetch_timeout_ms: 150,
            max_reading_age_ms: 60_000,
            heartbeat: HeartbeatPolicy::default(),
            quorum: QuorumPolicy::default(),
            trust: TrustPolicy::default(),
            outlier: OutlierPolicy::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_sources(&self.sources, self.weight_tolerance)?;

        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        let ticks_per_year = (MS_PER_YEAR / self.tick_interval_ms).max(1);
        let years = u64::MAX / ticks_per_year;
        if years < COUNTER_HORIZON_YEARS {
            return Err(ConfigError::CounterHorizon { years, tick_interval_ms: self.tick_interval_ms });
        }

        if self.epoch_length == 0 {
            return Err(invalid("epoch_length", "must be positive"));
        }
        if self.window_ticks == 0 {
            return Err(invalid("window_ticks", "must be positive"));
        }
        if self.retain_entries < self.window_ticks as usize * 2 {
            return Err(invalid("retain_entries", "must hold at least two windows"));
        }
        if self.max_payloads_per_tick == 0 {
            return Err(invalid("max_payloads_per_tick", "must be positive"));
        }
        if !(self.weight_tolerance.is_finite() && self.weight_tolerance >= 0.0) {
            return Err(invalid("weight_tolerance", "must be a non-negative number"));
        }
        if self.fetch_timeout_ms >= self.tick_interval_ms {
            return Err(invalid("fetch_timeout_ms", "must be shorter than one tick"));
        }

        let hb = &self.heartbeat;
        if hb.min_interval_ms < HEARTBEAT_FLOOR_MS
            || hb.max_interval_ms > HEARTBEAT_CEILING_MS
            || hb.min_interval_ms > hb.max_interval_ms
        {
            return Err(invalid(
                "heartbeat",
                format!("interval must satisfy {HEARTBEAT_FLOOR_MS} <= min <= max <= {HEARTBEAT_CEILING_MS}"),
            ));
        }
        if hb.exclude_after_windows == 0 {
            return Err(invalid("heartbeat.exclude_after_windows", "must be positive"));
        }
        if hb.dedup_capacity == 0 || hb.peer_queue_capacity == 0 || hb.latency_samples == 0 {
            return Err(invalid("heartbeat", "capacities must be positive"));
        }

        if !(1..=100).contains(&self.quorum.threshold_percent) {
            return Err(invalid("quorum.threshold_percent", "must be in 1..=100"));
        }

        let t = &self.trust;
        if t.initial > crate::types::TRUST_MAX {
            return Err(invalid("trust.initial", "must be at most 100"));
        }
        if t.recovery_streak == 0 {
            return Err(invalid("trust.recovery_streak", "must be positive"));
        }

        let o = &self.outlier;
        if !(o.iqr_multiplier.is_finite() && o.iqr_multiplier > 0.0) {
            return Err(invalid("outlier.iqr_multiplier", "must be positive"));
        }
        if o.min_cluster < 4 {
            return Err(invalid("outlier.min_cluster", "quartiles need at least 4 samples"));
        }
        if o.strike_windows == 0 {
            return Err(invalid("outlier.strike_windows", "must be positive"));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}
