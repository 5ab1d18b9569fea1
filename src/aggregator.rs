//! Environmental aggregator
//!
//! Folds the readings gathered for one tick into a single
//! [`EnvironmentalSnapshot`]. The digest depends only on the *set* of accepted
//! readings: they are canonicalized by `source_id` before hashing, so arrival
//! order never changes the result.
//!
//! ```text
//! per reading:  source_id ‖ weight_ppm ‖ collection_timestamp ‖ 6 × (present ‖ f64 bits)
//! per field:    weighted mean over the readings that report it
//! digest:       SHA3("PULSECHAIN_ENV_V1" ‖ schema ‖ readings ‖ means)
//! no readings:  SHA3("PULSECHAIN_ENV_EMPTY_V1" ‖ tick_index ‖ previous digest)
//! ```
//!
//! Weights are renormalized over the sources that actually reported, so a down
//! source never blocks a snapshot.

use crate::config::Config;
use crate::crypto::sha3_parts;
use crate::error::ConfigError;
use crate::types::{EnvironmentalReading, EnvironmentalSnapshot, Hash, ZERO_HASH};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const DOMAIN_ENV: &[u8] = b"PULSECHAIN_ENV_V1";
const DOMAIN_EMPTY: &[u8] = b"PULSECHAIN_ENV_EMPTY_V1";
const PPM: f64 = 1_000_000.0;

/// Physical plausibility ranges, in [`EnvironmentalReading::fields`] order
pub const FIELD_RANGES: [(f64, f64); 6] = [
    (-90.0, 60.0),     // temperature °C
    (0.0, 100.0),      // humidity %RH
    (300.0, 1_100.0),  // pressure hPa
    (0.0, 200_000.0),  // light lux
    (0.0, 194.0),      // sound dB
    (0.0, 100.0),      // vibration m/s²
];

// =============================================================================
// SOURCES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub weight: f64,
}

impl SourceSpec {
    pub fn new(source_id: impl Into<String>, weight: f64) -> Self {
        Self { source_id: source_id.into(), weight }
    }
}

/// Check a configured source set: unique ids, weights in [0, 1] summing to 1 ± tolerance
pub fn validate_sources(sources: &[SourceSpec], tolerance: f64) -> Result<(), ConfigError> {
    let mut seen = std::collections::BTreeSet::new();
    let mut sum = 0.0;
    for s in sources {
        if !seen.insert(s.source_id.as_str()) {
            return Err(ConfigError::DuplicateSource(s.source_id.clone()));
        }
        if !(s.weight.is_finite() && (0.0..=1.0).contains(&s.weight)) {
            return Err(ConfigError::WeightRange(s.source_id.clone()));
        }
        sum += s.weight;
    }
    if (sum - 1.0).abs() > tolerance {
        return Err(ConfigError::WeightSum { sum, tolerance });
    }
    Ok(())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("source {source_id} unavailable: {reason}")]
pub struct Unavailable {
    pub source_id: String,
    pub reason: String,
}

/// External environmental data provider. Must be idempotent and side-effect free.
#[async_trait]
pub trait EnvironmentalSource: Send + Sync {
    async fn fetch(&self, source_id: &str, as_of_ms: u64) -> Result<EnvironmentalReading, Unavailable>;
}

// =============================================================================
// VALIDATION
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    UnknownSource,
    WeightMismatch { declared: f64, configured: f64 },
    NotFinite { field: &'static str },
    OutOfRange { field: &'static str, value: f64 },
    Stale { age_ms: u64 },
    Future { ahead_ms: u64 },
    Superseded,
}

// =============================================================================
// AGGREGATOR
// =============================================================================

#[derive(Debug, Clone)]
pub struct Aggregator {
    /// source_id → configured weight
    sources: BTreeMap<String, f64>,
    tolerance: f64,
    max_age_ms: u64,
    max_future_ms: u64,
    fetch_timeout: Duration,
    previous_digest: Hash,
}

impl Aggregator {
    pub fn new(sources: &[SourceSpec], tolerance: f64) -> Result<Self, ConfigError> {
        validate_sources(sources, tolerance)?;
        Ok(Self {
            sources: sources.iter().map(|s| (s.source_id.clone(), s.weight)).collect(),
            tolerance,
            max_age_ms: 60_000,
            max_future_ms: 2_000,
            fetch_timeout: Duration::from_millis(150),
            previous_digest: ZERO_HASH,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut agg = Self::new(&config.sources, config.weight_tolerance)?;
        agg.max_age_ms = config.max_reading_age_ms;
        agg.max_future_ms = config.heartbeat.skew_bound_ms;
        agg.fetch_timeout = Duration::from_millis(config.fetch_timeout_ms);
        Ok(agg)
    }

    /// Resume the empty-snapshot fallback chain after a restart
    pub fn resume_from(&mut self, previous_digest: Hash) {
        self.previous_digest = previous_digest;
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn check(&self, reading: &EnvironmentalReading, as_of_ms: u64) -> Result<(), DropReason> {
        let Some(&configured) = self.sources.get(&reading.source_id) else {
            return Err(DropReason::UnknownSource);
        };
        if !reading.declared_weight.is_finite() || (reading.declared_weight - configured).abs() > self.tolerance {
            return Err(DropReason::WeightMismatch { declared: reading.declared_weight, configured });
        }
        for ((field, value), (lo, hi)) in reading.fields().into_iter().zip(FIELD_RANGES) {
            let Some(v) = value else { continue };
            if !v.is_finite() {
                return Err(DropReason::NotFinite { field });
            }
            if v < lo || v > hi {
                return Err(DropReason::OutOfRange { field, value: v });
            }
        }
        if reading.collection_timestamp > as_of_ms {
            let ahead_ms = reading.collection_timestamp - as_of_ms;
            if ahead_ms > self.max_future_ms {
                return Err(DropReason::Future { ahead_ms });
            }
        } else {
            let age_ms = as_of_ms - reading.collection_timestamp;
            if age_ms > self.max_age_ms {
                return Err(DropReason::Stale { age_ms });
            }
        }
        Ok(())
    }

    /// Fold `readings` into the snapshot for `tick_index`.
    ///
    /// Invalid readings are dropped and logged. With several readings from one
    /// source the newest wins (ties by canonical bytes), so the choice does not
    /// depend on arrival order.
    pub fn aggregate(
        &mut self,
        readings: Vec<EnvironmentalReading>,
        tick_index: u64,
        as_of_ms: u64,
    ) -> EnvironmentalSnapshot {
        let mut accepted: BTreeMap<String, (EnvironmentalReading, Vec<u8>)> = BTreeMap::new();

        for reading in readings {
            if let Err(reason) = self.check(&reading, as_of_ms) {
                warn!(source = %reading.source_id, tick = tick_index, ?reason, "Dropping environmental reading");
                continue;
            }
            let bytes = reading_bytes(&reading);
            let newer = match accepted.get(&reading.source_id) {
                None => true,
                Some((current, current_bytes)) => {
                    (reading.collection_timestamp, &bytes) > (current.collection_timestamp, current_bytes)
                }
            };
            if newer {
                accepted.insert(reading.source_id.clone(), (reading, bytes));
            } else {
                debug!(source = %reading.source_id, reason = ?DropReason::Superseded, "Dropping environmental reading");
            }
        }

        if accepted.is_empty() {
            let digest = sha3_parts(DOMAIN_EMPTY, &[&tick_index.to_le_bytes(), &self.previous_digest]);
            warn!(tick = tick_index, "No environmental readings, using fallback digest");
            self.previous_digest = digest;
            return EnvironmentalSnapshot {
                tick_index,
                source_ids: Vec::new(),
                weighted_digest: digest,
                raw_values: Vec::new(),
            };
        }

        let present_weight: f64 = accepted.keys().map(|id| self.sources[id]).sum();
        let mut canonical = vec![EnvironmentalReading::SCHEMA_VERSION];
        let mut weighted_sum = [0.0f64; 6];
        let mut weight_seen = [0.0f64; 6];

        for (id, (reading, bytes)) in &accepted {
            let share = if present_weight > 0.0 {
                self.sources[id] / present_weight
            } else {
                1.0 / accepted.len() as f64
            };
            let ppm = (share * PPM).round() as u32;
            canonical.extend_from_slice(&ppm.to_le_bytes());
            canonical.extend_from_slice(bytes);

            for (i, (_, value)) in reading.fields().into_iter().enumerate() {
                if let Some(v) = value {
                    weighted_sum[i] += share * v;
                    weight_seen[i] += share;
                }
            }
        }

        for i in 0..6 {
            if weight_seen[i] > 0.0 {
                canonical.push(1);
                canonical.extend_from_slice(&canonical_f64(weighted_sum[i] / weight_seen[i]).to_le_bytes());
            } else {
                canonical.push(0);
            }
        }

        let digest = sha3_parts(DOMAIN_ENV, &[&canonical]);
        self.previous_digest = digest;

        let (source_ids, raw_values) = accepted
            .into_iter()
            .map(|(id, (reading, _))| (id, reading))
            .unzip();

        EnvironmentalSnapshot { tick_index, source_ids, weighted_digest: digest, raw_values }
    }

    /// Fetch every configured source concurrently, each under the fetch timeout.
    ///
    /// Timeouts and unavailable sources are absorbed; whatever arrived in time
    /// is returned.
    pub async fn collect(&self, source: Arc<dyn EnvironmentalSource>, as_of_ms: u64) -> Vec<EnvironmentalReading> {
        let mut set = JoinSet::new();
        for id in self.sources.keys().cloned() {
            let source = Arc::clone(&source);
            let timeout = self.fetch_timeout;
            set.spawn(async move {
                let result = tokio::time::timeout(timeout, source.fetch(&id, as_of_ms)).await;
                (id, result)
            });
        }

        let mut readings = Vec::with_capacity(self.sources.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(Ok(reading)))) => readings.push(reading),
                Ok((id, Ok(Err(e)))) => debug!(source = %id, "{}", e),
                Ok((id, Err(_))) => {
                    warn!(source = %id, timeout_ms = self.fetch_timeout.as_millis() as u64, "Environmental fetch timed out")
                }
                Err(e) => warn!("Environmental fetch task failed: {}", e),
            }
        }
        readings
    }
}

/// -0.0 and 0.0 encode identically
fn canonical_f64(v: f64) -> u64 {
    if v == 0.0 { 0 } else { v.to_bits() }
}

fn reading_bytes(r: &EnvironmentalReading) -> Vec<u8> {
    let id = r.source_id.as_bytes();
    let mut out = Vec::with_capacity(4 + id.len() + 8 + 6 * 9);
    out.extend_from_slice(&(id.len() as u32).to_le_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(&r.collection_timestamp.to_le_bytes());
    for (_, value) in r.fields() {
        match value {
            Some(v) => {
                out.push(1);
                out.extend_from_slice(&canonical_f64(v).to_le_bytes());
            }
            None => out.push(0),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn specs() -> Vec<SourceSpec> {
        vec![SourceSpec::new("a", 0.5), SourceSpec::new("b", 0.3), SourceSpec::new("c", 0.2)]
    }

    fn reading(id: &str, weight: f64, temp: f64) -> EnvironmentalReading {
        let mut r = EnvironmentalReading::new(id, NOW - 1_000, weight);
        r.temperature = Some(temp);
        r.humidity = Some(40.0);
        r
    }

    fn agg() -> Aggregator {
        Aggregator::new(&specs(), 0.001).unwrap()
    }

    #[test]
    fn test_order_independent() {
        let rs = vec![reading("a", 0.5, 20.0), reading("b", 0.3, 21.0), reading("c", 0.2, 19.0)];
        let mut rev = rs.clone();
        rev.reverse();
        let s1 = agg().aggregate(rs, 5, NOW);
        let s2 = agg().aggregate(rev, 5, NOW);
        assert_eq!(s1.weighted_digest, s2.weighted_digest);
        assert_eq!(s1.source_ids, vec!["a", "b", "c"]);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_out_of_range_dropped() {
        let mut bad = reading("b", 0.3, 21.0);
        bad.humidity = Some(140.0);
        let snap = agg().aggregate(vec![reading("a", 0.5, 20.0), bad], 1, NOW);
        assert_eq!(snap.source_ids, vec!["a"]);
    }

    #[test]
    fn test_nan_dropped() {
        let snap = agg().aggregate(vec![reading("a", 0.5, f64::NAN)], 1, NOW);
        assert!(snap.is_fallback());
    }

    #[test]
    fn test_unknown_and_mismatched_weight_dropped() {
        let a = agg();
        assert_eq!(a.check(&reading("zz", 0.5, 20.0), NOW), Err(DropReason::UnknownSource));
        assert!(matches!(a.check(&reading("a", 0.9, 20.0), NOW), Err(DropReason::WeightMismatch { .. })));
    }

    #[test]
    fn test_freshness() {
        let a = agg();
        let mut old = reading("a", 0.5, 20.0);
        old.collection_timestamp = NOW - 120_000;
        assert!(matches!(a.check(&old, NOW), Err(DropReason::Stale { .. })));
        let mut future = reading("a", 0.5, 20.0);
        future.collection_timestamp = NOW + 10_000;
        assert!(matches!(a.check(&future, NOW), Err(DropReason::Future { .. })));
    }

    #[test]
    fn test_fallback_chains_previous_digest() {
        let mut a = agg();
        let first = a.aggregate(vec![], 1, NOW);
        let second = a.aggregate(vec![], 2, NOW);
        assert!(first.is_fallback());
        assert_ne!(first.weighted_digest, second.weighted_digest);

        // same tick, different history
        let mut b = agg();
        b.aggregate(vec![reading("a", 0.5, 20.0)], 1, NOW);
        let other = b.aggregate(vec![], 2, NOW);
        assert_ne!(other.weighted_digest, second.weighted_digest);
    }

    #[test]
    fn test_missing_source_still_produces_snapshot() {
        let full = agg().aggregate(vec![reading("a", 0.5, 20.0), reading("b", 0.3, 20.0)], 3, NOW);
        assert_eq!(full.source_ids.len(), 2);
        assert!(!full.is_fallback());
    }

    #[test]
    fn test_duplicate_source_newest_wins() {
        let older = reading("a", 0.5, 10.0);
        let mut newer = reading("a", 0.5, 30.0);
        newer.collection_timestamp = NOW - 500;
        let s1 = agg().aggregate(vec![older.clone(), newer.clone()], 1, NOW);
        let s2 = agg().aggregate(vec![newer.clone(), older], 1, NOW);
        assert_eq!(s1, s2);
        assert_eq!(s1.raw_values, vec![newer]);
    }

    #[test]
    fn test_validate_sources() {
        assert!(validate_sources(&specs(), 0.001).is_ok());
        let dup = vec![SourceSpec::new("a", 0.5), SourceSpec::new("a", 0.5)];
        assert_eq!(validate_sources(&dup, 0.001), Err(ConfigError::DuplicateSource("a".into())));
        let neg = vec![SourceSpec::new("a", 1.5), SourceSpec::new("b", -0.5)];
        assert_eq!(validate_sources(&neg, 0.001), Err(ConfigError::WeightRange("a".into())));
    }

    struct Flaky;

    #[async_trait]
    impl EnvironmentalSource for Flaky {
        async fn fetch(&self, source_id: &str, as_of_ms: u64) -> Result<EnvironmentalReading, Unavailable> {
            match source_id {
                "a" => Ok(reading("a", 0.5, 20.0)),
                "b" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(reading("b", 0.3, 20.0))
                }
                _ => Err(Unavailable { source_id: source_id.into(), reason: format!("down at {as_of_ms}") }),
            }
        }
    }

    #[tokio::test]
    async fn test_collect_absorbs_timeouts_and_unavailable() {
        let a = agg();
        let started = std::time::Instant::now();
        let readings = a.collect(Arc::new(Flaky), NOW).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].source_id, "a");
    }
}
