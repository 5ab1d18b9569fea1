use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type Hash = [u8; 32];
pub type PublicKey = Vec<u8>; // ML-DSA-65: 1952 bytes
pub type Signature = Vec<u8>; // ML-DSA-65: 3309 bytes

/// Previous hash of the genesis entry
pub const ZERO_HASH: Hash = [0u8; 32];

/// Trust score bounds
pub const TRUST_MIN: u8 = 0;
pub const TRUST_MAX: u8 = 100;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Node identifier. Ordered lexicographically; the ordering breaks election ties
/// and picks regional aggregation points.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Geographic region. Each region runs its own sequencer and elects its own leader.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region(pub String);

impl Region {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Region {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// ENVIRONMENTAL DATA
// =============================================================================

/// One measurement set from an external environmental source.
///
/// Schema version 1. Each physical quantity is optional because no single source
/// measures all of them (a weather feed has no vibration, a seismograph has no
/// humidity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalReading {
    pub source_id: String,
    /// °C
    pub temperature: Option<f64>,
    /// %RH
    pub humidity: Option<f64>,
    /// hPa
    pub pressure: Option<f64>,
    /// lux
    pub light: Option<f64>,
    /// dB
    pub sound: Option<f64>,
    /// m/s²
    pub vibration: Option<f64>,
    /// Unix milliseconds
    pub collection_timestamp: u64,
    /// Share of the snapshot this source is entitled to, in [0, 1]
    pub declared_weight: f64,
}

impl EnvironmentalReading {
    pub const SCHEMA_VERSION: u8 = 1;

    pub fn new(source_id: impl Into<String>, collection_timestamp: u64, declared_weight: f64) -> Self {
        Self {
            source_id: source_id.into(),
            temperature: None,
            humidity: None,
            pressure: None,
            light: None,
            sound: None,
            vibration: None,
            collection_timestamp,
            declared_weight,
        }
    }

    /// Fields in canonical order, paired with their names for diagnostics.
    pub fn fields(&self) -> [(&'static str, Option<f64>); 6] {
        [
            ("temperature", self.temperature),
            ("humidity", self.humidity),
            ("pressure", self.pressure),
            ("light", self.light),
            ("sound", self.sound),
            ("vibration", self.vibration),
        ]
    }
}

/// Fixed-shape digest of all readings folded into one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalSnapshot {
    pub tick_index: u64,
    /// Contributing sources, sorted ascending
    pub source_ids: Vec<String>,
    pub weighted_digest: Hash,
    /// Readings that went into the digest, kept for audit replay
    pub raw_values: Vec<EnvironmentalReading>,
}

impl EnvironmentalSnapshot {
    pub fn is_fallback(&self) -> bool {
        self.source_ids.is_empty()
    }
}

// =============================================================================
// PROOF OF HISTORY
// =============================================================================

/// One tick of the PoH chain.
///
/// ```text
/// hash = SHA3-256(previous_hash ‖ index_le ‖ env_digest ‖ payload_digest)
/// ```
///
/// `wall_clock_hint` and `payload_hashes` are not hashed: the hint is advisory
/// and the payload hashes are committed through `payload_digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoHEntry {
    pub index: u64,
    pub previous_hash: Hash,
    pub env_digest: Hash,
    pub payload_digest: Hash,
    pub hash: Hash,
    /// Unix milliseconds
    pub wall_clock_hint: u64,
    #[serde(default)]
    pub payload_hashes: Vec<Hash>,
}

// =============================================================================
// HEARTBEAT
// =============================================================================

/// Signed liveness message referencing the PoH timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub poh_slot: u64,
    pub poh_hash: Hash,
    pub node_id: NodeId,
    pub sequence: u64,
    /// Unix milliseconds at emission
    pub timestamp: u64,
    pub signature: Signature,
}

impl Heartbeat {
    /// Bytes covered by the signature
    pub fn message_to_sign(
        poh_slot: u64,
        poh_hash: &Hash,
        node_id: &NodeId,
        sequence: u64,
        timestamp: u64,
    ) -> Vec<u8> {
        let id = node_id.as_str().as_bytes();
        let mut msg = Vec::with_capacity(20 + 8 + 32 + 4 + id.len() + 16);
        msg.extend_from_slice(b"PULSECHAIN_HEARTBEAT_V1:");
        msg.extend_from_slice(&poh_slot.to_le_bytes());
        msg.extend_from_slice(poh_hash);
        msg.extend_from_slice(&(id.len() as u32).to_le_bytes());
        msg.extend_from_slice(id);
        msg.extend_from_slice(&sequence.to_le_bytes());
        msg.extend_from_slice(&timestamp.to_le_bytes());
        msg
    }

    pub fn signed_bytes(&self) -> Vec<u8> {
        Self::message_to_sign(self.poh_slot, &self.poh_hash, &self.node_id, self.sequence, self.timestamp)
    }
}

// =============================================================================
// NODES
// =============================================================================

/// Registry entry for a participating node.
///
/// `trust_score` is owned by the consensus validator, `last_accepted_sequence` by
/// the heartbeat engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    /// ML-DSA-65 key verifying heartbeats
    pub public_key: PublicKey,
    /// Ristretto255 key verifying VRF proofs
    pub vrf_public_key: [u8; 32],
    pub region: Region,
    pub stake_weight: u64,
    pub trust_score: u8,
    pub last_accepted_sequence: u64,
    pub active: bool,
}

impl NodeRecord {
    pub fn new(
        node_id: NodeId,
        public_key: PublicKey,
        vrf_public_key: [u8; 32],
        region: Region,
        stake_weight: u64,
        trust_score: u8,
    ) -> Self {
        Self {
            node_id,
            public_key,
            vrf_public_key,
            region,
            stake_weight,
            trust_score: trust_score.min(TRUST_MAX),
            last_accepted_sequence: 0,
            active: true,
        }
    }
}

// =============================================================================
// LEADER SCHEDULE
// =============================================================================

/// Result of one election for an (epoch, region).
///
/// `round` is 0 for the regular election and increases on each re-election
/// triggered by a rejected segment; every (epoch, region, round) has exactly one
/// schedule and the highest round is the active one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderSchedule {
    pub epoch_id: u64,
    pub region: Region,
    pub round: u32,
    pub leader_node_id: NodeId,
    pub vrf_output: [u8; 32],
    pub vrf_proof: Vec<u8>,
    pub boundary_index: u64,
    pub boundary_hash: Hash,
}

// =============================================================================
// TIME
// =============================================================================

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Format a millisecond timestamp for logging
pub fn millis_to_string(ms: u64) -> String {
    use chrono::{TimeZone, Utc};
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        None => format!("{}ms", ms),
    }
}

/// Short hex prefix of a hash for logs
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering_is_lexicographic() {
        let mut ids = vec![NodeId::from("node-b"), NodeId::from("node-a"), NodeId::from("node-aa")];
        ids.sort();
        assert_eq!(ids, vec![NodeId::from("node-a"), NodeId::from("node-aa"), NodeId::from("node-b")]);
    }

    #[test]
    fn test_heartbeat_message_binds_node_id_length() {
        // "ab" + seq vs "a" + "b..." must not collide
        let a = Heartbeat::message_to_sign(1, &[0u8; 32], &NodeId::from("ab"), 1, 5);
        let b = Heartbeat::message_to_sign(1, &[0u8; 32], &NodeId::from("a"), 1, 5);
        assert_ne!(a, b);
    }

    #[test]
    fn test_record_trust_is_clamped() {
        let r = NodeRecord::new(NodeId::from("n"), vec![], [0u8; 32], Region::from("eu"), 10, 250);
        assert_eq!(r.trust_score, TRUST_MAX);
        assert!(r.active);
    }

    #[test]
    fn test_millis_formatting() {
        assert_eq!(millis_to_string(0), "1970-01-01 00:00:00.000 UTC");
    }
}
