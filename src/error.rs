//! Error taxonomy
//!
//! Transient failures (timeouts, a missing source) never surface here: they are
//! absorbed where they happen. What remains is split by how the caller must
//! react:
//!
//! | Error | Reaction |
//! |---|---|
//! | [`ChainIntegrityError`] | segment is untrustworthy, never repaired |
//! | [`QuorumError`] | hold segment, retry next window |
//! | [`SignatureError`] | drop message, penalize sender |
//! | [`TimingError`] | suspect sender, do not exclude yet |
//! | [`ConfigError`] | refuse to start |

use crate::db::DbError;
use crate::types::NodeId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    /// Stored hash differs from the recomputed one
    HashMismatch,
    /// previous_hash does not match the preceding entry
    BrokenLink,
    /// Index is not predecessor + 1
    IndexGap,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("chain integrity violated at index {index}: {kind:?}")]
pub struct ChainIntegrityError {
    pub index: u64,
    pub kind: IntegrityKind,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("insufficient quorum: have {have}, need {need}")]
pub struct QuorumError {
    pub have: u64,
    pub need: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid heartbeat signature from {0}")]
    Heartbeat(NodeId),
    #[error("invalid VRF proof from {0}")]
    VrfProof(NodeId),
    #[error("malformed key: {0}")]
    MalformedKey(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimingError {
    #[error("stale slot {slot}: tip {tip}, threshold {threshold}")]
    StaleSlot { slot: u64, tip: u64, threshold: u64 },
    #[error("clock skew {skew_ms}ms exceeds bound {bound_ms}ms")]
    ClockSkew { skew_ms: u64, bound_ms: u64 },
    #[error("sequence regressed: got {sequence}, last accepted {last}")]
    Replay { sequence: u64, last: u64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("source weights sum to {sum}, expected 1.0 ± {tolerance}")]
    WeightSum { sum: f64, tolerance: f64 },
    #[error("source {0} has weight outside [0, 1]")]
    WeightRange(String),
    #[error("duplicate source {0}")]
    DuplicateSource(String),
    #[error("tick interval must be positive")]
    ZeroTickInterval,
    #[error("index counter would overflow within {years} years at {tick_interval_ms}ms per tick")]
    CounterHorizon { years: u64, tick_interval_ms: u64 },
    #[error("PoH index overflow")]
    IndexOverflow,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config: {0}")]
    Load(String),
}

/// Crate-level error
#[derive(Error, Debug)]
pub enum PulseError {
    #[error(transparent)]
    ChainIntegrity(#[from] ChainIntegrityError),
    #[error(transparent)]
    Quorum(#[from] QuorumError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    #[error(transparent)]
    Election(#[from] crate::election::ElectionError),
    #[error(transparent)]
    Heartbeat(#[from] crate::heartbeat::HeartbeatRejection),
    #[error(transparent)]
    Net(#[from] crate::net::NetError),
    #[error(transparent)]
    Import(#[from] crate::poh::ImportError),
    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),
    #[error("identity error: {0}")]
    Identity(#[from] crate::crypto::IdentityError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_error_message() {
        let e = QuorumError { have: 40, need: 60 };
        assert_eq!(e.to_string(), "insufficient quorum: have 40, need 60");
    }

    #[test]
    fn test_wraps_into_pulse_error() {
        let e: PulseError = ChainIntegrityError { index: 7, kind: IntegrityKind::HashMismatch }.into();
        assert!(matches!(e, PulseError::ChainIntegrity(ChainIntegrityError { index: 7, .. })));
    }
}
