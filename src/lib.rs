//! PulseChain
//!
//! Regional Proof-of-History chains anchored to environmental readings, with
//! VRF leader election, signed heartbeats and quorum finalization.

pub mod aggregator;
pub mod config;
pub mod crypto;
pub mod db;
pub mod election;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod merkle;
pub mod net;
pub mod poh;
pub mod registry;
pub mod types;
pub mod validator;
pub mod vrf;

// Core exports
pub use config::{Config, DedupMode, HeartbeatPolicy, OutlierPolicy, QuorumMode, QuorumPolicy, TrustPolicy};
pub use crypto::{sha3, verify, Keypair, NodeIdentity};
pub use db::Storage;
pub use error::PulseError;
pub use types::*;

// Chain
pub use aggregator::{Aggregator, EnvironmentalSource, SourceSpec, Unavailable};
pub use merkle::{MerkleProof, MerkleTree};
pub use poh::{tick, verify_chain, ChainView, PayloadQueue, PohLog, PohReader, Sequencer};

// Consensus
pub use election::{elect, verify_and_select, CandidateProof, ScheduleBook};
pub use heartbeat::{HeartbeatEmitter, HeartbeatEngine, NodeStatus};
pub use registry::NodeRegistry;
pub use validator::{Finalization, FinalizationResult, RejectReason, SegmentRange, Validator};

// Engine
pub use engine::{ConsensusEngine, ConsensusEvent, EngineError, EngineEvent, Wiring};
pub use net::{LocalHub, Transport, WireMessage};
