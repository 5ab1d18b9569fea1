//! Transport seam and wire format
//!
//! The core only needs best-effort `send` and `broadcast`; delivery is never
//! assumed. Messages are postcard-encoded inside a small frame:
//!
//! ```text
//! MAGIC (4) ‖ LENGTH (4, LE) ‖ CHECKSUM (4, SHA3 prefix) ‖ PAYLOAD
//! ```
//!
//! [`LocalHub`] is an in-process transport: one bounded inbox per node, a full
//! inbox drops the message instead of waiting.

use crate::crypto::sha3;
use crate::election::CandidateProof;
use crate::types::{Heartbeat, NodeId, Region};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

pub const PROTOCOL_MAGIC: [u8; 4] = *b"PLS1";
const HEADER_LEN: usize = 12;

/// Heartbeat with an ML-DSA-65 signature is ~3.4 KB
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("serialization error: {0}")]
    Serialize(#[from] postcard::Error),
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),
}

// =============================================================================
// MESSAGES
// =============================================================================

/// A candidate's VRF evaluation for one epoch boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfAnnouncement {
    pub epoch_id: u64,
    pub region: Region,
    pub boundary_index: u64,
    pub proof: CandidateProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Heartbeat(Heartbeat),
    VrfProof(VrfAnnouncement),
}

impl WireMessage {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => "heartbeat",
            Self::VrfProof(_) => "vrfproof",
        }
    }

    fn checksum(data: &[u8]) -> [u8; 4] {
        let hash = sha3(data);
        [hash[0], hash[1], hash[2], hash[3]]
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        let data = postcard::to_allocvec(self)?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
        }
        let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
        frame.extend_from_slice(&PROTOCOL_MAGIC);
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(&Self::checksum(&data));
        frame.extend_from_slice(&data);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, NetError> {
        if frame.len() < HEADER_LEN {
            return Err(NetError::Protocol("frame too short".into()));
        }
        if frame[..4] != PROTOCOL_MAGIC {
            return Err(NetError::InvalidMagic);
        }
        let len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        // Early size check prevents memory exhaustion
        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
        }
        if frame.len() != HEADER_LEN + len {
            return Err(NetError::Protocol("length mismatch".into()));
        }
        let data = &frame[HEADER_LEN..];
        if frame[8..12] != Self::checksum(data) {
            return Err(NetError::InvalidChecksum);
        }
        Ok(postcard::from_bytes(data)?)
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Bytes received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Best effort; `Ok` does not mean delivered.
    async fn send(&self, to: &NodeId, bytes: Vec<u8>) -> Result<(), NetError>;

    /// Every node of `region` except the sender. Returns how many accepted it.
    async fn broadcast(&self, region: &Region, bytes: Vec<u8>) -> Result<usize, NetError>;
}

struct Peer {
    region: Region,
    inbox: mpsc::Sender<Envelope>,
}

/// In-process message bus
pub struct LocalHub {
    peers: RwLock<BTreeMap<NodeId, Peer>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { peers: RwLock::new(BTreeMap::new()), capacity: capacity.max(1), dropped: AtomicU64::new(0) })
    }

    /// Attach a node; replaces any earlier attachment of the same id.
    pub async fn register(&self, node: NodeId, region: Region) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers.write().await.insert(node, Peer { region, inbox: tx });
        rx
    }

    /// Messages lost to full or closed inboxes
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn transport(self: &Arc<Self>, me: NodeId) -> LocalTransport {
        LocalTransport { hub: Arc::clone(self), me }
    }

    fn deliver(&self, to: &NodeId, peer: &Peer, envelope: Envelope) -> bool {
        match peer.inbox.try_send(envelope) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %to, "Dropped message: {}", e);
                false
            }
        }
    }
}

/// One node's handle on a [`LocalHub`]
#[derive(Clone)]
pub struct LocalTransport {
    hub: Arc<LocalHub>,
    me: NodeId,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, to: &NodeId, bytes: Vec<u8>) -> Result<(), NetError> {
        let peers = self.hub.peers.read().await;
        let peer = peers.get(to).ok_or_else(|| NetError::UnknownPeer(to.clone()))?;
        trace!(from = %self.me, to = %to, len = bytes.len(), "send");
        self.hub.deliver(to, peer, Envelope { from: self.me.clone(), bytes });
        Ok(())
    }

    async fn broadcast(&self, region: &Region, bytes: Vec<u8>) -> Result<usize, NetError> {
        let peers = self.hub.peers.read().await;
        let mut delivered = 0;
        for (id, peer) in peers.iter().filter(|(id, p)| &p.region == region && **id != self.me) {
            if self.hub.deliver(id, peer, Envelope { from: self.me.clone(), bytes: bytes.clone() }) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Heartbeat {
        Heartbeat {
            poh_slot: 4,
            poh_hash: [2u8; 32],
            node_id: NodeId::from("a"),
            sequence: 9,
            timestamp: 1_000,
            signature: vec![5u8; 3309],
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = WireMessage::Heartbeat(heartbeat());
        let frame = msg.encode().unwrap();
        assert_eq!(&frame[..4], b"PLS1");
        assert_eq!(WireMessage::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_frame_corruption_detected() {
        let frame = WireMessage::Heartbeat(heartbeat()).encode().unwrap();

        let mut bad = frame.clone();
        bad[0] = b'X';
        assert!(matches!(WireMessage::decode(&bad), Err(NetError::InvalidMagic)));

        let mut bad = frame.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert!(matches!(WireMessage::decode(&bad), Err(NetError::InvalidChecksum)));

        assert!(matches!(WireMessage::decode(&frame[..frame.len() - 1]), Err(NetError::Protocol(_))));

        let mut huge = frame;
        huge[4..8].copy_from_slice(&(1u32 << 30).to_le_bytes());
        assert!(matches!(WireMessage::decode(&huge), Err(NetError::MessageTooLarge(..))));
    }

    #[tokio::test]
    async fn test_broadcast_stays_in_region() {
        let hub = LocalHub::new(4);
        let mut a = hub.register(NodeId::from("a"), Region::from("eu")).await;
        let mut b = hub.register(NodeId::from("b"), Region::from("eu")).await;
        let mut c = hub.register(NodeId::from("c"), Region::from("us")).await;

        let n = hub.transport(NodeId::from("a")).broadcast(&Region::from("eu"), vec![1]).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(b.recv().await.unwrap(), Envelope { from: NodeId::from("a"), bytes: vec![1] });
        assert!(a.try_recv().is_err());
        assert!(c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_inbox_drops_instead_of_blocking() {
        let hub = LocalHub::new(1);
        let _rx = hub.register(NodeId::from("slow"), Region::from("eu")).await;
        let t = hub.transport(NodeId::from("a"));
        t.send(&NodeId::from("slow"), vec![1]).await.unwrap();
        t.send(&NodeId::from("slow"), vec![2]).await.unwrap();
        assert_eq!(hub.dropped(), 1);
        assert!(matches!(t.send(&NodeId::from("nobody"), vec![]).await, Err(NetError::UnknownPeer(_))));
    }
}
