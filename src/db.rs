//! Sled-based storage layer
//!
//! PoH entries, snapshots and leader schedules are append-only: rewriting a key
//! with different contents is a [`DbError::Conflict`]. Node records are
//! overwritten in place; their trust history is append-only.

use crate::registry::TrustEvent;
use crate::types::{EnvironmentalSnapshot, LeaderSchedule, NodeId, NodeRecord, PoHEntry, Region};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::ops::RangeInclusive;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("not found")]
    NotFound,
    #[error("append-only {0} already holds a different value")]
    Conflict(&'static str),
}

pub struct Storage {
    db: Db,
    poh: Tree,
    snapshots: Tree,
    schedules: Tree,
    nodes: Tree,
    trust_history: Tree,
}

/// region (length-prefixed) ‖ suffix
fn region_key(region: &Region, suffix: &[u8]) -> Vec<u8> {
    let name = region.as_str().as_bytes();
    let mut key = Vec::with_capacity(2 + name.len() + suffix.len());
    key.extend_from_slice(&(name.len() as u16).to_be_bytes());
    key.extend_from_slice(name);
    key.extend_from_slice(suffix);
    key
}

fn head_key(region: &Region) -> Vec<u8> {
    let mut key = b"head/".to_vec();
    key.extend_from_slice(&region_key(region, &[]));
    key
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self, DbError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, DbError> {
        let poh = db.open_tree("poh")?;
        let snapshots = db.open_tree("snapshots")?;
        let schedules = db.open_tree("schedules")?;
        let nodes = db.open_tree("nodes")?;
        let trust_history = db.open_tree("trust_history")?;
        Ok(Self { db, poh, snapshots, schedules, nodes, trust_history })
    }

    fn put_once<T: Serialize>(tree: &Tree, what: &'static str, key: Vec<u8>, value: &T) -> Result<bool, DbError> {
        let bytes = bincode::serialize(value)?;
        match tree.compare_and_swap(key, None as Option<&[u8]>, Some(bytes.as_slice()))? {
            Ok(()) => Ok(true),
            Err(cas) if cas.current.as_deref() == Some(bytes.as_slice()) => Ok(false),
            Err(_) => Err(DbError::Conflict(what)),
        }
    }

    fn get<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<T, DbError> {
        let value = tree.get(key)?.ok_or(DbError::NotFound)?;
        Ok(bincode::deserialize(&value)?)
    }

    // PoH
    pub fn put_entry(&self, region: &Region, entry: &PoHEntry) -> Result<(), DbError> {
        let key = region_key(region, &entry.index.to_be_bytes());
        if Self::put_once(&self.poh, "poh entry", key, entry)? {
            let head = self.head(region).ok();
            if head.is_none_or(|h| h < entry.index) {
                self.db.insert(head_key(region), entry.index.to_be_bytes().to_vec())?;
            }
        }
        Ok(())
    }

    pub fn get_entry(&self, region: &Region, index: u64) -> Result<PoHEntry, DbError> {
        Self::get(&self.poh, &region_key(region, &index.to_be_bytes()))
    }

    pub fn entries_range(&self, region: &Region, range: RangeInclusive<u64>) -> Result<Vec<PoHEntry>, DbError> {
        let start = region_key(region, &range.start().to_be_bytes());
        let end = region_key(region, &range.end().to_be_bytes());
        let mut out = Vec::new();
        for item in self.poh.range(start..=end) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    pub fn head(&self, region: &Region) -> Result<u64, DbError> {
        let value = self.db.get(head_key(region))?.ok_or(DbError::NotFound)?;
        let bytes: [u8; 8] = value.as_ref().try_into().map_err(|_| DbError::NotFound)?;
        Ok(u64::from_be_bytes(bytes))
    }

    // Snapshots
    pub fn put_snapshot(&self, region: &Region, snapshot: &EnvironmentalSnapshot) -> Result<(), DbError> {
        let key = region_key(region, &snapshot.tick_index.to_be_bytes());
        Self::put_once(&self.snapshots, "snapshot", key, snapshot).map(|_| ())
    }

    pub fn get_snapshot(&self, region: &Region, tick_index: u64) -> Result<EnvironmentalSnapshot, DbError> {
        Self::get(&self.snapshots, &region_key(region, &tick_index.to_be_bytes()))
    }

    // Leader schedules
    pub fn put_schedule(&self, schedule: &LeaderSchedule) -> Result<(), DbError> {
        let mut suffix = schedule.epoch_id.to_be_bytes().to_vec();
        suffix.extend_from_slice(&schedule.round.to_be_bytes());
        let key = region_key(&schedule.region, &suffix);
        Self::put_once(&self.schedules, "schedule", key, schedule).map(|_| ())
    }

    /// All rounds of every epoch of `region`, in (epoch, round) order
    pub fn schedules_for(&self, region: &Region) -> Result<Vec<LeaderSchedule>, DbError> {
        let mut out = Vec::new();
        for item in self.schedules.scan_prefix(region_key(region, &[])) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    // Nodes
    pub fn put_node(&self, record: &NodeRecord) -> Result<(), DbError> {
        let value = bincode::serialize(record)?;
        self.nodes.insert(record.node_id.as_str().as_bytes(), value)?;
        Ok(())
    }

    pub fn get_node(&self, node: &NodeId) -> Result<NodeRecord, DbError> {
        Self::get(&self.nodes, node.as_str().as_bytes())
    }

    pub fn all_nodes(&self) -> Result<Vec<NodeRecord>, DbError> {
        let mut out = Vec::new();
        for item in self.nodes.iter() {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    // Trust history
    pub fn append_trust_event(&self, node: &NodeId, event: &TrustEvent) -> Result<(), DbError> {
        let seq = self.db.generate_id()?;
        let mut key = node.as_str().as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&seq.to_be_bytes());
        self.trust_history.insert(key, bincode::serialize(event)?)?;
        Ok(())
    }

    pub fn trust_history(&self, node: &NodeId) -> Result<Vec<TrustEvent>, DbError> {
        let mut prefix = node.as_str().as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for item in self.trust_history.scan_prefix(prefix) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), DbError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poh::tick;
    use crate::registry::TrustReason;

    fn snapshot(i: u64) -> EnvironmentalSnapshot {
        EnvironmentalSnapshot { tick_index: i, source_ids: vec![], weighted_digest: [i as u8; 32], raw_values: vec![] }
    }

    fn chain(n: u64) -> Vec<PoHEntry> {
        let mut out: Vec<PoHEntry> = Vec::new();
        for i in 0..n {
            let e = tick(out.last(), &snapshot(i), vec![], i).unwrap();
            out.push(e);
        }
        out
    }

    #[test]
    fn test_entries_are_append_only() {
        let db = Storage::temporary().unwrap();
        let eu = Region::from("eu");
        let c = chain(5);
        for e in &c {
            db.put_entry(&eu, e).unwrap();
        }
        db.put_entry(&eu, &c[2]).unwrap();
        let mut forged = c[2].clone();
        forged.wall_clock_hint = 99;
        assert!(matches!(db.put_entry(&eu, &forged), Err(DbError::Conflict(_))));

        assert_eq!(db.head(&eu).unwrap(), 4);
        assert_eq!(db.get_entry(&eu, 3).unwrap(), c[3]);
        assert_eq!(db.entries_range(&eu, 1..=3).unwrap(), c[1..=3].to_vec());
        assert!(matches!(db.head(&Region::from("us")), Err(DbError::NotFound)));
    }

    #[test]
    fn test_regions_do_not_mix() {
        let db = Storage::temporary().unwrap();
        let c = chain(2);
        db.put_entry(&Region::from("eu"), &c[0]).unwrap();
        db.put_entry(&Region::from("eu-west"), &c[1]).unwrap();
        assert_eq!(db.entries_range(&Region::from("eu"), 0..=u64::MAX).unwrap().len(), 1);
    }

    #[test]
    fn test_schedules_and_trust_history() {
        let db = Storage::temporary().unwrap();
        let eu = Region::from("eu");
        let s = LeaderSchedule {
            epoch_id: 2,
            region: eu.clone(),
            round: 0,
            leader_node_id: NodeId::from("a"),
            vrf_output: [1u8; 32],
            vrf_proof: vec![2u8; 96],
            boundary_index: 128,
            boundary_hash: [3u8; 32],
        };
        db.put_schedule(&s).unwrap();
        let mut r1 = s.clone();
        r1.round = 1;
        r1.leader_node_id = NodeId::from("b");
        db.put_schedule(&r1).unwrap();
        let mut conflicting = s.clone();
        conflicting.leader_node_id = NodeId::from("c");
        assert!(db.put_schedule(&conflicting).is_err());
        assert_eq!(db.schedules_for(&eu).unwrap(), vec![s, r1]);

        let a = NodeId::from("a");
        let ev = TrustEvent { at_ms: 1, delta: -5, reason: TrustReason::Outlier, score_after: 45 };
        db.append_trust_event(&a, &ev).unwrap();
        db.append_trust_event(&NodeId::from("ab"), &ev).unwrap();
        assert_eq!(db.trust_history(&a).unwrap(), vec![ev]);
    }

    #[test]
    fn test_nodes_roundtrip() {
        let db = Storage::temporary().unwrap();
        let mut r = NodeRecord::new(NodeId::from("a"), vec![1, 2], [0u8; 32], Region::from("eu"), 10, 50);
        db.put_node(&r).unwrap();
        r.trust_score = 40;
        db.put_node(&r).unwrap();
        assert_eq!(db.get_node(&NodeId::from("a")).unwrap().trust_score, 40);
        assert_eq!(db.all_nodes().unwrap().len(), 1);
    }
}
