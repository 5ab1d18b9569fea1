//! Proof of History sequencer
//!
//! ```text
//! genesis:  previous_hash = ZERO_HASH, index = 0
//! tick:     hash = SHA3-256(previous_hash ‖ index_le ‖ env_digest ‖ payload_digest)
//! ```
//!
//! One [`PohLog`] per region is the single writer of the chain. Everything else
//! reads through a [`PohReader`], which hands out immutable [`ChainView`]
//! snapshots and never blocks the writer.

use crate::aggregator::{Aggregator, EnvironmentalSource};
use crate::db::Storage;
use crate::error::{ChainIntegrityError, ConfigError, IntegrityKind, PulseError};
use crate::merkle::{payload_hash, payload_root};
use crate::types::{now_millis, short_hex, EnvironmentalSnapshot, Hash, PoHEntry, Region, ZERO_HASH};
use sha3::{Digest, Sha3_256};
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

// =============================================================================
// HASHING
// =============================================================================

pub fn entry_hash(previous_hash: &Hash, index: u64, env_digest: &Hash, payload_digest: &Hash) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(previous_hash);
    hasher.update(index.to_le_bytes());
    hasher.update(env_digest);
    hasher.update(payload_digest);
    hasher.finalize().into()
}

/// Produce the entry following `previous` (genesis when `None`).
///
/// Fails only when the index counter would overflow.
pub fn tick(
    previous: Option<&PoHEntry>,
    snapshot: &EnvironmentalSnapshot,
    payload_hashes: Vec<Hash>,
    wall_clock_hint: u64,
) -> Result<PoHEntry, ConfigError> {
    let (index, previous_hash) = match previous {
        Some(prev) => (prev.index.checked_add(1).ok_or(ConfigError::IndexOverflow)?, prev.hash),
        None => (0, ZERO_HASH),
    };
    let env_digest = snapshot.weighted_digest;
    let payload_digest = payload_root(&payload_hashes);
    Ok(PoHEntry {
        index,
        previous_hash,
        env_digest,
        payload_digest,
        hash: entry_hash(&previous_hash, index, &env_digest, &payload_digest),
        wall_clock_hint,
        payload_hashes,
    })
}

fn check_entry(entry: &PoHEntry) -> Result<(), ChainIntegrityError> {
    let expected = entry_hash(&entry.previous_hash, entry.index, &entry.env_digest, &entry.payload_digest);
    if expected != entry.hash || payload_root(&entry.payload_hashes) != entry.payload_digest {
        return Err(ChainIntegrityError { index: entry.index, kind: IntegrityKind::HashMismatch });
    }
    Ok(())
}

/// Check that `next` directly follows `prev`
pub fn check_link(prev: &PoHEntry, next: &PoHEntry) -> Result<(), ChainIntegrityError> {
    if prev.index.checked_add(1) != Some(next.index) {
        return Err(ChainIntegrityError { index: next.index, kind: IntegrityKind::IndexGap });
    }
    if next.previous_hash != prev.hash {
        return Err(ChainIntegrityError { index: next.index, kind: IntegrityKind::BrokenLink });
    }
    Ok(())
}

/// Recompute every entry and link, stopping at the first violation.
///
/// A segment starting at index 0 must start from the genesis constant.
pub fn check_chain(entries: &[PoHEntry]) -> Result<(), ChainIntegrityError> {
    let Some(first) = entries.first() else {
        return Ok(());
    };
    if first.index == 0 && first.previous_hash != ZERO_HASH {
        return Err(ChainIntegrityError { index: 0, kind: IntegrityKind::BrokenLink });
    }
    check_entry(first)?;
    for pair in entries.windows(2) {
        check_link(&pair[0], &pair[1])?;
        check_entry(&pair[1])?;
    }
    Ok(())
}

pub fn verify_chain(entries: &[PoHEntry]) -> bool {
    match check_chain(entries) {
        Ok(()) => true,
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

// =============================================================================
// LOG
// =============================================================================

/// Immutable view of the retained chain at one point in time
#[derive(Debug, Clone, Default)]
pub struct ChainView {
    entries: Arc<VecDeque<PoHEntry>>,
}

impl ChainView {
    pub fn tip(&self) -> Option<&PoHEntry> {
        self.entries.back()
    }

    pub fn first_index(&self) -> Option<u64> {
        self.entries.front().map(|e| e.index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_at(&self, index: u64) -> Option<&PoHEntry> {
        let first = self.first_index()?;
        let offset = index.checked_sub(first)?;
        self.entries.get(usize::try_from(offset).ok()?)
    }

    /// Retained entries within `range`
    pub fn range(&self, range: RangeInclusive<u64>) -> Vec<PoHEntry> {
        self.entries.iter().filter(|e| range.contains(&e.index)).cloned().collect()
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Integrity(#[from] ChainIntegrityError),
    #[error("import starts at {got}, log expects {expected}")]
    NotContiguous { expected: u64, got: u64 },
}

/// Single-writer, append-only PoH log with bounded in-memory retention
#[derive(Debug)]
pub struct PohLog {
    region: Region,
    entries: VecDeque<PoHEntry>,
    retain: usize,
    publisher: watch::Sender<ChainView>,
}

impl PohLog {
    pub fn new(region: Region, retain: usize) -> Self {
        let (publisher, _) = watch::channel(ChainView::default());
        Self { region, entries: VecDeque::new(), retain: retain.max(1), publisher }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn reader(&self) -> PohReader {
        PohReader { rx: self.publisher.subscribe() }
    }

    pub fn tip(&self) -> Option<&PoHEntry> {
        self.entries.back()
    }

    pub fn entry_at(&self, index: u64) -> Option<&PoHEntry> {
        let first = self.entries.front()?.index;
        self.entries.get(usize::try_from(index.checked_sub(first)?).ok()?)
    }

    /// Append an entry that links onto the current tip
    pub fn append(&mut self, entry: PoHEntry) -> Result<(), ChainIntegrityError> {
        match self.entries.back() {
            Some(tip) => check_link(tip, &entry)?,
            None if entry.index == 0 && entry.previous_hash != ZERO_HASH => {
                return Err(ChainIntegrityError { index: 0, kind: IntegrityKind::BrokenLink });
            }
            None => {}
        }
        check_entry(&entry)?;
        self.entries.push_back(entry);
        while self.entries.len() > self.retain {
            self.entries.pop_front();
        }
        self.publish();
        Ok(())
    }

    /// Copy of the retained entries in `range`
    pub fn export(&self, range: RangeInclusive<u64>) -> Vec<PoHEntry> {
        self.entries.iter().filter(|e| range.contains(&e.index)).cloned().collect()
    }

    /// Verify `entries` and append them. Nothing is appended on failure.
    pub fn import(&mut self, entries: Vec<PoHEntry>) -> Result<usize, ImportError> {
        let Some(first) = entries.first() else {
            return Ok(0);
        };
        check_chain(&entries)?;
        if let Some(tip) = self.entries.back() {
            let expected = tip.index.saturating_add(1);
            if first.index != expected {
                return Err(ImportError::NotContiguous { expected, got: first.index });
            }
            check_link(tip, first)?;
        }
        let count = entries.len();
        for entry in entries {
            self.entries.push_back(entry);
        }
        while self.entries.len() > self.retain {
            self.entries.pop_front();
        }
        self.publish();
        Ok(count)
    }

    fn publish(&self) {
        let view = ChainView { entries: Arc::new(self.entries.clone()) };
        self.publisher.send_replace(view);
    }
}

/// Read handle onto a [`PohLog`]
#[derive(Debug, Clone)]
pub struct PohReader {
    rx: watch::Receiver<ChainView>,
}

impl PohReader {
    pub fn snapshot(&self) -> ChainView {
        self.rx.borrow().clone()
    }

    pub fn tip(&self) -> Option<PoHEntry> {
        self.rx.borrow().tip().cloned()
    }

    /// Wait for the next append. Errors once the writer is gone.
    pub async fn changed(&mut self) -> Result<ChainView, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("payload queue full ({capacity})")]
pub struct QueueFull {
    pub capacity: usize,
}

/// Payload hashes waiting for a tick, drained FIFO at most `per_tick` at a time
#[derive(Debug)]
pub struct PayloadQueue {
    pending: VecDeque<Hash>,
    per_tick: usize,
    capacity: usize,
}

impl PayloadQueue {
    pub fn new(per_tick: usize, capacity: usize) -> Self {
        Self { pending: VecDeque::new(), per_tick: per_tick.max(1), capacity }
    }

    /// Queue a payload; returns the tick it is expected to land in given the
    /// index of the next tick.
    pub fn push(&mut self, payload: &[u8], next_index: u64) -> Result<u64, QueueFull> {
        if self.pending.len() >= self.capacity {
            return Err(QueueFull { capacity: self.capacity });
        }
        let ahead = (self.pending.len() / self.per_tick) as u64;
        self.pending.push_back(payload_hash(payload));
        Ok(next_index.saturating_add(ahead))
    }

    pub fn drain_tick(&mut self) -> Vec<Hash> {
        let n = self.per_tick.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// =============================================================================
// SEQUENCER
// =============================================================================

/// Drives one region's chain: collect readings, aggregate, drain payloads, tick.
pub struct Sequencer {
    log: PohLog,
    aggregator: Aggregator,
    source: Arc<dyn EnvironmentalSource>,
    payloads: Arc<Mutex<PayloadQueue>>,
    storage: Option<Arc<Storage>>,
    interval: Duration,
}

impl Sequencer {
    pub fn new(
        log: PohLog,
        aggregator: Aggregator,
        source: Arc<dyn EnvironmentalSource>,
        payloads: Arc<Mutex<PayloadQueue>>,
        interval: Duration,
    ) -> Self {
        Self { log, aggregator, source, payloads, storage: None, interval }
    }

    /// Persist every entry and snapshot
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn reader(&self) -> PohReader {
        self.log.reader()
    }

    pub fn log(&self) -> &PohLog {
        &self.log
    }

    /// Produce exactly one entry
    pub async fn step(&mut self) -> Result<PoHEntry, PulseError> {
        let now = now_millis();
        let index = match self.log.tip() {
            Some(tip) => tip.index.checked_add(1).ok_or(ConfigError::IndexOverflow)?,
            None => 0,
        };

        let readings = self.aggregator.collect(Arc::clone(&self.source), now).await;
        let snapshot = self.aggregator.aggregate(readings, index, now);
        let payloads = self.payloads.lock().await.drain_tick();

        let entry = tick(self.log.tip(), &snapshot, payloads, now)?;
        if let Some(storage) = &self.storage {
            storage.put_entry(self.log.region(), &entry)?;
            storage.put_snapshot(self.log.region(), &snapshot)?;
        }
        self.log.append(entry.clone())?;

        debug!(
            region = %self.log.region(),
            index = entry.index,
            hash = %short_hex(&entry.hash),
            sources = snapshot.source_ids.len(),
            payloads = entry.payload_hashes.len(),
            "tick"
        );
        Ok(entry)
    }

    /// Tick on a fixed cadence until `shutdown` flips to true.
    ///
    /// Returns the first fatal error (index overflow, storage, integrity).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PulseError> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(region = %self.log.region(), interval_ms = self.interval.as_millis() as u64, "Sequencer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.step().await {
                        error!(region = %self.log.region(), "Sequencer halted: {}", e);
                        return Err(e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(region = %self.log.region(), tip = ?self.log.tip().map(|e| e.index), "Sequencer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(index: u64) -> EnvironmentalSnapshot {
        EnvironmentalSnapshot {
            tick_index: index,
            source_ids: vec!["a".into()],
            weighted_digest: [7u8; 32],
            raw_values: vec![],
        }
    }

    fn chain(n: u64) -> Vec<PoHEntry> {
        let mut out: Vec<PoHEntry> = Vec::new();
        for i in 0..n {
            let e = tick(out.last(), &snapshot(i), vec![], 1_000 + i).unwrap();
            out.push(e);
        }
        out
    }

    #[test]
    fn test_genesis() {
        let g = tick(None, &snapshot(0), vec![], 0).unwrap();
        assert_eq!(g.index, 0);
        assert_eq!(g.previous_hash, ZERO_HASH);
        assert_eq!(g.payload_digest, ZERO_HASH);
    }

    #[test]
    fn test_chain_verifies() {
        let c = chain(12);
        assert!(verify_chain(&c));
        assert!(verify_chain(&c[5..]));
    }

    #[test]
    fn test_reports_offending_index() {
        let mut c = chain(6);
        c[3].env_digest[0] ^= 0xff;
        assert_eq!(check_chain(&c), Err(ChainIntegrityError { index: 3, kind: IntegrityKind::HashMismatch }));

        let mut c = chain(6);
        c[4].previous_hash = [1u8; 32];
        assert_eq!(check_chain(&c).unwrap_err().index, 4);

        let mut c = chain(6);
        c.remove(2);
        assert_eq!(check_chain(&c), Err(ChainIntegrityError { index: 3, kind: IntegrityKind::IndexGap }));
    }

    #[test]
    fn test_wall_clock_hint_not_hashed() {
        let mut c = chain(3);
        c[1].wall_clock_hint = 0;
        assert!(verify_chain(&c));
    }

    #[test]
    fn test_payload_hashes_bound_to_digest() {
        let g = tick(None, &snapshot(0), vec![payload_hash(b"tx")], 0).unwrap();
        assert_ne!(g.payload_digest, ZERO_HASH);
        let mut forged = g.clone();
        forged.payload_hashes = vec![payload_hash(b"other")];
        assert!(!verify_chain(&[forged]));
    }

    #[test]
    fn test_overflow_is_config_error() {
        let mut last = tick(None, &snapshot(0), vec![], 0).unwrap();
        last.index = u64::MAX;
        assert_eq!(tick(Some(&last), &snapshot(0), vec![], 0), Err(ConfigError::IndexOverflow));
    }

    #[test]
    fn test_log_retention_and_reader() {
        let mut log = PohLog::new(Region::from("eu"), 4);
        let reader = log.reader();
        for e in chain(10) {
            log.append(e).unwrap();
        }
        let view = reader.snapshot();
        assert_eq!(view.len(), 4);
        assert_eq!(view.first_index(), Some(6));
        assert_eq!(view.tip().map(|e| e.index), Some(9));
        assert!(view.entry_at(5).is_none());
        assert_eq!(view.entry_at(7).map(|e| e.index), Some(7));
    }

    #[test]
    fn test_log_rejects_unlinked_entry() {
        let c = chain(3);
        let mut log = PohLog::new(Region::from("eu"), 16);
        log.append(c[0].clone()).unwrap();
        assert!(log.append(c[2].clone()).is_err());
        assert_eq!(log.tip().map(|e| e.index), Some(0));
    }

    #[test]
    fn test_export_import() {
        let c = chain(8);
        let mut a = PohLog::new(Region::from("eu"), 64);
        for e in c.clone() {
            a.append(e).unwrap();
        }
        let exported = a.export(0..=7);
        let mut b = PohLog::new(Region::from("eu"), 64);
        assert_eq!(b.import(exported[..4].to_vec()).unwrap(), 4);
        assert!(matches!(b.import(exported[5..].to_vec()), Err(ImportError::NotContiguous { expected: 4, got: 5 })));
        assert_eq!(b.import(exported[4..].to_vec()).unwrap(), 4);
        assert_eq!(b.tip(), a.tip());

        let mut tampered = c.clone();
        tampered[2].hash[0] ^= 1;
        let mut d = PohLog::new(Region::from("eu"), 64);
        assert!(d.import(tampered).is_err());
        assert!(d.tip().is_none());
    }

    #[test]
    fn test_payload_queue_estimates() {
        let mut q = PayloadQueue::new(2, 5);
        assert_eq!(q.push(b"a", 10), Ok(10));
        assert_eq!(q.push(b"b", 10), Ok(10));
        assert_eq!(q.push(b"c", 10), Ok(11));
        assert_eq!(q.drain_tick().len(), 2);
        assert_eq!(q.len(), 1);
        q.push(b"d", 11).unwrap();
        q.push(b"e", 11).unwrap();
        q.push(b"f", 11).unwrap();
        q.push(b"g", 11).unwrap();
        assert_eq!(q.push(b"h", 11), Err(QueueFull { capacity: 5 }));
    }

    #[tokio::test]
    async fn test_reader_sees_appends() {
        let mut log = PohLog::new(Region::from("eu"), 16);
        let mut reader = log.reader();
        let c = chain(2);
        log.append(c[0].clone()).unwrap();
        let view = reader.changed().await.unwrap();
        assert_eq!(view.tip().map(|e| e.index), Some(0));
    }
}
