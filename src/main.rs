//! PulseChain Node
//!
//! Runs one region in-process: a sequencer over simulated environmental
//! sources and N consensus engines talking through a local hub.

use async_trait::async_trait;
use clap::Parser;
use pulsechain::aggregator::FIELD_RANGES;
use pulsechain::{
    millis_to_string, now_millis, sha3, Aggregator, Config, ConsensusEngine, ConsensusEvent, EnvironmentalReading, EnvironmentalSource,
    FinalizationResult, LocalHub, NodeId, NodeIdentity, NodeRegistry, PayloadQueue, PohLog, PulseError, Region,
    SourceSpec, Storage, Sequencer, Unavailable, Wiring,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pulsechain", version, about = "PulseChain regional node cluster")]
struct Args {
    /// JSON config file; defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persist chain, schedules and trust history here
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Nodes in the region
    #[arg(short, long, default_value = "5")]
    nodes: usize,

    #[arg(short, long, default_value = "eu")]
    region: String,

    /// Stop after this many ticks (0 runs until Ctrl+C)
    #[arg(short, long, default_value = "0")]
    ticks: u64,

    /// Override the tick interval
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Submit a demo payload every N ticks (0 disables)
    #[arg(long, default_value = "0")]
    payload_every: u64,
}

/// Deterministic readings per (source, time), within each field's valid range
struct SimulatedSource {
    weights: BTreeMap<String, f64>,
}

impl SimulatedSource {
    fn new(sources: &[SourceSpec]) -> Self {
        Self { weights: sources.iter().map(|s| (s.source_id.clone(), s.weight)).collect() }
    }
}

#[async_trait]
impl EnvironmentalSource for SimulatedSource {
    async fn fetch(&self, source_id: &str, as_of_ms: u64) -> Result<EnvironmentalReading, Unavailable> {
        let weight = self.weights.get(source_id).copied().ok_or_else(|| Unavailable {
            source_id: source_id.to_string(),
            reason: "not simulated".into(),
        })?;
        let mut rng = ChaCha20Rng::from_seed(sha3(&[source_id.as_bytes(), &as_of_ms.to_le_bytes()].concat()));
        let mut sample = |i: usize| {
            let (lo, hi) = FIELD_RANGES[i];
            Some(rng.gen_range(lo..hi))
        };
        let mut reading = EnvironmentalReading::new(source_id, as_of_ms, weight);
        reading.temperature = sample(0);
        reading.humidity = sample(1);
        reading.pressure = sample(2);
        reading.light = sample(3);
        reading.sound = sample(4);
        reading.vibration = sample(5);
        Ok(reading)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pulsechain=info")),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("Node failed: {}", e);
        std::process::exit(1);
    }
}

fn log_finalization(f: &pulsechain::Finalization) {
    match f.result {
        FinalizationResult::Confirmed(range) => {
            info!(range = %range, contributors = f.contributors.len(), "Segment confirmed")
        }
        FinalizationResult::Rejected(reason) => {
            warn!(range = ?f.range, reason = ?reason, contributors = f.contributors.len(), "Segment rejected")
        }
    }
}

async fn run(args: Args) -> Result<(), PulseError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(ms) = args.tick_ms {
        config.tick_interval_ms = ms;
        config.fetch_timeout_ms = config.fetch_timeout_ms.min(ms / 2);
    }
    config.validate()?;

    let region = Region::new(args.region.clone());
    let storage = match &args.data_dir {
        Some(dir) => Some(Arc::new(Storage::open(dir)?)),
        None => None,
    };

    // Chain, resumed from storage when there is one
    let mut log = PohLog::new(region.clone(), config.retain_entries);
    let mut aggregator = Aggregator::from_config(&config)?;
    if let Some(storage) = &storage {
        if let Ok(head) = storage.head(&region) {
            let from = head.saturating_sub(config.retain_entries as u64 - 1);
            let imported = log.import(storage.entries_range(&region, from..=head)?)?;
            aggregator.resume_from(storage.get_snapshot(&region, head)?.weighted_digest);
            let sealed = log.tip().map(|t| millis_to_string(t.wall_clock_hint)).unwrap_or_default();
            info!(region = %region, head, imported, sealed = %sealed, "Resumed chain from storage");
        }
    }

    // Identities and a shared starting registry
    let identities: Vec<NodeIdentity> = (0..args.nodes)
        .map(|i| NodeIdentity::generate(NodeId::new(format!("{region}-{i:02}")), region.clone()))
        .collect();
    let mut registry = NodeRegistry::new(config.trust);
    for (i, id) in identities.iter().enumerate() {
        registry.register(id.record(10 + i as u64, config.trust.initial)).map_err(pulsechain::EngineError::from)?;
    }

    let hub = LocalHub::new(config.heartbeat.peer_queue_capacity);
    let payloads = Arc::new(Mutex::new(PayloadQueue::new(config.max_payloads_per_tick, config.payload_queue_capacity)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source = Arc::new(SimulatedSource::new(&config.sources));
    let mut sequencer = Sequencer::new(
        log,
        aggregator,
        source,
        Arc::clone(&payloads),
        Duration::from_millis(config.tick_interval_ms),
    );
    if let Some(storage) = &storage {
        sequencer = sequencer.with_storage(Arc::clone(storage));
    }
    let mut tips = sequencer.reader();

    let mut engines = Vec::with_capacity(identities.len());
    let mut tasks = Vec::with_capacity(identities.len());
    for identity in identities {
        let inbox = hub.register(identity.node_id.clone(), identity.region.clone()).await;
        let wiring = Wiring {
            reader: sequencer.reader(),
            payloads: Arc::clone(&payloads),
            transport: Arc::new(hub.transport(identity.node_id.clone())),
        };
        let mut engine = ConsensusEngine::new(config.clone(), identity, registry.clone(), wiring);
        if let Some(storage) = &storage {
            engine = engine.with_storage(Arc::clone(storage));
        }
        let engine = Arc::new(engine);
        tasks.push(tokio::spawn(Arc::clone(&engine).run(inbox, shutdown_rx.clone())));
        engines.push(engine);
    }
    let Some(observer) = engines.first().cloned() else {
        warn!("No nodes configured");
        return Ok(());
    };
    let mut events = observer.subscribe();

    let sequencer_task = tokio::spawn(sequencer.run(shutdown_rx.clone()));
    info!(
        region = %region,
        nodes = engines.len(),
        tick_ms = config.tick_interval_ms,
        at = %millis_to_string(now_millis()),
        "Cluster started"
    );
    info!("Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ConsensusEvent::Finalized(f)) => log_finalization(&f),
                Ok(ConsensusEvent::LeaderElected(s)) => {
                    info!(epoch = s.epoch_id, round = s.round, leader = %s.leader_node_id, "Leader elected")
                }
                Ok(ConsensusEvent::NodeExcluded(node)) => warn!(node = %node, "Node excluded"),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(missed = n, "Event stream lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            view = tips.changed() => {
                let Ok(view) = view else { break };
                let Some(index) = view.tip().map(|t| t.index) else { continue };
                if args.payload_every > 0 && index % args.payload_every == 0 {
                    match observer.submit_payload(format!("demo-{index}").as_bytes()).await {
                        Ok(expected) => info!(expected, "Payload queued"),
                        Err(e) => warn!("Payload refused: {}", e),
                    }
                }
                if args.ticks > 0 && index + 1 >= args.ticks {
                    info!(ticks = args.ticks, "Tick limit reached");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match sequencer_task.await {
        Ok(result) => result?,
        Err(e) => warn!("Sequencer task failed: {}", e),
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Engine task failed: {}", e);
        }
    }

    match observer.latest_confirmed_segment().await {
        Some(FinalizationResult::Confirmed(range)) => info!(range = %range, "Latest confirmed segment"),
        _ => info!("No segment confirmed"),
    }
    if let Some(leader) = observer.current_leader(&region).await {
        info!(leader = %leader, "Current leader");
    }
    for (other, heard) in observer.foreign_heartbeats().await {
        info!(region = %other, heard, "Foreign heartbeats observed");
    }
    if let Some(storage) = &storage {
        storage.flush()?;
    }
    info!("Shutting down...");
    Ok(())
}
