use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use glam::{IVec3, Vec3};
use lodtrack_octree::OctreeBuilder;
use lodtrack_stream::{
    ChunkPayload, ChunkProducer, LocalOctreeQuery, RequestData, Tracker, TrackerConfig,
    TrackerEvent,
};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lodtrack-cli", about = "CLI tool for lodtrack operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate versions
    Info,
    /// Build one octree and summarise its leaves
    Build {
        /// Number of resolution levels
        #[arg(short, long, default_value = "3")]
        lods: u32,
        /// Half-width of the finest-level cube
        #[arg(short, long, default_value = "1")]
        range: i32,
        /// Grid coordinate to centre on, as x,y,z
        #[arg(long, default_value = "0,0,0", allow_hyphen_values = true)]
        at: String,
    },
    /// Walk a simulated viewer through a tracker
    Walk {
        /// Tracker config file (.yaml or .json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the number of resolution levels
        #[arg(long)]
        lods: Option<u32>,
        /// Override the finest-level range
        #[arg(long)]
        range: Option<i32>,
        /// Override the chunk size in world units
        #[arg(long)]
        chunk_size: Option<f32>,
        /// Track vertical movement
        #[arg(long)]
        track_y: bool,
        /// Number of positions to feed
        #[arg(short, long, default_value = "10")]
        steps: u32,
        /// World-space offset per step, as x,y,z
        #[arg(long, default_value = "16,0,0", allow_hyphen_values = true)]
        step: String,
        /// Delay between positions
        #[arg(long, default_value = "5")]
        interval_ms: u64,
        /// Simulated production latency per chunk
        #[arg(long, default_value = "20")]
        latency_ms: u64,
        /// Fail every k-th production request
        #[arg(long)]
        fail_every: Option<u64>,
    },
}

fn parse_triple(value: &str) -> anyhow::Result<[f32; 3]> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let [x, y, z] = parts.as_slice() else {
        bail!("expected x,y,z, got {value:?}");
    };
    Ok([
        x.parse().with_context(|| format!("bad x in {value:?}"))?,
        y.parse().with_context(|| format!("bad y in {value:?}"))?,
        z.parse().with_context(|| format!("bad z in {value:?}"))?,
    ])
}

/// Producer that answers after a fixed delay, failing every k-th request.
struct SimulatedProducer {
    latency: Duration,
    fail_every: Option<u64>,
    issued: Cell<u64>,
}

impl ChunkProducer for SimulatedProducer {
    type Payload = u64;

    fn request_data(&self, request: &mut RequestData<'_, u64>) {
        let serial = self.issued.get() + 1;
        self.issued.set(serial);
        let fail = self.fail_every.is_some_and(|k| k > 0 && serial % k == 0);
        let latency = self.latency;
        let token = request.token().clone();
        tracing::trace!(chunk = %request.chunk(), serial, "producing chunk");

        request.accept(async move {
            tokio::time::sleep(latency).await;
            if token.is_cancelled() {
                return Err(format!("request {serial} cancelled"));
            }
            if fail {
                return Err(format!("request {serial} failed"));
            }
            Ok(serial)
        });
    }
}

#[derive(Debug, Default)]
struct WalkTally {
    added: u64,
    removed: u64,
    failed_payloads: u64,
    cycles: u64,
    failed_cycles: u64,
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<TrackerEvent<u64>>, tally: &mut WalkTally) {
    while let Ok(event) = events.try_recv() {
        match event {
            TrackerEvent::ChunkAdded { chunk, payload } => {
                tally.added += 1;
                match payload {
                    Some(ChunkPayload::Loaded(serial)) => {
                        tracing::debug!(%chunk, serial, "chunk added");
                    }
                    Some(ChunkPayload::Placeholder) => {
                        tracing::debug!(%chunk, "chunk added with placeholder");
                    }
                    None => {
                        tally.failed_payloads += 1;
                        tracing::warn!(%chunk, "chunk added without payload");
                    }
                }
            }
            TrackerEvent::ChunkRemoved { chunk } => {
                tally.removed += 1;
                tracing::debug!(%chunk, "chunk removed");
            }
            TrackerEvent::CycleComplete { coord } => {
                tally.cycles += 1;
                tracing::info!(%coord, "cycle complete");
            }
            TrackerEvent::CycleFailed { coord, error } => {
                tally.failed_cycles += 1;
                tracing::warn!(%coord, %error, "cycle failed");
            }
        }
    }
}

fn run_build(lods: u32, range: i32, at: &str) -> anyhow::Result<()> {
    let [x, y, z] = parse_triple(at)?;
    let center = IVec3::new(x as i32, y as i32, z as i32);
    if lods == 0 || lods > 31 {
        bail!("lods must be in 1..=31, got {lods}");
    }
    let max_lod = 1 << (lods - 1);
    let tree = OctreeBuilder::new(range, max_lod)?.build(center)?;

    let mut by_size: BTreeMap<i32, usize> = BTreeMap::new();
    for leaf in tree.leaves() {
        *by_size.entry(leaf.size()).or_default() += 1;
    }
    println!("Octree at {center}: lods={lods}, range={range}, max_lod={max_lod}");
    println!(
        "Nodes: {}, roots: {}, leaves: {}",
        tree.len(),
        tree.roots().count(),
        tree.leaves().count()
    );
    for (size, count) in by_size {
        println!("  size {size:>5}: {count} leaves");
    }
    Ok(())
}

struct WalkArgs {
    config: TrackerConfig,
    steps: u32,
    step: Vec3,
    interval: Duration,
    producer: SimulatedProducer,
}

async fn run_walk(args: WalkArgs) -> anyhow::Result<()> {
    let WalkArgs {
        config,
        steps,
        step,
        interval,
        producer,
    } = args;
    println!(
        "Walk: {steps} steps of {step}, chunk_size={}, lods={}, range={}",
        config.chunk_size, config.lods, config.min_lod_range
    );

    let query = LocalOctreeQuery::new(config.chunk_size);
    let (tracker, mut events) = Tracker::new(config, query, producer)?;
    let mut tally = WalkTally::default();

    for i in 0..steps {
        let position = step * i as f32;
        tracing::debug!(%position, "viewer moved");
        tracker.update(position);
        tokio::time::sleep(interval).await;
        drain_events(&mut events, &mut tally);
    }

    tracker.idle().await;
    let loaded = tracker.wait_for_load().await;
    while tracker.pending_dominators() > 0 {
        tokio::task::yield_now().await;
    }
    drain_events(&mut events, &mut tally);

    let stats = tracker.stats();
    println!(
        "Events: {} added, {} removed, {} without payload, {} cycles, {} failed cycles",
        tally.added, tally.removed, tally.failed_payloads, tally.cycles, tally.failed_cycles
    );
    println!(
        "Requests: {} created, {} reused, {} cancelled, {} live ({} settled)",
        stats.requests_created,
        stats.requests_reused,
        stats.requests_cancelled,
        stats.live_requests,
        loaded.len()
    );
    println!(
        "Cycles: {} completed, {} failed, {} coalesced, last took {:?}",
        stats.cycles_completed,
        stats.cycles_failed,
        stats.updates_coalesced,
        stats.last_cycle_time
    );
    println!(
        "Rendered: {} chunks, {} dominators pending",
        stats.rendered_chunks,
        tracker.pending_dominators()
    );

    tracker.destroy();
    drain_events(&mut events, &mut tally);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("lodtrack-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", lodtrack_common::crate_info());
            println!("octree: {}", lodtrack_octree::crate_info());
            println!("stream: {}", lodtrack_stream::crate_info());
        }
        Commands::Build { lods, range, at } => run_build(lods, range, &at)?,
        Commands::Walk {
            config,
            lods,
            range,
            chunk_size,
            track_y,
            steps,
            step,
            interval_ms,
            latency_ms,
            fail_every,
        } => {
            let mut tracker_config = match &config {
                Some(path) => TrackerConfig::load(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => TrackerConfig::default(),
            };
            if let Some(lods) = lods {
                tracker_config.lods = lods;
            }
            if let Some(range) = range {
                tracker_config.min_lod_range = range;
            }
            if let Some(chunk_size) = chunk_size {
                tracker_config.chunk_size = chunk_size;
            }
            tracker_config.track_y |= track_y;
            tracker_config.validate()?;

            let args = WalkArgs {
                config: tracker_config,
                steps,
                step: Vec3::from_array(parse_triple(&step)?),
                interval: Duration::from_millis(interval_ms),
                producer: SimulatedProducer {
                    latency: Duration::from_millis(latency_ms),
                    fail_every,
                    issued: Cell::new(0),
                },
            };

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            LocalSet::new().block_on(&runtime, run_walk(args))?;
        }
    }

    Ok(())
}
