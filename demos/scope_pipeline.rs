//! Example: Synthetic scope feeding a filter graph
//!
//! A simulated two-channel oscilloscope and a logic analyzer are polled on a
//! background thread; every cycle the graph smooths, slices and inverts the
//! captures and prints what came out.
//!
//! Usage:
//!   cargo run --release --example scope_pipeline -- \
//!       --threads 4 --cycles 20 --samples 4096
//!
//! With an engine config file:
//!   cargo run --release --example scope_pipeline -- --config engine.toml

use clap::Parser;
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};
use wavegraph::nodes::{InvertFilter, MovingAverageFilter, SubtractFilter, ThresholdFilter};
use wavegraph::{
    Acquisition, EngineConfig, Instrument, Pipeline, SparseWaveform, Stream, StreamFlags,
    StreamType, UniformWaveform, Unit,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Worker threads (overrides the config file)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Number of cycles to run
    #[arg(short = 'n', long, default_value = "10")]
    cycles: usize,

    /// Samples per scope channel
    #[arg(short, long, default_value = "2048")]
    samples: usize,

    /// Moving average window
    #[arg(short, long, default_value = "8")]
    window: usize,
}

/// Noisy square wave on ch1, its delayed copy on ch2
struct SimulatedScope {
    samples: usize,
    period: usize,
    captures: u64,
}

impl Instrument for SimulatedScope {
    fn name(&self) -> &str {
        "simulated scope"
    }

    fn channel_streams(&self) -> Vec<Stream> {
        vec![
            Stream::new("ch1", Unit::Volts, StreamType::Analog),
            Stream::new("ch2", Unit::Volts, StreamType::Analog),
        ]
    }

    fn acquire(&mut self) -> Option<Acquisition> {
        let mut rng = rand::thread_rng();
        let square = |i: usize| if (i / (self.period / 2)) % 2 == 0 { 0.0 } else { 3.3 };
        let ch1: Vec<f32> = (0..self.samples)
            .map(|i| square(i) + rng.gen_range(-0.2..0.2))
            .collect();
        let ch2: Vec<f32> = (0..self.samples)
            .map(|i| square(i + self.period / 4) + rng.gen_range(-0.2..0.2))
            .collect();

        self.captures += 1;
        // 1 GS/s
        let mut first = UniformWaveform::from_samples(1_000_000, &ch1);
        first.base.start_timestamp = self.captures as i64;
        let second = UniformWaveform::from_samples(1_000_000, &ch2);
        std::thread::sleep(Duration::from_millis(5));
        Some(
            Acquisition::new()
                .with_channel(0, Box::new(first))
                .with_channel(1, Box::new(second)),
        )
    }
}

/// Run-length encoded clock on one digital channel
struct SimulatedAnalyzer {
    edges: usize,
}

impl Instrument for SimulatedAnalyzer {
    fn name(&self) -> &str {
        "simulated logic analyzer"
    }

    fn channel_streams(&self) -> Vec<Stream> {
        vec![Stream::new("d0", Unit::Counts, StreamType::Digital).with_flags(StreamFlags::DO_NOT_INTERPOLATE)]
    }

    fn acquire(&mut self) -> Option<Acquisition> {
        let mut rng = rand::thread_rng();
        let mut clock = SparseWaveform::new(10_000_000);
        let mut offset = 0;
        for i in 0..self.edges {
            let duration = rng.gen_range(8..12);
            clock.push(offset, duration, i % 2 == 1);
            offset += duration;
        }
        Some(Acquisition::new().with_channel(0, Box::new(clock)))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(threads) = args.threads {
        config.worker_threads = threads;
    }
    config.validate()?;
    info!("Engine config: {:?}", config);

    let mut pipeline = Pipeline::from_config(&config);
    pipeline.add_instrument(
        "scope",
        SimulatedScope {
            samples: args.samples.max(args.window),
            period: 256,
            captures: 0,
        },
    )?;
    pipeline.add_instrument("la", SimulatedAnalyzer { edges: 64 })?;

    let graph = pipeline.graph_mut();
    graph.add_node("smooth", MovingAverageFilter::new(args.window))?;
    graph.add_node("slice", ThresholdFilter::new(1.65, 0.3))?;
    graph.add_node("slice_n", InvertFilter)?;
    graph.add_node("skew", SubtractFilter)?;
    graph.add_node("clk_n", InvertFilter)?;
    graph.connect("scope", "ch1", "smooth", "din")?;
    graph.connect("smooth", "avg", "slice", "din")?;
    graph.connect("slice", "data", "slice_n", "din")?;
    graph.connect("scope", "ch1", "skew", "a")?;
    graph.connect("scope", "ch2", "skew", "b")?;
    graph.connect("la", "d0", "clk_n", "din")?;

    for (node, input) in pipeline.graph().unconnected_inputs() {
        warn!("[{}] Input '{}' is not connected", node, input);
    }

    pipeline.spawn_acquisition()?;
    for _ in 0..args.cycles {
        if !pipeline.wait_for_acquisition(Duration::from_secs(1)) {
            warn!("No acquisition within 1s");
            continue;
        }
        let cycle = pipeline.run_cycle();

        let graph = pipeline.graph();
        let edges = graph
            .node("slice_n")
            .and_then(|node| {
                let streams = node.streams();
                streams[0].uniform::<bool>().map(|w| {
                    w.samples
                        .as_slice()
                        .windows(2)
                        .filter(|pair| pair[0] != pair[1])
                        .count()
                })
            })
            .unwrap_or(0);
        let clock = graph
            .node("clk_n")
            .and_then(|node| node.streams()[0].sparse::<bool>().map(SparseWaveform::len))
            .unwrap_or(0);

        info!(
            "Cycle {}: {} acquisitions, {} nodes in {:?}, {} edges on slice_n, {} clock symbols",
            cycle.stats.cycle,
            cycle.acquisitions,
            cycle.stats.nodes_executed,
            cycle.stats.elapsed,
            edges,
            clock
        );
    }
    pipeline.stop_acquisition();

    let accelerator = pipeline.executor().accelerator();
    info!(
        "Device '{}': {} of {} bytes in use, {} submissions, {} scratch buffers created",
        accelerator.device().name(),
        accelerator.device().allocated_bytes(),
        accelerator.device().capacity_bytes(),
        accelerator.queue().submissions(),
        accelerator.scratch().created_count()
    );

    Ok(())
}
