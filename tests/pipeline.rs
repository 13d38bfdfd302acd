//! End-to-end scenarios through the public API

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use wavegraph::nodes::{InvertFilter, MovingAverageFilter, SubtractFilter, ThresholdFilter, WaveformSource};
use wavegraph::{
    Accelerator, Acquisition, ConnectionError, EngineConfig, FilterGraph, FilterGraphExecutor,
    FilterRegistry, Instrument, Pipeline, Residency, SparseWaveform, Stream, StreamType,
    UniformWaveform, Unit, Waveform,
};

/// Scope that replays a fixed list of ch1 captures
struct Replay {
    captures: Vec<Vec<f32>>,
    polled: Arc<AtomicUsize>,
}

impl Instrument for Replay {
    fn name(&self) -> &str {
        "replay"
    }

    fn channel_streams(&self) -> Vec<Stream> {
        vec![Stream::new("ch1", Unit::Volts, StreamType::Analog)]
    }

    fn acquire(&mut self) -> Option<Acquisition> {
        self.polled.fetch_add(1, Ordering::SeqCst);
        if self.captures.is_empty() {
            return None;
        }
        let samples = self.captures.remove(0);
        Some(Acquisition::new().with_channel(0, Box::new(UniformWaveform::from_samples(100, &samples))))
    }
}

fn bools(pipeline: &Pipeline, node: &str) -> Option<Vec<bool>> {
    let node = pipeline.graph().node(node)?;
    let streams = node.streams();
    streams[0].uniform::<bool>().map(|w| w.samples.as_slice().to_vec())
}

#[test]
fn test_registry_built_graph_runs() {
    let registry = FilterRegistry::with_builtin_filters();
    let mut graph = FilterGraph::new();
    let scope = graph.add_node("scope", WaveformSource::analog(&["ch1", "ch2"])).unwrap();
    graph.add_node_by_protocol(&registry, "Subtract", "diff").unwrap();
    graph.add_node_by_protocol(&registry, "Threshold", "thresh").unwrap();
    graph.connect("scope", "ch1", "diff", "a").unwrap();
    graph.connect("scope", "ch2", "diff", "b").unwrap();
    graph.connect("diff", "diff", "thresh", "din").unwrap();

    assert!(matches!(
        graph.add_node_by_protocol(&registry, "FFT", "fft"),
        Err(ConnectionError::UnknownProtocol(_))
    ));

    scope.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(10, &[1.0f32, 0.0, 2.0])));
    scope.set_stream_waveform(1, Box::new(UniformWaveform::from_samples(10, &[0.5f32, 0.5, 0.5])));

    let executor = FilterGraphExecutor::new(3, Arc::new(Accelerator::default()));
    let stats = executor.run_blocking(graph.nodes());
    assert_eq!(stats.nodes_executed, 3);

    let thresh = graph.node("thresh").unwrap();
    let streams = thresh.streams();
    // Default threshold is zero
    assert_eq!(streams[0].uniform::<bool>().unwrap().samples.as_slice(), &[true, false, true]);
}

#[test]
fn test_device_and_host_nodes_share_one_stream() {
    let polled = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::new(FilterGraphExecutor::new(4, Arc::new(Accelerator::default())));
    pipeline
        .add_instrument(
            "scope",
            Replay {
                captures: vec![vec![0.0, 0.0, 2.0, 2.0, 2.0, 0.0]],
                polled: Arc::clone(&polled),
            },
        )
        .unwrap();

    let graph = pipeline.graph_mut();
    graph.add_node("avg", MovingAverageFilter::new(2)).unwrap();
    graph.add_node("slice", ThresholdFilter::new(0.5, 0.0)).unwrap();
    graph.add_node("raw_slice", ThresholdFilter::new(0.5, 0.0)).unwrap();
    graph.connect("scope", "ch1", "avg", "din").unwrap();
    graph.connect("avg", "avg", "slice", "din").unwrap();
    graph.connect("scope", "ch1", "raw_slice", "din").unwrap();

    let cycle = pipeline.run_cycle();
    assert_eq!(cycle.acquisitions, 1);
    assert_eq!(cycle.stats.nodes_executed, 4);

    // avg = [0, 1, 2, 2, 1]; the host consumer pulled it back from the device
    assert_eq!(bools(&pipeline, "slice"), Some(vec![false, true, true, true, true]));
    assert_eq!(bools(&pipeline, "raw_slice"), Some(vec![false, false, true, true, true, false]));

    let avg = pipeline.graph().node("avg").unwrap();
    let streams = avg.streams();
    let samples = &streams[0].uniform::<f32>().unwrap().samples;
    assert_eq!(samples.residency(), Residency::Synced);
    assert_eq!(samples.transfer_stats().device_to_host, 1);
}

#[test]
fn test_sparse_protocol_stream_stays_sparse() {
    let mut graph = FilterGraph::new();
    let la = graph.add_node("la", WaveformSource::digital(&["d0"])).unwrap();
    graph.add_node("inv", InvertFilter).unwrap();
    graph.add_node("inv2", InvertFilter).unwrap();
    graph.connect("la", "d0", "inv", "din").unwrap();
    graph.connect("inv", "data", "inv2", "din").unwrap();

    let input = SparseWaveform::from_parts(1000, &[0, 10, 25], &[10, 15, 5], &[true, false, true]).unwrap();
    la.set_stream_waveform(0, Box::new(input));
    FilterGraphExecutor::new(2, Arc::new(Accelerator::default())).run_blocking(graph.nodes());

    let inv = graph.node("inv").unwrap().streams();
    let out = inv[0].sparse::<bool>().unwrap();
    assert_eq!(out.samples.as_slice(), &[false, true, false]);
    assert_eq!(out.offsets.as_slice(), &[0, 10, 25]);
    assert_eq!(out.durations.as_slice(), &[10, 15, 5]);

    let inv2 = graph.node("inv2").unwrap().streams();
    assert_eq!(inv2[0].sparse::<bool>().unwrap().samples.as_slice(), &[true, false, true]);
}

#[test]
fn test_connect_rejects_cycle_and_type_mismatch() {
    let mut graph = FilterGraph::new();
    graph.add_node("scope", WaveformSource::analog(&["ch1"])).unwrap();
    graph.add_node("a", SubtractFilter).unwrap();
    graph.add_node("b", SubtractFilter).unwrap();
    graph.add_node("inv", InvertFilter).unwrap();

    graph.connect("scope", "ch1", "a", "a").unwrap();
    graph.connect("a", "diff", "b", "a").unwrap();
    assert!(matches!(
        graph.connect("b", "diff", "a", "b"),
        Err(ConnectionError::Cycle { .. })
    ));
    assert!(matches!(
        graph.connect("scope", "ch1", "inv", "din"),
        Err(ConnectionError::TypeMismatch { .. })
    ));
    assert!(matches!(
        graph.connect("scope", "nope", "inv", "din"),
        Err(ConnectionError::PortNotFound { .. })
    ));
}

#[test]
fn test_removed_node_leaves_dependents_without_data() {
    let mut graph = FilterGraph::new();
    let scope = graph.add_node("scope", WaveformSource::analog(&["ch1"])).unwrap();
    graph.add_node("thresh", ThresholdFilter::new(0.0, 0.0)).unwrap();
    graph.connect("scope", "ch1", "thresh", "din").unwrap();
    scope.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(1, &[1.0f32])));

    let executor = FilterGraphExecutor::new(2, Arc::new(Accelerator::default()));
    executor.run_blocking(graph.nodes());
    assert!(graph.node("thresh").unwrap().streams()[0].has_data());

    graph.remove_node("scope").unwrap();
    executor.run_blocking(graph.nodes());
    let thresh = graph.node("thresh").unwrap();
    assert!(!thresh.streams()[0].has_data());
    assert_eq!(thresh.last_error().as_deref(), Some("Input 'din' is not connected"));
}

#[test]
fn test_pipeline_from_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "worker_threads = 2\n\n[device]\nname = \"gpu0\"\nmemory_bytes = 65536\n\n[watchdog]\nenabled = false\n\n[acquisition]\nqueue_depth = 1"
    )
    .unwrap();
    let config = EngineConfig::load(file.path()).unwrap();

    let polled = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::from_config(&config);
    assert_eq!(pipeline.executor().thread_count(), 2);
    assert_eq!(pipeline.executor().accelerator().device().name(), "gpu0");

    pipeline
        .add_instrument(
            "scope",
            Replay {
                captures: vec![vec![1.0, -1.0], vec![-1.0, 1.0]],
                polled: Arc::clone(&polled),
            },
        )
        .unwrap();
    pipeline.graph_mut().add_node("thresh", ThresholdFilter::new(0.0, 0.0)).unwrap();
    pipeline.graph_mut().connect("scope", "ch1", "thresh", "din").unwrap();

    pipeline.spawn_acquisition().unwrap();
    let mut delivered = 0;
    for _ in 0..50 {
        if delivered == 2 {
            break;
        }
        if pipeline.wait_for_acquisition(Duration::from_millis(100)) {
            delivered += pipeline.run_cycle().acquisitions;
        }
    }
    pipeline.stop_acquisition();

    // Captures are published in order, so the newest one wins
    assert_eq!(delivered, 2);
    assert_eq!(bools(&pipeline, "thresh"), Some(vec![false, true]));
    assert!(polled.load(Ordering::SeqCst) >= 2);
}

#[test]
fn test_executor_cycles_accumulate_revisions() {
    let mut graph = FilterGraph::new();
    let la = graph.add_node("la", WaveformSource::digital(&["d0"])).unwrap();
    graph.add_node("inv", InvertFilter).unwrap();
    graph.connect("la", "d0", "inv", "din").unwrap();
    la.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(1, &[true, false])));

    let executor = FilterGraphExecutor::new(2, Arc::new(Accelerator::default()));
    let mut revisions = Vec::new();
    for _ in 0..3 {
        executor.run_blocking(graph.nodes());
        let inv = graph.node("inv").unwrap().streams();
        revisions.push(inv[0].waveform().map(|w| w.base().revision()).unwrap());
    }
    assert!(revisions.windows(2).all(|pair| pair[1] > pair[0]));
    assert_eq!(executor.cycles(), 3);
    assert_eq!(graph.node("inv").unwrap().refresh_count(), 3);
}

#[test]
fn test_scope_channel_feeding_several_filters() {
    let mut graph = FilterGraph::new();
    let scope = graph.add_node("scope", WaveformSource::analog(&["ch1", "ch2"])).unwrap();
    graph.add_node("smooth", MovingAverageFilter::new(2)).unwrap();
    graph.add_node("slice", ThresholdFilter::new(1.0, 0.2)).unwrap();
    graph.add_node("raw_slice", ThresholdFilter::new(1.0, 0.0)).unwrap();
    graph.add_node("skew", SubtractFilter).unwrap();
    graph.add_node("slice_n", InvertFilter).unwrap();
    graph.connect("scope", "ch1", "smooth", "din").unwrap();
    graph.connect("smooth", "avg", "slice", "din").unwrap();
    graph.connect("scope", "ch1", "raw_slice", "din").unwrap();
    graph.connect("scope", "ch1", "skew", "a").unwrap();
    graph.connect("scope", "ch2", "skew", "b").unwrap();
    graph.connect("raw_slice", "data", "slice_n", "din").unwrap();

    scope.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(10, &[0.0f32, 2.0, 2.0, 0.0])));
    scope.set_stream_waveform(1, Box::new(UniformWaveform::from_samples(10, &[1.0f32, 1.0, 1.0, 1.0])));

    let nodes = graph.nodes().to_vec();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let runner = std::thread::spawn(move || {
        let executor = FilterGraphExecutor::new(4, Arc::new(Accelerator::default()));
        for _ in 0..500 {
            executor.run_blocking(&nodes);
        }
        let _ = done_tx.send(executor.cycles());
    });
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(60)), Ok(500));
    runner.join().unwrap();

    let skew = graph.node("skew").unwrap().streams();
    assert_eq!(skew[0].uniform::<f32>().unwrap().samples.as_slice(), &[-1.0, 1.0, 1.0, -1.0]);
    drop(skew);
    let slice_n = graph.node("slice_n").unwrap().streams();
    assert_eq!(slice_n[0].uniform::<bool>().unwrap().samples.as_slice(), &[true, false, false, true]);
}
