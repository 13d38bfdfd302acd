//! Filter-graph executor
//!
//! Runs every node of a caller-supplied node set once per cycle, never starting
//! a node before the nodes feeding its inputs have finished, on a fixed pool
//! of worker threads.
//!
//! ## Cycle state
//!
//! Three sets partition the working set, all behind one mutex:
//!
//! - `incomplete`: not yet finished this cycle
//! - `runnable`: incomplete, and nothing it reads from is still incomplete
//! - `running`: claimed by a worker
//!
//! After every completion the remaining incomplete nodes are rescanned and
//! newly satisfied ones move to `runnable`. Nodes outside the set count as
//! finished. Refresh always runs with the mutex released, so a node blocked in
//! a device submission never holds up the other workers.
//!
//! Worker threads are spawned once and park on a condition variable between
//! cycles; dropping the executor sets `terminating` and joins them.

use super::device::Accelerator;
use super::graph::NodeId;
use super::node::NodeHandle;
use super::watchdog::{Watchdog, WatchdogHandle};
use crate::config::EngineConfig;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Default worker pool size
pub const DEFAULT_WORKER_THREADS: usize = 8;

/// Summary of one `run_blocking` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleStats {
    /// 1-based cycle number on this executor
    pub cycle: u64,
    pub nodes_executed: usize,
    /// Refreshes that panicked and were recovered
    pub panicked: usize,
    /// Times a dependency cycle had to be broken to make progress
    pub stalls_broken: usize,
    pub elapsed: Duration,
}

#[derive(Default)]
struct ExecState {
    incomplete: HashMap<NodeId, NodeHandle>,
    dependencies: HashMap<NodeId, Vec<NodeId>>,
    runnable: BTreeMap<NodeId, NodeHandle>,
    running: HashSet<NodeId>,
    terminating: bool,
    cycle: u64,
    executed: usize,
    panicked: usize,
    stalls_broken: usize,
}

impl ExecState {
    /// Move one runnable node to `running`
    fn next_runnable_node(&mut self) -> Option<NodeHandle> {
        let (id, node) = self.runnable.pop_first()?;
        self.running.insert(id);
        Some(node)
    }

    fn finish(&mut self, id: NodeId) {
        self.running.remove(&id);
        if self.incomplete.remove(&id).is_some() {
            self.executed += 1;
        }
    }

    /// Rescan incomplete nodes and queue every one whose inputs are all finished
    fn update_runnable(&mut self) {
        let ready: Vec<NodeId> = self
            .incomplete
            .keys()
            .filter(|id| !self.running.contains(id) && !self.runnable.contains_key(id))
            .filter(|id| {
                self.dependencies
                    .get(id)
                    .is_none_or(|deps| deps.iter().all(|dep| !self.incomplete.contains_key(dep)))
            })
            .copied()
            .collect();

        for id in ready {
            if let Some(node) = self.incomplete.get(&id) {
                trace!("[{}] Runnable", node.name());
                self.runnable.insert(id, Arc::clone(node));
            }
        }

        // Nothing running, nothing runnable, work left: the set has a cycle.
        if self.runnable.is_empty() && self.running.is_empty() {
            let stalled = self.incomplete.iter().min_by_key(|(id, _)| **id);
            if let Some((&id, node)) = stalled {
                warn!(
                    "[{}] Dependency cycle among {} incomplete nodes, releasing {:?}",
                    node.name(),
                    self.incomplete.len(),
                    id
                );
                self.stalls_broken += 1;
                self.runnable.insert(id, Arc::clone(node));
            }
        }
    }
}

struct Shared {
    state: Mutex<ExecState>,
    worker_wake: Condvar,
    completion: Condvar,
    accelerator: Arc<Accelerator>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ExecState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `node` as finished and wake whoever can make progress
    fn complete(&self, node: &NodeHandle) {
        let mut state = self.lock();
        state.finish(node.id());
        if state.incomplete.is_empty() {
            self.completion.notify_all();
        } else {
            state.update_runnable();
            self.worker_wake.notify_all();
        }
    }
}

/// Multi-threaded executor for filter graphs
pub struct FilterGraphExecutor {
    shared: Arc<Shared>,
    workers: Vec<(String, JoinHandle<()>)>,
    run_lock: Mutex<()>,
    watchdog: Option<(Watchdog, JoinHandle<()>)>,
}

impl FilterGraphExecutor {
    /// Create an executor with `threads` workers (at least one) and no watchdog
    pub fn new(threads: usize, accelerator: Arc<Accelerator>) -> Self {
        Self::build(threads, accelerator, None)
    }

    /// Create an executor with refresh monitoring
    pub fn with_watchdog(threads: usize, accelerator: Arc<Accelerator>, watchdog: Watchdog) -> Self {
        Self::build(threads, accelerator, Some(watchdog))
    }

    /// Create the accelerator and executor described by `config`
    pub fn from_config(config: &EngineConfig) -> Self {
        let accelerator = Arc::new(Accelerator::from_config(&config.device));
        if config.watchdog.enabled {
            Self::with_watchdog(
                config.worker_threads,
                accelerator,
                Watchdog::from_config(&config.watchdog),
            )
        } else {
            Self::new(config.worker_threads, accelerator)
        }
    }

    fn build(threads: usize, accelerator: Arc<Accelerator>, watchdog: Option<Watchdog>) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(ExecState::default()),
            worker_wake: Condvar::new(),
            completion: Condvar::new(),
            accelerator,
        });

        let workers = (0..threads)
            .map(|i| {
                let name = format!("worker-{}", i);
                let shared = Arc::clone(&shared);
                let handle = watchdog.as_ref().map(|w| w.register_worker(&name));
                let thread_name = name.clone();
                let join = thread::spawn(move || Self::worker_loop(&shared, handle, &thread_name));
                (name, join)
            })
            .collect();

        let watchdog = watchdog.map(|w| {
            info!(
                "Watchdog enabled - will report refreshes running >{:?}",
                w.threshold()
            );
            let thread = w.start_monitoring_thread();
            (w, thread)
        });

        info!("Executor started with {} worker threads", threads);
        Self {
            shared,
            workers,
            run_lock: Mutex::new(()),
            watchdog,
        }
    }

    pub fn accelerator(&self) -> &Arc<Accelerator> {
        &self.shared.accelerator
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Cycles started so far
    pub fn cycles(&self) -> u64 {
        self.shared.lock().cycle
    }

    /// Refresh every node in `nodes` once, in dependency order, and block
    /// until all of them have finished.
    ///
    /// Overlapping calls from several threads run one after the other.
    pub fn run_blocking(&self, nodes: &[NodeHandle]) -> CycleStats {
        let _run = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();

        let incomplete: HashMap<NodeId, NodeHandle> =
            nodes.iter().map(|n| (n.id(), Arc::clone(n))).collect();
        // Edges to nodes outside the set never block
        let dependencies: HashMap<NodeId, Vec<NodeId>> = incomplete
            .iter()
            .map(|(&id, node)| {
                let deps = node
                    .upstream_ids()
                    .into_iter()
                    .filter(|dep| incomplete.contains_key(dep))
                    .collect();
                (id, deps)
            })
            .collect();

        let mut state = self.shared.lock();
        state.cycle += 1;
        let cycle = state.cycle;
        state.incomplete = incomplete;
        state.dependencies = dependencies;
        state.runnable.clear();
        state.running.clear();
        state.executed = 0;
        state.panicked = 0;
        state.stalls_broken = 0;

        debug!("Cycle {}: {} nodes", cycle, state.incomplete.len());

        if !state.incomplete.is_empty() {
            state.update_runnable();
            self.shared.worker_wake.notify_all();
            while !state.incomplete.is_empty() {
                state = self
                    .shared
                    .completion
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        let stats = CycleStats {
            cycle,
            nodes_executed: state.executed,
            panicked: state.panicked,
            stalls_broken: state.stalls_broken,
            elapsed: start.elapsed(),
        };
        state.dependencies.clear();
        drop(state);

        debug!(
            "Cycle {} done: {} nodes in {:?}",
            cycle, stats.nodes_executed, stats.elapsed
        );
        stats
    }

    /// Claim a runnable node of the current cycle, moving it to `running`.
    ///
    /// Returns `None` when nothing is runnable. A node claimed here must be
    /// handed back through [`finish_node`](Self::finish_node) or the cycle
    /// never completes.
    pub fn next_runnable_node(&self) -> Option<NodeHandle> {
        self.shared.lock().next_runnable_node()
    }

    /// Mark a node claimed with [`next_runnable_node`](Self::next_runnable_node) as finished
    pub fn finish_node(&self, node: &NodeHandle) {
        self.shared.complete(node);
    }

    fn worker_loop(shared: &Shared, watchdog: Option<WatchdogHandle>, name: &str) {
        debug!("[{}] Worker started", name);
        let mut state = shared.lock();
        loop {
            if state.terminating {
                break;
            }
            let Some(node) = state.next_runnable_node() else {
                state = shared
                    .worker_wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            drop(state);

            trace!("[{}] Refreshing [{}]", name, node.name());
            let outcome = {
                let _guard = watchdog.as_ref().map(|w| w.track(node.name()));
                panic::catch_unwind(AssertUnwindSafe(|| node.refresh(&shared.accelerator)))
            };

            if let Err(payload) = outcome {
                let message = format!("Refresh panicked: {}", panic_message(payload.as_ref()));
                error!("[{}] {}", node.name(), message);
                node.recover_after_panic(message);
                shared.lock().panicked += 1;
            }

            shared.complete(&node);
            state = shared.lock();
        }
        debug!("[{}] Worker exiting", name);
    }
}

impl Drop for FilterGraphExecutor {
    fn drop(&mut self) {
        self.shared.lock().terminating = true;
        self.shared.worker_wake.notify_all();

        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("[{}] Worker thread panicked", name);
            }
        }

        if let Some((watchdog, thread)) = self.watchdog.take() {
            watchdog.stop();
            thread.thread().unpark();
            if thread.join().is_err() {
                error!("[watchdog] Monitor thread panicked");
            }
        }
        info!("Executor stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{InvertFilter, MovingAverageFilter, ThresholdFilter, WaveformSource};
    use crate::runtime::device::{MemoryPressureLevel, MemoryType};
    use crate::runtime::node::{Filter, FlowGraphNode, RefreshContext};
    use crate::runtime::scratch::ScratchPurpose;
    use crate::runtime::stream::{Stream, StreamDescriptor, StreamType};
    use crate::runtime::units::Unit;
    use crate::runtime::waveform::{UniformWaveform, Waveform};
    use proptest::prelude::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Start/end sequence numbers of one refresh
    #[derive(Debug, Clone, Copy)]
    struct Span {
        start: u64,
        end: u64,
    }

    #[derive(Default)]
    struct Recorder {
        seq: AtomicU64,
        spans: Mutex<HashMap<NodeId, Vec<Span>>>,
    }

    /// Records when it runs; accepts any input
    struct Timed {
        inputs: usize,
        recorder: Arc<Recorder>,
        max_delay_us: u64,
    }

    impl Timed {
        fn node(name: &str, inputs: usize, recorder: &Arc<Recorder>) -> NodeHandle {
            FlowGraphNode::new(
                name,
                Timed {
                    inputs,
                    recorder: Arc::clone(recorder),
                    max_delay_us: 0,
                },
            )
        }
    }

    impl Filter for Timed {
        fn protocol_name(&self) -> &str {
            "Timed"
        }

        fn input_names(&self) -> Vec<String> {
            (0..self.inputs).map(|i| format!("in{}", i)).collect()
        }

        fn create_streams(&self) -> Vec<Stream> {
            vec![Stream::new("out", Unit::Volts, StreamType::Analog)]
        }

        fn validate_channel(&self, _index: usize, _stream: &StreamDescriptor) -> bool {
            true
        }

        fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
            let start = self.recorder.seq.fetch_add(1, Ordering::SeqCst);
            if self.max_delay_us > 0 {
                let delay = rand::thread_rng().gen_range(0..self.max_delay_us);
                thread::sleep(Duration::from_micros(delay));
            }
            let end = self.recorder.seq.fetch_add(1, Ordering::SeqCst);
            self.recorder
                .spans
                .lock()
                .unwrap()
                .entry(ctx.node_id())
                .or_default()
                .push(Span { start, end });
        }
    }

    fn executor(threads: usize) -> FilterGraphExecutor {
        FilterGraphExecutor::new(threads, Arc::new(Accelerator::new("test", 1 << 20)))
    }

    fn connect(to: &NodeHandle, input: usize, from: &NodeHandle) {
        to.set_input(input, from.stream(0)).unwrap();
    }

    #[test]
    fn test_every_node_refreshed_once() {
        let recorder = Arc::new(Recorder::default());
        let a = Timed::node("a", 0, &recorder);
        let b = Timed::node("b", 1, &recorder);
        let c = Timed::node("c", 2, &recorder);
        connect(&b, 0, &a);
        connect(&c, 0, &a);
        connect(&c, 1, &b);

        let exec = executor(4);
        let nodes = vec![Arc::clone(&c), Arc::clone(&a), Arc::clone(&b)];
        let stats = exec.run_blocking(&nodes);

        assert_eq!(stats.cycle, 1);
        assert_eq!(stats.nodes_executed, 3);
        assert_eq!(stats.stalls_broken, 0);
        for node in &nodes {
            assert_eq!(node.refresh_count(), 1);
        }

        let spans = recorder.spans.lock().unwrap();
        assert!(spans[&a.id()][0].end < spans[&b.id()][0].start);
        assert!(spans[&b.id()][0].end < spans[&c.id()][0].start);
    }

    #[test]
    fn test_empty_node_set() {
        let exec = executor(2);
        let stats = exec.run_blocking(&[]);
        assert_eq!(stats.nodes_executed, 0);
        assert_eq!(exec.cycles(), 1);
    }

    #[test]
    fn test_duplicate_handles_run_once() {
        let recorder = Arc::new(Recorder::default());
        let a = Timed::node("a", 0, &recorder);
        let exec = executor(2);
        exec.run_blocking(&[Arc::clone(&a), Arc::clone(&a)]);
        assert_eq!(a.refresh_count(), 1);
    }

    #[test]
    fn test_nodes_outside_set_are_untouched() {
        let recorder = Arc::new(Recorder::default());
        let upstream = Timed::node("upstream", 0, &recorder);
        let downstream = Timed::node("downstream", 1, &recorder);
        connect(&downstream, 0, &upstream);

        let exec = executor(2);
        exec.run_blocking(&[Arc::clone(&downstream)]);
        assert_eq!(upstream.refresh_count(), 0);
        assert_eq!(downstream.refresh_count(), 1);
    }

    #[test]
    fn test_dependency_cycle_still_completes() {
        let recorder = Arc::new(Recorder::default());
        let a = Timed::node("a", 1, &recorder);
        let b = Timed::node("b", 1, &recorder);
        // The graph layer refuses this; nodes can still be wired directly
        connect(&a, 0, &b);
        connect(&b, 0, &a);

        let exec = executor(2);
        let stats = exec.run_blocking(&[Arc::clone(&a), Arc::clone(&b)]);
        assert_eq!(stats.nodes_executed, 2);
        assert_eq!(stats.stalls_broken, 1);
        assert_eq!(a.refresh_count(), 1);
        assert_eq!(b.refresh_count(), 1);
    }

    #[test]
    fn test_next_runnable_node_between_cycles() {
        let recorder = Arc::new(Recorder::default());
        let a = Timed::node("a", 0, &recorder);
        let exec = executor(1);
        assert!(exec.next_runnable_node().is_none());
        exec.run_blocking(&[a]);
        assert!(exec.next_runnable_node().is_none());
    }

    #[test]
    fn test_state_claims_and_finishes_in_order() {
        let recorder = Arc::new(Recorder::default());
        let a = Timed::node("a", 0, &recorder);
        let b = Timed::node("b", 1, &recorder);
        connect(&b, 0, &a);

        let mut state = ExecState::default();
        state.incomplete.insert(a.id(), Arc::clone(&a));
        state.incomplete.insert(b.id(), Arc::clone(&b));
        state.dependencies.insert(a.id(), vec![]);
        state.dependencies.insert(b.id(), vec![a.id()]);

        state.update_runnable();
        let first = state.next_runnable_node().unwrap();
        assert_eq!(first.id(), a.id());
        assert!(state.next_runnable_node().is_none());
        assert!(state.running.contains(&a.id()));

        state.finish(a.id());
        state.update_runnable();
        assert_eq!(state.next_runnable_node().map(|n| n.id()), Some(b.id()));
        state.finish(b.id());
        assert!(state.incomplete.is_empty());
        assert_eq!(state.executed, 2);
    }

    #[test]
    fn test_overlapping_runs_are_serialized() {
        let recorder = Arc::new(Recorder::default());
        let a = Timed::node("a", 0, &recorder);
        let b = Timed::node("b", 1, &recorder);
        connect(&b, 0, &a);
        let nodes = vec![a, b];

        let exec = Arc::new(executor(4));
        let callers: Vec<_> = (0..4)
            .map(|_| {
                let exec = Arc::clone(&exec);
                let nodes = nodes.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        assert_eq!(exec.run_blocking(&nodes).nodes_executed, 2);
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        assert_eq!(exec.cycles(), 100);
        for node in &nodes {
            assert_eq!(node.refresh_count(), 100);
        }
    }

    struct Explode;

    impl Filter for Explode {
        fn protocol_name(&self) -> &str {
            "Explode"
        }

        fn input_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn create_streams(&self) -> Vec<Stream> {
            vec![Stream::new("out", Unit::Volts, StreamType::Analog)]
        }

        fn validate_channel(&self, _index: usize, _stream: &StreamDescriptor) -> bool {
            false
        }

        fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
            ctx.set_output(0, Box::new(UniformWaveform::from_samples(1, &[1.0f32])));
            panic!("kernel fault");
        }
    }

    #[test]
    fn test_panicking_refresh_is_contained() {
        let recorder = Arc::new(Recorder::default());
        let bad = FlowGraphNode::new("bad", Explode);
        let after = Timed::node("after", 1, &recorder);
        connect(&after, 0, &bad);

        let exec = executor(2);
        let stats = exec.run_blocking(&[Arc::clone(&bad), Arc::clone(&after)]);
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.nodes_executed, 2);
        assert!(!bad.streams()[0].has_data());
        assert_eq!(
            bad.last_error().as_deref(),
            Some("Refresh panicked: kernel fault")
        );
        assert_eq!(after.refresh_count(), 1);

        // The executor keeps working
        let stats = exec.run_blocking(&[Arc::clone(&bad), Arc::clone(&after)]);
        assert_eq!(stats.cycle, 2);
        assert_eq!(after.refresh_count(), 2);
    }

    /// Stamps its output with the cycle it was computed in
    struct Stamp {
        inputs: usize,
        cycle: u64,
        max_delay_us: u64,
        seen: Arc<Mutex<Vec<(i64, i64)>>>,
    }

    impl Filter for Stamp {
        fn protocol_name(&self) -> &str {
            "Stamp"
        }

        fn input_names(&self) -> Vec<String> {
            (0..self.inputs).map(|i| format!("in{}", i)).collect()
        }

        fn create_streams(&self) -> Vec<Stream> {
            vec![Stream::new("out", Unit::Counts, StreamType::Analog)]
        }

        fn validate_channel(&self, _index: usize, _stream: &StreamDescriptor) -> bool {
            true
        }

        fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
            if self.max_delay_us > 0 {
                let delay = rand::thread_rng().gen_range(0..self.max_delay_us);
                thread::sleep(Duration::from_micros(delay));
            }

            let stamps: Vec<i64> = (0..self.inputs)
                .map(|i| {
                    ctx.input(i)
                        .and_then(|s| s.waveform().map(|w| w.base().start_timestamp))
                        .unwrap_or(-1)
                })
                .collect();

            let stamp = match stamps.first() {
                Some(&first) => first,
                None => {
                    self.cycle += 1;
                    self.cycle as i64
                }
            };
            if stamps.len() == 2 {
                self.seen.lock().unwrap().push((stamps[0], stamps[1]));
            }

            let mut out = ctx
                .take_output::<UniformWaveform<f32>>(0)
                .unwrap_or_else(|| Box::new(UniformWaveform::new(1)));
            out.base.start_timestamp = stamp;
            out.mark_modified_from_cpu();
            ctx.set_output(0, out);
        }
    }

    #[test]
    fn test_diamond_sees_same_cycle_data() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stamp = |name: &str, inputs: usize, delay: u64| {
            FlowGraphNode::new(
                name,
                Stamp {
                    inputs,
                    cycle: 0,
                    max_delay_us: delay,
                    seen: Arc::clone(&seen),
                },
            )
        };
        let root = stamp("root", 0, 50);
        let b = stamp("b", 1, 200);
        let c = stamp("c", 1, 200);
        let d = stamp("d", 2, 50);
        connect(&b, 0, &root);
        connect(&c, 0, &root);
        connect(&d, 0, &b);
        connect(&d, 1, &c);

        let exec = executor(8);
        let nodes = vec![d, c, b, root];
        for _ in 0..1000 {
            exec.run_blocking(&nodes);
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1000);
        for (cycle, &(from_b, from_c)) in seen.iter().enumerate() {
            let expected = cycle as i64 + 1;
            assert_eq!((from_b, from_c), (expected, expected));
        }
    }

    #[test]
    fn test_shared_upstream_fan_out_completes() {
        let scope = FlowGraphNode::new("scope", WaveformSource::analog(&["ch1"]));
        scope.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(10, &[-1.0f32, 0.5, 2.0, -0.3])));

        // Host and device consumers all read scope.ch1 and stage it every cycle
        let mut nodes = vec![Arc::clone(&scope)];
        for i in 0..16 {
            let thresh = FlowGraphNode::new(format!("thresh{}", i), ThresholdFilter::new(0.0, 0.0));
            let inv = FlowGraphNode::new(format!("inv{}", i), InvertFilter);
            connect(&thresh, 0, &scope);
            connect(&inv, 0, &thresh);
            nodes.push(thresh);
            nodes.push(inv);
        }
        for i in 0..4 {
            let avg = FlowGraphNode::new(format!("avg{}", i), MovingAverageFilter::new(2));
            connect(&avg, 0, &scope);
            nodes.push(avg);
        }

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let set = nodes.clone();
        let runner = thread::spawn(move || {
            let exec = executor(8);
            for _ in 0..2000 {
                exec.run_blocking(&set);
            }
            let _ = done_tx.send(exec.cycles());
        });
        let cycles = done_rx
            .recv_timeout(Duration::from_secs(60))
            .expect("executor stopped making progress");
        runner.join().unwrap();
        assert_eq!(cycles, 2000);

        for node in &nodes[1..] {
            assert_eq!(node.last_error(), None, "{}", node.name());
            assert_eq!(node.refresh_count(), 2000);
        }
        let inv = nodes[2].streams();
        assert_eq!(
            inv[0].uniform::<bool>().unwrap().samples.as_slice(),
            &[true, false, false, true]
        );
    }

    /// Holds a lent scratch buffer across a pressure notification
    struct ScratchHolder {
        report: Arc<Mutex<Option<(bool, bool, usize)>>>,
    }

    impl Filter for ScratchHolder {
        fn protocol_name(&self) -> &str {
            "ScratchHolder"
        }

        fn input_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn create_streams(&self) -> Vec<Stream> {
            vec![Stream::new("out", Unit::Volts, StreamType::Analog)]
        }

        fn validate_channel(&self, _index: usize, _stream: &StreamDescriptor) -> bool {
            false
        }

        fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
            let scratch = ctx.scratch();

            let mut idle = scratch.allocate::<f32>(ScratchPurpose::Reduction);
            idle.resize(16);
            idle.prepare_for_gpu_access().unwrap();
            scratch.free(idle, ScratchPurpose::Reduction);

            let mut lent = scratch.scoped::<f32>(ScratchPurpose::Samples);
            lent.resize(64);
            lent.as_mut_slice().fill(2.5);
            lent.mark_modified_from_cpu();
            lent.prepare_for_gpu_access().unwrap();

            let freed = ctx
                .device()
                .notify_memory_pressure(MemoryPressureLevel::Hard, MemoryType::Device, 0);
            let intact = lent
                .device_slice()
                .is_some_and(|d| d.len() == 64 && d.iter().all(|&v| v == 2.5));
            *self.report.lock().unwrap() = Some((freed, intact, ctx.device().allocated_bytes()));
        }
    }

    #[test]
    fn test_pressure_mid_cycle_spares_in_flight_buffers() {
        let report = Arc::new(Mutex::new(None));
        let node = FlowGraphNode::new(
            "holder",
            ScratchHolder {
                report: Arc::clone(&report),
            },
        );
        let exec = executor(2);
        exec.run_blocking(&[node]);

        let (freed, intact, allocated) = report.lock().unwrap().unwrap();
        assert!(freed);
        assert!(intact);
        // Only the lent buffer is still on the device
        assert_eq!(allocated, 64 * 4);
        // It went back to the pool when the refresh ended
        assert_eq!(
            exec.accelerator()
                .scratch()
                .free_count_for::<f32>(ScratchPurpose::Samples),
            1
        );
    }

    #[test]
    fn test_watchdog_executor_runs() {
        let recorder = Arc::new(Recorder::default());
        let a = Timed::node("a", 0, &recorder);
        let exec = FilterGraphExecutor::with_watchdog(
            2,
            Arc::new(Accelerator::new("test", 1 << 20)),
            Watchdog::new(Duration::from_millis(100), Duration::from_millis(10)),
        );
        exec.run_blocking(&[Arc::clone(&a)]);
        assert_eq!(a.refresh_count(), 1);
    }

    #[test]
    fn test_from_config() {
        let mut config = EngineConfig::default();
        config.worker_threads = 3;
        config.watchdog.enabled = false;
        let exec = FilterGraphExecutor::from_config(&config);
        assert_eq!(exec.thread_count(), 3);
        assert_eq!(exec.accelerator().device().name(), "accelerator");
    }

    fn random_dag() -> impl Strategy<Value = (Vec<Vec<usize>>, usize)> {
        (1usize..12)
            .prop_flat_map(|n| {
                let edges = prop::collection::vec(prop::collection::vec(any::<bool>(), n), n);
                (edges, 1usize..9)
            })
            .prop_map(|(matrix, threads)| {
                // Node i may only read from nodes j < i
                let inputs = matrix
                    .iter()
                    .enumerate()
                    .map(|(i, row)| (0..i).filter(|&j| row[j]).collect())
                    .collect();
                (inputs, threads)
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn test_random_dags_respect_dependencies((inputs, threads) in random_dag()) {
            let recorder = Arc::new(Recorder::default());
            let nodes: Vec<NodeHandle> = inputs
                .iter()
                .enumerate()
                .map(|(i, ups)| {
                    FlowGraphNode::new(
                        format!("n{}", i),
                        Timed {
                            inputs: ups.len(),
                            recorder: Arc::clone(&recorder),
                            max_delay_us: 20,
                        },
                    )
                })
                .collect();
            for (i, ups) in inputs.iter().enumerate() {
                for (slot, &j) in ups.iter().enumerate() {
                    nodes[i].set_input(slot, nodes[j].stream(0)).unwrap();
                }
            }

            let exec = executor(threads);
            // Reverse order so the set order never matches the dependency order
            let set: Vec<NodeHandle> = nodes.iter().rev().cloned().collect();
            for _ in 0..3 {
                let stats = exec.run_blocking(&set);
                prop_assert_eq!(stats.nodes_executed, nodes.len());
            }

            let spans = recorder.spans.lock().unwrap();
            for (i, ups) in inputs.iter().enumerate() {
                let mine = &spans[&nodes[i].id()];
                prop_assert_eq!(mine.len(), 3);
                for &j in ups {
                    let theirs = &spans[&nodes[j].id()];
                    for cycle in 0..3 {
                        prop_assert!(theirs[cycle].end < mine[cycle].start);
                    }
                }
            }
        }
    }
}
