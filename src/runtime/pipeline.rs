//! Acquisition pipeline: instruments feeding a filter graph
//!
//! A [`Pipeline`] owns a [`FilterGraph`], the [`FilterGraphExecutor`] that runs
//! it, and the instruments bound to the graph's root nodes. Each call to
//! [`Pipeline::run_cycle`] publishes the newest acquisitions into the root
//! nodes' streams and then runs the whole node set once.
//!
//! Instruments are polled on the calling thread by default. After
//! [`Pipeline::spawn_acquisition`] they move to a background thread that hands
//! acquisitions over a bounded channel; a full channel blocks the polling
//! thread, so acquisition never runs more than `queue_depth` captures ahead
//! of processing.

use super::errors::ConnectionError;
use super::graph::FilterGraph;
use super::node::NodeHandle;
use super::scheduler::{CycleStats, FilterGraphExecutor};
use super::stream::Stream;
use super::waveform::Waveform;
use crate::config::EngineConfig;
use crate::nodes::WaveformSource;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// How long the polling thread parks when no instrument had data
const IDLE_POLL: Duration = Duration::from_millis(1);

/// One capture from an instrument: a waveform (or nothing) per channel
#[derive(Default)]
pub struct Acquisition {
    channels: Vec<Option<Box<dyn Waveform>>>,
}

impl Acquisition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set channel `index`, growing the channel list as needed
    pub fn with_channel(mut self, index: usize, waveform: Box<dyn Waveform>) -> Self {
        self.set_channel(index, Some(waveform));
        self
    }

    /// Set or clear channel `index`. A cleared channel publishes "no data".
    pub fn set_channel(&mut self, index: usize, waveform: Option<Box<dyn Waveform>>) {
        if self.channels.len() <= index {
            self.channels.resize_with(index + 1, || None);
        }
        self.channels[index] = waveform;
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn into_channels(self) -> Vec<Option<Box<dyn Waveform>>> {
        self.channels
    }
}

/// A data source outside the graph, such as an oscilloscope or logic analyzer
pub trait Instrument: Send {
    fn name(&self) -> &str;

    /// Streams exposed by the root node bound to this instrument
    fn channel_streams(&self) -> Vec<Stream>;

    /// Newest capture, or `None` if nothing new is available
    fn acquire(&mut self) -> Option<Acquisition>;
}

/// Result of one [`Pipeline::run_cycle`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineCycle {
    /// Acquisitions published into root nodes before the node set ran
    pub acquisitions: usize,
    pub stats: CycleStats,
}

type Delivery = (usize, Acquisition);

struct AcquisitionThread {
    receiver: Receiver<Delivery>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Vec<Box<dyn Instrument>>>,
}

pub struct Pipeline {
    graph: FilterGraph,
    executor: FilterGraphExecutor,
    instruments: Vec<Box<dyn Instrument>>,
    sources: Vec<NodeHandle>,
    queue_depth: usize,
    acquisition: Option<AcquisitionThread>,
    pending: Vec<Delivery>,
}

impl Pipeline {
    pub fn new(executor: FilterGraphExecutor) -> Self {
        Self {
            graph: FilterGraph::new(),
            executor,
            instruments: Vec::new(),
            sources: Vec::new(),
            queue_depth: 4,
            acquisition: None,
            pending: Vec::new(),
        }
    }

    /// Executor, accelerator and queue depth as described by `config`
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(FilterGraphExecutor::from_config(config)).with_queue_depth(config.acquisition.queue_depth)
    }

    /// Acquisitions buffered between the polling thread and the pipeline
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn graph(&self) -> &FilterGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut FilterGraph {
        &mut self.graph
    }

    pub fn executor(&self) -> &FilterGraphExecutor {
        &self.executor
    }

    pub fn instrument_count(&self) -> usize {
        self.sources.len()
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_some()
    }

    /// Bind `instrument` to a new root node named `name`.
    ///
    /// The node's streams mirror [`Instrument::channel_streams`]. Fails if the
    /// name is taken, or while background acquisition is running.
    pub fn add_instrument<I: Instrument + 'static>(
        &mut self,
        name: impl Into<String>,
        instrument: I,
    ) -> Result<NodeHandle, ConnectionError> {
        let name = name.into();
        if self.acquisition.is_some() {
            return Err(ConnectionError::AcquisitionRunning(name));
        }
        let source = WaveformSource::from_streams(&instrument.channel_streams());
        let node = self.graph.add_node(name, source)?;
        info!(
            "[{}] Bound instrument '{}' with {} channels",
            node.name(),
            instrument.name(),
            node.stream_count()
        );
        self.instruments.push(Box::new(instrument));
        self.sources.push(Arc::clone(&node));
        Ok(node)
    }

    /// Publish new acquisitions, then run every graph node once.
    ///
    /// Acquisitions for instruments whose root node was removed from the graph
    /// are dropped and not counted.
    pub fn run_cycle(&mut self) -> PipelineCycle {
        let deliveries = self.collect_acquisitions();
        let mut acquisitions = 0;
        for (index, acquisition) in deliveries {
            if self.publishes_to_graph(index) {
                self.publish(index, acquisition);
                acquisitions += 1;
            }
        }

        let stats = self.executor.run_blocking(self.graph.nodes());
        debug!(
            "Pipeline cycle {}: {} acquisitions, {} nodes in {:?}",
            stats.cycle, acquisitions, stats.nodes_executed, stats.elapsed
        );
        PipelineCycle {
            acquisitions,
            stats,
        }
    }

    fn collect_acquisitions(&mut self) -> Vec<Delivery> {
        let mut deliveries = std::mem::take(&mut self.pending);
        match &self.acquisition {
            Some(background) => loop {
                match background.receiver.try_recv() {
                    Ok(delivery) => deliveries.push(delivery),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("Acquisition thread exited unexpectedly");
                        break;
                    }
                }
            },
            None => {
                for (index, instrument) in self.instruments.iter_mut().enumerate() {
                    if let Some(acquisition) = instrument.acquire() {
                        deliveries.push((index, acquisition));
                    }
                }
            }
        }
        deliveries
    }

    /// False once the instrument's root node has been removed from the graph
    fn publishes_to_graph(&self, index: usize) -> bool {
        match self.sources.get(index) {
            Some(node) if self.graph.contains(node) => true,
            Some(node) => {
                trace!("[{}] Not in the graph; acquisition dropped", node.name());
                false
            }
            None => {
                error!("Acquisition for unknown instrument {}", index);
                false
            }
        }
    }

    fn publish(&self, index: usize, acquisition: Acquisition) {
        let Some(node) = self.sources.get(index) else {
            return;
        };
        let mut streams = node.streams_mut();
        for (channel, waveform) in acquisition.into_channels().into_iter().enumerate() {
            let Some(stream) = streams.get_mut(channel) else {
                warn!("[{}] Acquisition has extra channel {}", node.name(), channel);
                continue;
            };
            match waveform {
                Some(waveform) => {
                    stream.set_waveform(waveform);
                }
                None => stream.clear(),
            }
        }
        trace!("[{}] Published acquisition", node.name());
    }

    /// Wait up to `timeout` for the background thread to deliver something.
    ///
    /// Returns true if an acquisition is ready for the next cycle. Without a
    /// background thread this only reports acquisitions already queued.
    pub fn wait_for_acquisition(&mut self, timeout: Duration) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        let Some(background) = &self.acquisition else {
            return false;
        };
        match background.receiver.recv_timeout(timeout) {
            Ok(delivery) => {
                self.pending.push(delivery);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Acquisition thread exited unexpectedly");
                false
            }
        }
    }

    /// Move instrument polling to a background thread
    pub fn spawn_acquisition(&mut self) -> std::io::Result<()> {
        if self.acquisition.is_some() {
            return Ok(());
        }
        let (sender, receiver) = bounded(self.queue_depth);
        let stop = Arc::new(AtomicBool::new(false));
        let instruments = std::mem::take(&mut self.instruments);

        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || acquisition_loop(instruments, sender, thread_stop))?;

        info!(
            "Acquisition thread started for {} instruments (queue depth {})",
            self.sources.len(),
            self.queue_depth
        );
        self.acquisition = Some(AcquisitionThread {
            receiver,
            stop,
            thread,
        });
        Ok(())
    }

    /// Stop the background thread and take the instruments back.
    ///
    /// Acquisitions still queued are discarded.
    pub fn stop_acquisition(&mut self) {
        let Some(background) = self.acquisition.take() else {
            return;
        };
        background.stop.store(true, Ordering::Release);
        // A poller blocked on a full queue wakes up with a send error
        drop(background.receiver);
        background.thread.thread().unpark();

        match background.thread.join() {
            Ok(instruments) => self.instruments = instruments,
            Err(_) => error!("Acquisition thread panicked; instruments are lost"),
        }
        self.pending.clear();
        info!("Acquisition thread stopped");
    }
}

fn acquisition_loop(
    mut instruments: Vec<Box<dyn Instrument>>,
    sender: Sender<Delivery>,
    stop: Arc<AtomicBool>,
) -> Vec<Box<dyn Instrument>> {
    'polling: while !stop.load(Ordering::Acquire) {
        let mut idle = true;
        for (index, instrument) in instruments.iter_mut().enumerate() {
            let Some(acquisition) = instrument.acquire() else {
                continue;
            };
            idle = false;
            if sender.send((index, acquisition)).is_err() {
                debug!("[{}] Pipeline stopped listening", instrument.name());
                break 'polling;
            }
        }
        if idle {
            thread::park_timeout(IDLE_POLL);
        }
    }
    instruments
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop_acquisition();
    }
}
