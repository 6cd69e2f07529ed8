//! `Flow`: one running instance of a topology (Funnel, Fan, or One-to-one).
//!
//! A `Flow` is a single struct configured differently per mode rather than a
//! hierarchy of subclasses — the `Topology` trait supplies the one thing
//! that actually differs (how a consumed message maps to a destination
//! topic); everything else is shared code. Internally a `Flow` is a true
//! two-stage pipeline: a `domain_queue` between the source consumers and the
//! domain worker pool, and a separate `publish_queue` between the domain
//! workers and the publish worker pool. A domain worker's blocking `put`
//! into `publish_queue` is the point where back-pressure on a slow
//! publisher propagates back to ingestion, rather than a slow publish call
//! directly stealing a domain worker's concurrency slot.

pub mod fan;
pub mod funnel;
pub mod one_to_one;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapters::{ResilientPublisher, Source, SourceConsumer};
use crate::backpressure::BackPressureController;
use crate::config::{BackPressureConfig, ThreadPoolConfig};
use crate::error::{ErrorSeverity, FlowError, Result};
use crate::message::Message;
use crate::metrics::{MetricsCollector, Side};
use crate::processor::MessageProcessor;
use crate::queue::BoundedQueue;
use crate::worker_pool::{ShutdownMode, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// What a `Topology` decides for a single message: forward it to a
/// destination topic, or fail to find one. There is no "filter" outcome
/// here — intentional drops are the `MessageProcessor`'s job (returning
/// `Ok(None)`); a `Topology` either finds a destination or it doesn't, and
/// not finding one is always a routing error on the source topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Forward(String),
    RoutingFailed,
}

/// Decides, per message, which destination topic it routes to.
pub trait Topology: Send + Sync {
    fn route(&self, message: &Message) -> RouteOutcome;

    fn mode_name(&self) -> &'static str;
}

enum AckDecision {
    Ack,
    Nack,
}

/// An item waiting in `domain_queue`, still carrying the oneshot the source
/// loop is waiting on to learn whether to ack or nack the original message.
struct DomainItem {
    message: Message,
    ack_tx: oneshot::Sender<AckDecision>,
}

/// An item waiting in a publish lane's queue: the domain stage has already
/// run the processor and resolved a destination topic.
struct PublishItem {
    message: Message,
    ack_tx: oneshot::Sender<AckDecision>,
}

/// One configured upstream connection and the topics it feeds.
pub struct SourceBinding {
    pub source: Box<dyn Source>,
    pub topics: Vec<String>,
}

/// One shard of the publish stage: its own queue, back-pressure gate, and
/// worker pool. There is exactly one lane unless One-to-one ordering is
/// requested, in which case `source_topic` is hash-partitioned across
/// `max_workers` single-concurrency lanes so every message from a given
/// source topic is published, in order, by the same lane.
struct PublishLane {
    queue: Arc<BoundedQueue<PublishItem>>,
    backpressure: Arc<BackPressureController<PublishItem>>,
    pool: WorkerPool,
}

pub struct Flow {
    name: String,
    instance_id: String,
    sources: Vec<SourceBinding>,
    publisher: Arc<ResilientPublisher>,
    topology: Arc<dyn Topology>,
    processor: Arc<dyn MessageProcessor>,

    domain_queue: Arc<BoundedQueue<DomainItem>>,
    domain_backpressure: Arc<BackPressureController<DomainItem>>,
    domain_pool: WorkerPool,

    publish_lanes: Vec<Arc<PublishLane>>,

    metrics: Arc<MetricsCollector>,
    state: Arc<RwLock<FlowState>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_mode: ShutdownMode,
    shutdown_timeout: Duration,
    consumer_group: String,

    source_handles: Vec<JoinHandle<()>>,
    domain_handles: Vec<JoinHandle<()>>,
    publish_handles: Vec<JoinHandle<()>>,
}

impl Flow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        sources: Vec<SourceBinding>,
        publisher: ResilientPublisher,
        topology: Box<dyn Topology>,
        processor: Box<dyn MessageProcessor>,
        thread_pool: ThreadPoolConfig,
        back_pressure: BackPressureConfig,
        shutdown_timeout: Duration,
        ordered: bool,
    ) -> Self {
        let name = name.into();
        let metrics = Arc::new(MetricsCollector::new());
        let (shutdown_tx, _) = broadcast::channel(8);
        let max_workers = thread_pool.max_workers.max(1);
        let queue_size = thread_pool.queue_size.max(1);

        let domain_queue = Arc::new(BoundedQueue::new(queue_size));
        let domain_backpressure = Arc::new(BackPressureController::new(
            domain_queue.clone(),
            format!("{name}-domain"),
            back_pressure.clone(),
        ));
        let domain_pool = WorkerPool::new(format!("{name}-domain"), max_workers);

        // Ordering is opt-in: partition the *publish* queue by a hash of
        // source_topic into one single-concurrency lane per worker slot, so
        // every message from a given source topic is published by the same
        // lane in the order it was read. Unordered flows get one lane with
        // full concurrency.
        let lane_count = if ordered { max_workers } else { 1 };
        let workers_per_lane = if ordered { 1 } else { max_workers };
        let lane_queue_capacity = (queue_size / lane_count).max(1);

        let publish_lanes = (0..lane_count)
            .map(|i| {
                let queue = Arc::new(BoundedQueue::new(lane_queue_capacity));
                let lane_name = format!("{name}-publish-{i}");
                let backpressure = Arc::new(BackPressureController::new(
                    queue.clone(),
                    lane_name.clone(),
                    back_pressure.clone(),
                ));
                Arc::new(PublishLane {
                    queue,
                    backpressure,
                    pool: WorkerPool::new(lane_name, workers_per_lane),
                })
            })
            .collect();

        Self {
            name,
            instance_id: uuid::Uuid::new_v4().to_string(),
            sources,
            publisher: Arc::new(publisher),
            topology: Arc::from(topology),
            processor: Arc::from(processor),
            domain_queue,
            domain_backpressure,
            domain_pool,
            publish_lanes,
            metrics,
            state: Arc::new(RwLock::new(FlowState::Starting)),
            shutdown_tx,
            shutdown_mode: ShutdownMode::Drain,
            shutdown_timeout,
            consumer_group: "flowbridge".to_string(),
            source_handles: Vec::new(),
            domain_handles: Vec::new(),
            publish_handles: Vec::new(),
        }
    }

    pub fn state(&self) -> FlowState {
        *self.state.read()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Spawns the source-consumption tasks, the domain worker pool, and the
    /// publish worker pool(s).
    pub async fn start(&mut self) -> Result<()> {
        info!(flow = %self.name, mode = self.topology.mode_name(), "starting flow");
        *self.state.write() = FlowState::Starting;

        let consumer_name = format!("{}-{}", self.name, self.instance_id);
        for binding in &self.sources {
            let consumer = binding.source.subscribe(&self.consumer_group, &consumer_name).await?;
            let flow_name = self.name.clone();
            let domain_queue = self.domain_queue.clone();
            let domain_backpressure = self.domain_backpressure.clone();
            let metrics = self.metrics.clone();
            let state = self.state.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();

            let handle = tokio::spawn(run_source_loop(
                consumer,
                flow_name,
                domain_queue,
                domain_backpressure,
                metrics,
                state,
                shutdown_tx,
                shutdown_rx,
            ));
            self.source_handles.push(handle);
        }

        {
            let domain_queue = self.domain_queue.clone();
            let topology = self.topology.clone();
            let processor = self.processor.clone();
            let publish_lanes = self.publish_lanes.clone();
            let metrics = self.metrics.clone();
            let flow_name = self.name.clone();
            let state = self.state.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            let shutdown_mode = self.shutdown_mode;
            let shutdown_timeout = self.shutdown_timeout;
            let pool = self.domain_pool.clone();

            let handle = tokio::spawn(async move {
                let result = pool
                    .run(domain_queue, shutdown_rx, shutdown_mode, shutdown_timeout, move |item: DomainItem| {
                        let topology = topology.clone();
                        let processor = processor.clone();
                        let publish_lanes = publish_lanes.clone();
                        let metrics = metrics.clone();
                        let flow_name = flow_name.clone();
                        async move { handle_domain_item(item, topology, processor, publish_lanes, metrics, flow_name).await }
                    })
                    .await;

                if let Err(e) = result {
                    error!(error = %e, "domain worker pool exited with an error");
                    if e.severity() == ErrorSeverity::Fatal {
                        fail_flow(&state, &shutdown_tx, "domain worker pool failed fatally");
                    }
                }
            });
            self.domain_handles.push(handle);
        }

        for lane in &self.publish_lanes {
            let lane = lane.clone();
            let publisher = self.publisher.clone();
            let metrics = self.metrics.clone();
            let state = self.state.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            let shutdown_mode = self.shutdown_mode;
            let shutdown_timeout = self.shutdown_timeout;

            let handle = tokio::spawn(async move {
                let queue = lane.queue.clone();
                let pool = lane.pool.clone();
                let state_for_handler = state.clone();
                let shutdown_tx_for_handler = shutdown_tx.clone();

                let result = pool
                    .run(queue, shutdown_rx, shutdown_mode, shutdown_timeout, move |item: PublishItem| {
                        let publisher = publisher.clone();
                        let metrics = metrics.clone();
                        let state = state_for_handler.clone();
                        let shutdown_tx = shutdown_tx_for_handler.clone();
                        async move { handle_publish_item(item, publisher, metrics, state, shutdown_tx).await }
                    })
                    .await;

                if let Err(e) = result {
                    error!(error = %e, "publish worker pool exited with an error");
                }
            });
            self.publish_handles.push(handle);
        }

        {
            let mut state = self.state.write();
            if *state == FlowState::Starting {
                *state = FlowState::Running;
            }
        }
        Ok(())
    }

    /// Signals shutdown and waits (bounded by `shutdown_timeout`) for the
    /// source loops, then the domain pool, then the publish lanes to drain
    /// in that order, matching the spec's close-domain-then-publish
    /// sequencing. If the flow already transitioned itself to `Failed`
    /// (a fatal adapter error), that terminal state is preserved rather
    /// than being overwritten by `Stopped`.
    pub async fn stop(&mut self) -> Result<()> {
        info!(flow = %self.name, "stopping flow");
        let already_failed = self.state() == FlowState::Failed;
        if !already_failed {
            *self.state.write() = FlowState::Stopping;
        }
        let _ = self.shutdown_tx.send(());

        let source_handles = std::mem::take(&mut self.source_handles);
        let domain_handles = std::mem::take(&mut self.domain_handles);
        let publish_handles = std::mem::take(&mut self.publish_handles);
        let domain_queue = self.domain_queue.clone();
        let publish_lanes = self.publish_lanes.clone();

        let drain = async move {
            // Sources stop calling consume() once they observe the signal;
            // only once they've all exited do we close domain_queue, so no
            // in-flight delivery is dropped on the floor.
            futures::future::join_all(source_handles).await;
            domain_queue.close();
            futures::future::join_all(domain_handles).await;
            for lane in &publish_lanes {
                lane.queue.close();
            }
            futures::future::join_all(publish_handles).await;
        };

        match tokio::time::timeout(self.shutdown_timeout, drain).await {
            Ok(_) => {
                if !already_failed {
                    *self.state.write() = FlowState::Stopped;
                }
                info!(flow = %self.name, "flow stopped");
                Ok(())
            }
            Err(_) => {
                *self.state.write() = FlowState::Failed;
                Err(FlowError::ShutdownTimeout {
                    stage: self.name.clone(),
                    elapsed_ms: self.shutdown_timeout.as_millis(),
                })
            }
        }
    }
}

/// Transitions the flow to `Failed` and kicks the shutdown broadcast so
/// every stage starts its (best-effort) drain, per the fatal-error policy.
fn fail_flow(state: &RwLock<FlowState>, shutdown_tx: &broadcast::Sender<()>, reason: &str) {
    error!(reason, "fatal adapter error, transitioning flow to Failed");
    *state.write() = FlowState::Failed;
    let _ = shutdown_tx.send(());
}

fn lane_for<'a>(lanes: &'a [Arc<PublishLane>], source_topic: &str) -> &'a Arc<PublishLane> {
    if lanes.len() == 1 {
        return &lanes[0];
    }
    let mut hasher = DefaultHasher::new();
    source_topic.hash(&mut hasher);
    let idx = (hasher.finish() as usize) % lanes.len();
    &lanes[idx]
}

#[allow(clippy::too_many_arguments)]
async fn run_source_loop(
    mut consumer: Box<dyn SourceConsumer>,
    flow_name: String,
    domain_queue: Arc<BoundedQueue<DomainItem>>,
    domain_backpressure: Arc<BackPressureController<DomainItem>>,
    metrics: Arc<MetricsCollector>,
    state: Arc<RwLock<FlowState>>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let poll_timeout = Duration::from_millis(100);
    let batch_size = 32;
    let mut stopping = false;

    while !stopping {
        if shutdown_rx.try_recv().is_ok() {
            info!(flow = %flow_name, "source loop received shutdown signal");
            stopping = true;
            continue;
        }

        if domain_backpressure.poll() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!(flow = %flow_name, "source loop received shutdown signal");
                stopping = true;
            }
            messages = consumer.consume(batch_size, poll_timeout) => {
                let messages = match messages {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(flow = %flow_name, error = %e, "source consume failed");
                        if e.severity() == ErrorSeverity::Fatal {
                            fail_flow(&state, &shutdown_tx, "source reported a fatal error");
                            stopping = true;
                        }
                        continue;
                    }
                };

                if messages.is_empty() {
                    continue;
                }

                // Batch-at-a-time commit: wait for every message in this
                // batch to clear both pipeline stages (processed, routed,
                // and published, or dropped) before acking/nacking and
                // pulling the next batch.
                let mut pending = Vec::with_capacity(messages.len());
                for message in messages {
                    metrics.record_message(&message.source_topic, Side::Source, message.payload_len());

                    let ack_message = message.clone();
                    let (ack_tx, ack_rx) = oneshot::channel();
                    let item = DomainItem { message, ack_tx };

                    if domain_queue.put(item, Duration::from_secs(30)).await.is_err() {
                        stopping = true;
                        break;
                    }
                    pending.push((ack_message, ack_rx));
                }

                for (message, ack_rx) in pending {
                    match ack_rx.await {
                        Ok(AckDecision::Ack) => {
                            if let Err(e) = consumer.ack(&message).await {
                                warn!(flow = %flow_name, error = %e, "failed to ack message");
                            }
                        }
                        Ok(AckDecision::Nack) | Err(_) => {
                            if let Err(e) = consumer.nack(&message).await {
                                warn!(flow = %flow_name, error = %e, "failed to nack message");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Domain worker: runs the processor, then routes the result. A processor
/// filter (`Ok(None)`) and a routing failure are reported differently — the
/// former is an intentional drop and acked clean; the latter is a
/// source-side error per the Fan/One-to-one contracts.
async fn handle_domain_item(
    item: DomainItem,
    topology: Arc<dyn Topology>,
    processor: Arc<dyn MessageProcessor>,
    publish_lanes: Vec<Arc<PublishLane>>,
    metrics: Arc<MetricsCollector>,
    flow_name: String,
) -> Result<()> {
    let DomainItem { message, ack_tx } = item;
    let source_topic = message.source_topic.clone();

    let processed = match processor.process(message).await {
        Ok(Some(message)) => message,
        Ok(None) => {
            let _ = ack_tx.send(AckDecision::Ack);
            return Ok(());
        }
        Err(e) => {
            metrics.record_error(&source_topic, Side::Source);
            let _ = ack_tx.send(AckDecision::Nack);
            return Err(e);
        }
    };

    let destination = match topology.route(&processed) {
        RouteOutcome::Forward(topic) => topic,
        RouteOutcome::RoutingFailed => {
            metrics.record_error(&source_topic, Side::Source);
            let _ = ack_tx.send(AckDecision::Nack);
            return Ok(());
        }
    };

    let mut outgoing = processed;
    outgoing.destination_topic = Some(destination);

    let lane = lane_for(&publish_lanes, &source_topic).clone();
    if lane.backpressure.poll() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let publish_item = PublishItem { message: outgoing, ack_tx };
    if lane.queue.put(publish_item, Duration::from_secs(30)).await.is_err() {
        warn!(flow = %flow_name, "publish queue closed while enqueuing; message will be nacked");
    }
    Ok(())
}

/// Publish worker: calls the publisher and resolves the message's ack
/// decision. A `FatalError` from the publisher additionally transitions the
/// whole flow to `Failed` and kicks off shutdown.
async fn handle_publish_item(
    item: PublishItem,
    publisher: Arc<ResilientPublisher>,
    metrics: Arc<MetricsCollector>,
    state: Arc<RwLock<FlowState>>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let PublishItem { message, ack_tx } = item;
    let destination = message.destination_topic.clone().unwrap_or_else(|| message.source_topic.clone());

    match publisher.publish(&message).await {
        Ok(()) => {
            metrics.record_message(&destination, Side::Destination, message.payload_len());
            let _ = ack_tx.send(AckDecision::Ack);
            Ok(())
        }
        Err(e) => {
            metrics.record_error(&destination, Side::Destination);
            let _ = ack_tx.send(AckDecision::Nack);
            if e.severity() == ErrorSeverity::Fatal {
                fail_flow(&state, &shutdown_tx, "publisher reported a fatal error");
            }
            Err(e)
        }
    }
}
