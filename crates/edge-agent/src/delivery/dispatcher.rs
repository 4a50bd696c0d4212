//! Per-destination delivery lanes with retry, queueing and redelivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use edge_protocol::{Ack, Envelope};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::{DeliveryError, TransportError};
use super::policy::RetryPolicy;
use super::transport::{Destination, Transport};
use crate::config::DeliveryConfig;
use crate::events::{AgentEvent, AttemptOutcome, EventOutlets, LocalEventKind};
use crate::liveness::PeerTracker;

pub type DeliveryResult = Result<Ack, DeliveryError>;

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub destination: String,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Retry, then queue.
    Reliable,
    /// One attempt, never queued.
    Probe,
}

struct Job {
    envelope: Envelope,
    mode: Mode,
    reply: oneshot::Sender<DeliveryResult>,
}

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
    kick: Arc<Notify>,
}

struct QueuedMessage {
    envelope: Envelope,
    attempts: u32,
}

/// A queued message that left the backlog during a drain.
struct Settled {
    message_id: String,
    result: Result<Ack, TransportError>,
}

/// Sends messages to peers. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    queue_capacity: usize,
    redelivery_interval: Duration,
    liveness: PeerTracker,
    outlets: EventOutlets,
    lanes: DashMap<String, Lane>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl DeliveryDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        queue_capacity: usize,
        redelivery_interval: Duration,
        liveness: PeerTracker,
        outlets: EventOutlets,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                policy,
                queue_capacity: queue_capacity.max(1),
                redelivery_interval: redelivery_interval.max(Duration::from_millis(1)),
                liveness,
                outlets,
                lanes: DashMap::new(),
                shutdown,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn from_config(
        config: &DeliveryConfig,
        transport: Arc<dyn Transport>,
        liveness: PeerTracker,
        outlets: EventOutlets,
        shutdown: CancellationToken,
    ) -> Self {
        Self::new(
            transport,
            RetryPolicy::from_config(config),
            config.queue_capacity,
            config.redelivery_interval(),
            liveness,
            outlets,
            shutdown,
        )
    }

    /// Hand a message to the destination's lane without waiting.
    ///
    /// The message is recorded as sent immediately; the receiver resolves once
    /// it is delivered, rejected, or queued.
    pub fn submit(&self, destination: &Destination, envelope: Envelope) -> oneshot::Receiver<DeliveryResult> {
        self.enqueue(destination, envelope, Mode::Reliable)
    }

    /// Deliver with retry; on exhaustion the message is queued and
    /// [`DeliveryError::Queued`] is returned.
    pub async fn send(&self, destination: &Destination, envelope: Envelope) -> DeliveryResult {
        self.submit(destination, envelope)
            .await
            .unwrap_or(Err(DeliveryError::ShuttingDown))
    }

    /// Deliver with a single attempt and no queueing. Used for heartbeats.
    pub async fn probe(&self, destination: &Destination, envelope: Envelope) -> DeliveryResult {
        self.enqueue(destination, envelope, Mode::Probe)
            .await
            .unwrap_or(Err(DeliveryError::ShuttingDown))
    }

    fn enqueue(
        &self,
        destination: &Destination,
        envelope: Envelope,
        mode: Mode,
    ) -> oneshot::Receiver<DeliveryResult> {
        let (reply, rx) = oneshot::channel();
        if self.inner.shutdown.is_cancelled() {
            let _ = reply.send(Err(DeliveryError::ShuttingDown));
            return rx;
        }

        self.inner.outlets.emit(AgentEvent::sent(envelope.clone()));
        let job = Job {
            envelope,
            mode,
            reply,
        };
        if let Err(mpsc::error::SendError(job)) = self.lane_sender(destination).send(job) {
            let _ = job.reply.send(Err(DeliveryError::ShuttingDown));
        }
        rx
    }

    fn lane_sender(&self, destination: &Destination) -> mpsc::UnboundedSender<Job> {
        if let Some(lane) = self.inner.lanes.get(&destination.agent_id) {
            return lane.tx.clone();
        }
        self.inner
            .lanes
            .entry(destination.agent_id.clone())
            .or_insert_with(|| self.spawn_lane(destination))
            .tx
            .clone()
    }

    fn spawn_lane(&self, destination: &Destination) -> Lane {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let kick = Arc::new(Notify::new());
        let worker = LaneWorker {
            inner: self.inner.clone(),
            destination: destination.clone(),
            rx,
            backlog: VecDeque::new(),
            depth: depth.clone(),
            kick: kick.clone(),
        };
        debug!("Starting delivery lane for {}", destination.agent_id);
        self.inner.tasks.spawn(worker.run());
        Lane { tx, depth, kick }
    }

    /// Ask a destination's lane to try its queue now.
    pub fn kick(&self, agent_id: &str) {
        if let Some(lane) = self.inner.lanes.get(agent_id) {
            lane.kick.notify_one();
        }
    }

    pub fn queue_depth(&self, agent_id: &str) -> usize {
        self.inner
            .lanes
            .get(agent_id)
            .map(|lane| lane.depth.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn queue_depths(&self) -> Vec<QueueDepth> {
        let mut depths: Vec<QueueDepth> = self
            .inner
            .lanes
            .iter()
            .map(|lane| QueueDepth {
                destination: lane.key().clone(),
                depth: lane.depth.load(Ordering::Relaxed),
            })
            .collect();
        depths.sort_by(|a, b| a.destination.cmp(&b.destination));
        depths
    }

    /// Stop all lanes. Queued messages are abandoned, in-flight retries stop.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

struct LaneWorker {
    inner: Arc<DispatcherInner>,
    destination: Destination,
    rx: mpsc::UnboundedReceiver<Job>,
    backlog: VecDeque<QueuedMessage>,
    depth: Arc<AtomicUsize>,
    kick: Arc<Notify>,
}

impl LaneWorker {
    async fn run(mut self) {
        let interval = self.inner.redelivery_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                job = self.rx.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => break,
                },
                _ = self.kick.notified() => {
                    self.drain().await;
                }
                _ = ticker.tick() => {
                    self.drain().await;
                }
            }
        }
        self.abandon();
    }

    async fn handle(&mut self, job: Job) {
        let result = match job.mode {
            Mode::Probe => self.deliver_once(&job.envelope).await,
            Mode::Reliable => self.deliver_reliably(job.envelope).await,
        };
        let _ = job.reply.send(result);
    }

    async fn deliver_once(&mut self, envelope: &Envelope) -> DeliveryResult {
        if !self.backlog.is_empty() {
            return Err(DeliveryError::Backlogged {
                destination: self.destination.agent_id.clone(),
                queue_depth: self.backlog.len(),
            });
        }
        self.attempt(envelope, 1)
            .await
            .map_err(|source| DeliveryError::Failed {
                destination: self.destination.agent_id.clone(),
                source,
            })
    }

    async fn deliver_reliably(&mut self, envelope: Envelope) -> DeliveryResult {
        // Anything already queued goes first.
        if !self.backlog.is_empty() {
            let message_id = envelope.message_id.clone();
            self.push_backlog(envelope, 0, "older messages queued");
            let settled = self.drain().await;
            return match settled.into_iter().find(|s| s.message_id == message_id) {
                Some(Settled { result: Ok(ack), .. }) => Ok(ack),
                Some(Settled {
                    result: Err(source),
                    ..
                }) => Err(DeliveryError::Rejected {
                    destination: self.destination.agent_id.clone(),
                    source,
                }),
                None => Err(DeliveryError::Queued {
                    destination: self.destination.agent_id.clone(),
                    attempts: self
                        .backlog
                        .iter()
                        .find(|q| q.envelope.message_id == message_id)
                        .map(|q| q.attempts)
                        .unwrap_or(0),
                    queue_depth: self.backlog.len(),
                    last_error: "older messages still queued".to_string(),
                }),
            };
        }

        let max_attempts = self.inner.policy.max_attempts;
        let mut last_error: Option<TransportError> = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.inner.policy.delay_for(attempt - 1);
                debug!(
                    "Retrying {} to {} in {:?}",
                    envelope.message_id, self.destination.agent_id, delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.inner.shutdown.cancelled() => return Err(DeliveryError::ShuttingDown),
                }
            }

            match self.attempt(&envelope, attempt).await {
                Ok(ack) => return Ok(ack),
                Err(source) if !source.is_retryable() => {
                    return Err(DeliveryError::Rejected {
                        destination: self.destination.agent_id.clone(),
                        source,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        let queue_depth = self.push_backlog(envelope, max_attempts, "retries exhausted");
        Err(DeliveryError::Queued {
            destination: self.destination.agent_id.clone(),
            attempts: max_attempts,
            queue_depth,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// One transport call, recorded with its outcome and latency.
    async fn attempt(&self, envelope: &Envelope, attempt: u32) -> Result<Ack, TransportError> {
        let started = Instant::now();
        let result = self.inner.transport.deliver(&self.destination, envelope).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (outcome, error) = match &result {
            Ok(_) => (AttemptOutcome::Delivered, None),
            Err(e) if e.is_retryable() => (AttemptOutcome::Failed, Some(e.to_string())),
            Err(e) => (AttemptOutcome::Rejected, Some(e.to_string())),
        };
        self.inner.outlets.record(AgentEvent::local(LocalEventKind::DeliveryAttempt {
            message_id: envelope.message_id.clone(),
            message_type: envelope.kind(),
            destination: self.destination.agent_id.clone(),
            attempt,
            outcome,
            latency_ms,
            error,
        }));

        match &result {
            Ok(_) => {
                debug!(
                    "Delivered {} {} to {} (attempt {}, {}ms)",
                    envelope.kind(),
                    envelope.message_id,
                    self.destination.agent_id,
                    attempt,
                    latency_ms
                );
                self.inner.liveness.observe(&self.destination.agent_id);
            }
            Err(e) => warn!(
                "Delivery of {} {} to {} failed (attempt {}): {}",
                envelope.kind(),
                envelope.message_id,
                self.destination.agent_id,
                attempt,
                e
            ),
        }
        result
    }

    fn push_backlog(&mut self, envelope: Envelope, attempts: u32, reason: &str) -> usize {
        if self.backlog.len() >= self.inner.queue_capacity {
            if let Some(oldest) = self.backlog.pop_front() {
                warn!(
                    "Queue for {} full, dropping oldest message {}",
                    self.destination.agent_id, oldest.envelope.message_id
                );
                self.inner.outlets.emit(AgentEvent::local(LocalEventKind::MessageDropped {
                    message_id: oldest.envelope.message_id,
                    destination: self.destination.agent_id.clone(),
                    reason: "queue_overflow".to_string(),
                }));
            }
        }

        let message_id = envelope.message_id.clone();
        self.backlog.push_back(QueuedMessage { envelope, attempts });
        let depth = self.backlog.len();
        self.depth.store(depth, Ordering::Relaxed);

        info!(
            "Queued {} for {} ({} pending): {}",
            message_id, self.destination.agent_id, depth, reason
        );
        self.inner.outlets.emit(AgentEvent::local(LocalEventKind::MessageQueued {
            message_id,
            destination: self.destination.agent_id.clone(),
            queue_depth: depth,
            reason: reason.to_string(),
        }));
        depth
    }

    /// Redeliver queued messages in order while the destination is active.
    ///
    /// Returns the messages that left the backlog.
    async fn drain(&mut self) -> Vec<Settled> {
        let mut settled = Vec::new();
        if self.backlog.is_empty() {
            return settled;
        }
        if !self.inner.liveness.is_active(&self.destination.agent_id) {
            debug!(
                "Holding {} queued message(s) for {} until it is active",
                self.backlog.len(),
                self.destination.agent_id
            );
            return settled;
        }

        info!(
            "Redelivering {} queued message(s) to {}",
            self.backlog.len(),
            self.destination.agent_id
        );
        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            let Some(front) = self.backlog.front_mut() else {
                break;
            };
            front.attempts += 1;
            let attempt = front.attempts;
            let envelope = front.envelope.clone();

            match self.attempt(&envelope, attempt).await {
                Ok(ack) => {
                    self.backlog.pop_front();
                    settled.push(Settled {
                        message_id: envelope.message_id,
                        result: Ok(ack),
                    });
                }
                Err(e) if !e.is_retryable() => {
                    self.backlog.pop_front();
                    self.inner.outlets.emit(AgentEvent::local(LocalEventKind::MessageDropped {
                        message_id: envelope.message_id.clone(),
                        destination: self.destination.agent_id.clone(),
                        reason: format!("rejected: {e}"),
                    }));
                    settled.push(Settled {
                        message_id: envelope.message_id,
                        result: Err(e),
                    });
                }
                Err(_) => break,
            }
            self.depth.store(self.backlog.len(), Ordering::Relaxed);
        }
        self.depth.store(self.backlog.len(), Ordering::Relaxed);
        settled
    }

    fn abandon(&mut self) {
        if !self.backlog.is_empty() {
            warn!(
                "Abandoning {} queued message(s) for {} at shutdown",
                self.backlog.len(),
                self.destination.agent_id
            );
        }
        self.rx.close();
        while let Ok(job) = self.rx.try_recv() {
            let _ = job.reply.send(Err(DeliveryError::ShuttingDown));
        }
    }
}
