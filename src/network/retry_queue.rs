//! Priority retry queue for command and state messages.
//!
//! A single dispatcher task makes one delivery attempt at a time, always
//! picking the most urgent ready message (priority, then creation time).
//! Failed transient attempts are re-admitted after a priority-scaled
//! exponential backoff. Messages that cannot be sent because the link is not
//! sendable are parked in a bounded backlog until the link reconnects.
//!
//! There is no starvation protection: a steady stream of `Critical` traffic
//! keeps `Low` messages waiting indefinitely.

use crate::messages::{outbound_envelope, MessagePriority, OutboundMessage};
use crate::network::errors::{Delivery, DeliveryError, ErrorClass, LinkError};
use crate::network::lock;
use crate::network::metrics::MetricsAggregator;
use crate::network::monitor::ConnectionMonitor;
use crate::network::transport::{send_with_timeout, Transport};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_BACKLOG_CAPACITY: usize = 256;
pub const DEFAULT_BACKLOG_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);
pub const DEFAULT_ATTEMPT_TIMEOUT_FACTOR: u32 = 2;

/// Backoff, timeout and backlog limits for the retry queue
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound for a single backoff wait
    pub max_backoff: Duration,
    /// Attempt timeout as a multiple of the priority's base delay
    pub attempt_timeout_factor: u32,
    /// Messages held while the link is not sendable
    pub backlog_capacity: usize,
    /// Age after which a parked message is dropped
    pub backlog_ttl: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_backoff: DEFAULT_MAX_BACKOFF,
            attempt_timeout_factor: DEFAULT_ATTEMPT_TIMEOUT_FACTOR,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            backlog_ttl: DEFAULT_BACKLOG_TTL,
        }
    }
}

impl RetryPolicy {
    /// Defaults with a different backlog bound
    pub fn with_backlog(backlog_capacity: usize, backlog_ttl: Duration) -> Self {
        Self {
            backlog_capacity,
            backlog_ttl,
            ..Self::default()
        }
    }

    /// Wait after a failed attempt with zero-based index `attempt`: `base * 2^attempt`
    pub fn retry_delay(&self, priority: MessagePriority, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        priority
            .base_retry_delay()
            .checked_mul(factor)
            .map(|delay| delay.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }

    /// How long a single attempt may wait for its reply
    pub fn attempt_timeout(&self, priority: MessagePriority) -> Duration {
        priority.base_retry_delay() * self.attempt_timeout_factor.max(1)
    }
}

pub type DeliveryResult = Result<Delivery, DeliveryError>;

struct Pending {
    message: OutboundMessage,
    seq: u64,
    reply: oneshot::Sender<DeliveryResult>,
    report_faults: bool,
}

impl Pending {
    fn key(&self) -> ReadyKey {
        (self.message.priority(), self.message.created_at(), self.seq)
    }

    fn resolve(self, result: DeliveryResult) {
        // the caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

type ReadyKey = (MessagePriority, Instant, u64);

#[derive(Default)]
struct QueueState {
    ready: BTreeMap<ReadyKey, Pending>,
    backlog: Vec<Pending>,
    waiting: HashSet<Uuid>,
    in_flight: Option<Uuid>,
    next_seq: u64,
    delivered: u64,
    failed: u64,
    dropped: u64,
    closed: bool,
}

/// Queue occupancy and lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub backlog: usize,
    pub waiting_retry: usize,
    pub in_flight: usize,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl QueueStats {
    /// Every message the queue still owns
    pub fn depth(&self) -> usize {
        self.ready + self.backlog + self.waiting_retry + self.in_flight
    }
}

pub struct PriorityRetryQueue {
    transport: Arc<dyn Transport>,
    monitor: Arc<ConnectionMonitor>,
    metrics: Arc<MetricsAggregator>,
    policy: RetryPolicy,
    faults: Option<mpsc::UnboundedSender<LinkError>>,
    state: Mutex<QueueState>,
    wakeup: Notify,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PriorityRetryQueue {
    /// Build a queue; nothing is sent until [`PriorityRetryQueue::start`] spawns the dispatcher.
    ///
    /// `faults` receives classified transport faults for the recovery coordinator.
    pub fn new(
        transport: Arc<dyn Transport>,
        monitor: Arc<ConnectionMonitor>,
        metrics: Arc<MetricsAggregator>,
        policy: RetryPolicy,
        faults: Option<mpsc::UnboundedSender<LinkError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            monitor,
            metrics,
            policy,
            faults,
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Spawn the dispatcher if it is not already running
    pub fn start(self: &Arc<Self>) -> bool {
        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        if self.shutdown.is_cancelled() {
            warn!("Retry queue is shut down; dispatcher not started");
            return false;
        }

        let queue = Arc::clone(self);
        *dispatcher = Some(tokio::spawn(async move { queue.run_dispatcher().await }));
        debug!("Retry queue dispatcher started");
        true
    }

    /// Deliver a message; resolves `true` once acknowledged, `false` on any failure
    pub async fn enqueue(&self, message: OutboundMessage) -> bool {
        self.submit(message).await.is_ok()
    }

    /// Deliver a message and report how it ended
    #[instrument(level = "debug", skip(self, message), fields(id = %message.id(), priority = %message.priority()))]
    pub async fn submit(&self, message: OutboundMessage) -> DeliveryResult {
        let receiver = self.dispatch(message);
        receiver.await.unwrap_or(Err(DeliveryError::QueueClosed))
    }

    /// Deliver a probe whose failures are not reported as link faults
    pub(crate) async fn submit_probe(&self, message: OutboundMessage) -> DeliveryResult {
        let receiver = self.admit(message, false);
        receiver.await.unwrap_or(Err(DeliveryError::QueueClosed))
    }

    /// Admit a message without waiting; the receiver yields its outcome
    pub fn dispatch(&self, message: OutboundMessage) -> oneshot::Receiver<DeliveryResult> {
        self.admit(message, true)
    }

    fn admit(&self, message: OutboundMessage, report_faults: bool) -> oneshot::Receiver<DeliveryResult> {
        let (reply, receiver) = oneshot::channel();
        let mut state = lock(&self.state);

        let seq = state.next_seq;
        state.next_seq += 1;
        let pending = Pending {
            message,
            seq,
            reply,
            report_faults,
        };

        if state.closed {
            pending.resolve(Err(DeliveryError::QueueClosed));
            return receiver;
        }

        if self.monitor.is_sendable() {
            state.ready.insert(pending.key(), pending);
            drop(state);
            self.wakeup.notify_one();
        } else {
            debug!(id = %pending.message.id(), "Link not sendable, parking message in backlog");
            self.park(&mut state, pending);
        }
        receiver
    }

    /// Move every parked message back into the ready set, most urgent first.
    ///
    /// Returns the number of messages flushed. Expired entries are dropped.
    pub fn flush_backlog(&self) -> usize {
        let mut state = lock(&self.state);
        self.drop_expired(&mut state);
        if state.backlog.is_empty() {
            return 0;
        }

        let parked = std::mem::take(&mut state.backlog);
        let count = parked.len();
        for pending in parked {
            state.ready.insert(pending.key(), pending);
        }
        drop(state);

        info!(count, "Flushing backlog after reconnection");
        self.wakeup.notify_one();
        count
    }

    /// Drop parked messages older than the backlog TTL
    pub fn prune_expired(&self) -> usize {
        let mut state = lock(&self.state);
        self.drop_expired(&mut state)
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.state).backlog.len()
    }

    /// Whether the queue still owns a message with this id
    pub fn contains(&self, id: Uuid) -> bool {
        let state = lock(&self.state);
        state.in_flight == Some(id)
            || state.waiting.contains(&id)
            || state.backlog.iter().any(|p| p.message.id() == id)
            || state.ready.values().any(|p| p.message.id() == id)
    }

    pub fn stats(&self) -> QueueStats {
        let state = lock(&self.state);
        QueueStats {
            ready: state.ready.len(),
            backlog: state.backlog.len(),
            waiting_retry: state.waiting.len(),
            in_flight: usize::from(state.in_flight.is_some()),
            delivered: state.delivered,
            failed: state.failed,
            dropped: state.dropped,
        }
    }

    pub fn depth(&self) -> usize {
        self.stats().depth()
    }

    /// Stop dispatching and fail everything still queued
    pub fn shutdown(&self) {
        let (ready, backlog) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.ready),
                std::mem::take(&mut state.backlog),
            )
        };
        self.shutdown.cancel();

        let abandoned = ready.len() + backlog.len();
        for pending in ready.into_values().chain(backlog) {
            pending.resolve(Err(DeliveryError::QueueClosed));
        }
        info!(abandoned, "Retry queue shut down");
    }

    async fn run_dispatcher(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = lock(&self.state);
                match state.ready.pop_first() {
                    Some((_, pending)) if !self.monitor.is_sendable() => {
                        // link dropped after admission; hold it rather than burn an attempt
                        self.park(&mut state, pending);
                        continue;
                    }
                    Some((_, pending)) => {
                        state.in_flight = Some(pending.message.id());
                        Some(pending)
                    }
                    None => None,
                }
            };

            match next {
                Some(pending) => self.attempt(pending).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                    }
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
        }
        debug!("Retry queue dispatcher exited");
    }

    async fn attempt(self: &Arc<Self>, pending: Pending) {
        let message = &pending.message;
        let priority = message.priority();
        let timeout = self.policy.attempt_timeout(priority);
        debug!(
            id = %message.id(),
            priority = %priority,
            attempt = message.attempts() + 1,
            max_attempts = message.max_retries() + 1,
            "Attempting delivery"
        );

        let started = Instant::now();
        let result = send_with_timeout(
            self.transport.as_ref(),
            outbound_envelope(message),
            timeout,
        )
        .await;
        let latency = started.elapsed();

        self.metrics
            .record_outcome(latency.as_secs_f64() * 1000.0, result.is_ok());
        self.monitor.recompute();

        // hand-over from in flight to waiting happens under one lock so the
        // message never looks unowned
        let retrying = result.as_ref().is_err_and(|e| {
            LinkError::from(e).class() == ErrorClass::Transient && message.has_retries_left()
        });
        {
            let mut state = lock(&self.state);
            state.in_flight = None;
            if retrying {
                state.waiting.insert(message.id());
            }
        }

        match result {
            Ok(reply) => {
                debug!(id = %message.id(), latency_ms = latency.as_millis() as u64, "Message acknowledged");
                let delivery = Delivery {
                    id: message.id(),
                    attempts: message.attempts() + 1,
                    latency,
                    reply,
                };
                lock(&self.state).delivered += 1;
                pending.resolve(Ok(delivery));
            }
            Err(transport_error) => {
                let link_error = LinkError::from(&transport_error);
                match link_error.class() {
                    ErrorClass::Transient if message.has_retries_left() => {
                        self.schedule_retry(pending, link_error);
                    }
                    ErrorClass::Transient => {
                        error!(
                            id = %message.id(),
                            attempts = message.attempts() + 1,
                            error = %link_error,
                            "Message failed after exhausting retries"
                        );
                        let attempts = message.attempts() + 1;
                        self.fail(
                            pending,
                            link_error.clone(),
                            DeliveryError::RetriesExhausted {
                                attempts,
                                last_error: link_error,
                            },
                        );
                    }
                    ErrorClass::Fatal => {
                        warn!(id = %message.id(), error = %link_error, "Fatal link error, not retrying");
                        self.fail(pending, link_error.clone(), DeliveryError::Fatal(link_error));
                    }
                    ErrorClass::Unclassified => {
                        error!(id = %message.id(), error = %link_error, "Unclassified link error");
                        self.fail(
                            pending,
                            link_error.clone(),
                            DeliveryError::Unclassified(link_error),
                        );
                    }
                }
            }
        }
    }

    fn fail(&self, pending: Pending, cause: LinkError, outcome: DeliveryError) {
        lock(&self.state).failed += 1;
        if pending.report_faults {
            self.report(cause);
        }
        pending.resolve(Err(outcome));
    }

    fn report(&self, error: LinkError) {
        if let Some(faults) = &self.faults {
            if faults.send(error).is_err() {
                debug!("Recovery coordinator no longer listening for faults");
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, pending: Pending, cause: LinkError) {
        let delay = self
            .policy
            .retry_delay(pending.message.priority(), pending.message.attempts());
        info!(
            id = %pending.message.id(),
            delay_ms = delay.as_millis() as u64,
            next_attempt = pending.message.attempts() + 2,
            error = %cause,
            "Retrying message after backoff"
        );

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {
                    lock(&queue.state).waiting.remove(&pending.message.id());
                    pending.resolve(Err(DeliveryError::QueueClosed));
                }
                _ = tokio::time::sleep(delay) => {
                    let retry = Pending {
                        message: pending.message.next_attempt(),
                        ..pending
                    };
                    queue.readmit(retry);
                }
            }
        });
    }

    fn readmit(&self, pending: Pending) {
        let mut state = lock(&self.state);
        state.waiting.remove(&pending.message.id());
        if state.closed {
            drop(state);
            pending.resolve(Err(DeliveryError::QueueClosed));
            return;
        }
        if self.monitor.is_sendable() {
            state.ready.insert(pending.key(), pending);
            drop(state);
            self.wakeup.notify_one();
        } else {
            self.park(&mut state, pending);
        }
    }

    fn park(&self, state: &mut QueueState, pending: Pending) {
        state.backlog.push(pending);

        if state.backlog.len() > self.policy.backlog_capacity {
            // lowest priority first, oldest first among equals
            if let Some(victim) = state
                .backlog
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.message
                        .priority()
                        .cmp(&b.message.priority())
                        .then(b.message.created_at().cmp(&a.message.created_at()))
                        .then(b.seq.cmp(&a.seq))
                })
                .map(|(index, _)| index)
            {
                let evicted = state.backlog.remove(victim);
                state.dropped += 1;
                warn!(
                    id = %evicted.message.id(),
                    priority = %evicted.message.priority(),
                    capacity = self.policy.backlog_capacity,
                    "Backlog full, dropping message"
                );
                evicted.resolve(Err(DeliveryError::Dropped {
                    reason: "backlog full".to_string(),
                }));
            }
        }
    }

    fn drop_expired(&self, state: &mut QueueState) -> usize {
        let ttl = self.policy.backlog_ttl;
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.backlog)
            .into_iter()
            .partition(|p| p.message.created_at().elapsed() >= ttl);
        state.backlog = kept;

        let count = expired.len();
        state.dropped += count as u64;
        for pending in expired {
            debug!(id = %pending.message.id(), "Dropping expired backlog message");
            pending.resolve(Err(DeliveryError::Dropped {
                reason: "expired in backlog".to_string(),
            }));
        }
        if count > 0 {
            warn!(count, "Expired messages dropped from backlog");
        }
        count
    }
}

impl Drop for PriorityRetryQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
