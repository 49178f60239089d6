//! Recovery from classified link faults.
//!
//! The coordinator is an actor fed by the retry queue's fault channel. It
//! runs at most one recovery at a time; faults arriving meanwhile are
//! recorded and the most recent one is handled next if the running recovery
//! fails. Every strategy ends in a verification: a full link probe followed
//! by a `connectivity_ping` through the retry queue.

use crate::messages::{connectivity_ping, MessagePriority, OutboundMessage};
use crate::network::errors::{LinkError, RecoveryStrategy};
use crate::network::lock;
use crate::network::monitor::{ConnectionMonitor, EndpointLink};
use crate::network::retry_queue::PriorityRetryQueue;
use crate::network::transport::{ActivationState, Transport};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    /// How long to wait for a re-activated session
    pub activation_wait: Duration,
    pub activation_poll: Duration,
    pub max_backoff_attempts: u32,
    pub backoff_cap: Duration,
    /// Fallback poll while waiting for reachability notifications
    pub connectivity_poll: Duration,
    /// Pause before an unclassified error is handled like a fatal one
    pub conservative_delay: Duration,
    /// Retries granted to the verification ping
    pub ping_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            activation_wait: Duration::from_secs(3),
            activation_poll: Duration::from_millis(100),
            max_backoff_attempts: 5,
            backoff_cap: Duration::from_secs(30),
            connectivity_poll: Duration::from_secs(5),
            conservative_delay: Duration::from_secs(10),
            ping_retries: 1,
        }
    }
}

impl RecoveryConfig {
    /// Delay before backoff attempt `attempt` (1-based): `min(2^attempt s, cap)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let seconds = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(seconds).min(self.backoff_cap)
    }
}

/// Snapshot of the coordinator for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStatus {
    pub recovering: bool,
    pub last_error: Option<String>,
    pub recovery_action: Option<&'static str>,
    pub backoff_attempts: u32,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
}

#[derive(Debug, Default)]
struct RecoveryState {
    last_error: Option<LinkError>,
    /// Fatal fault currently latched on the monitor
    latched: Option<LinkError>,
    backoff_attempts: u32,
    recovering: bool,
    successes: u64,
    failures: u64,
}

pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    transport: Arc<dyn Transport>,
    monitor: Arc<ConnectionMonitor>,
    queue: Arc<PriorityRetryQueue>,
    state: Mutex<RecoveryState>,
    in_flight: tokio::sync::Mutex<()>,
    current: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryCoordinator {
    pub fn new(
        config: RecoveryConfig,
        transport: Arc<dyn Transport>,
        monitor: Arc<ConnectionMonitor>,
        queue: Arc<PriorityRetryQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            monitor,
            queue,
            state: Mutex::new(RecoveryState::default()),
            in_flight: tokio::sync::Mutex::new(()),
            current: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawn the actor consuming `faults`. Returns false if it is already running.
    pub fn start(self: &Arc<Self>, faults: mpsc::UnboundedReceiver<LinkError>) -> bool {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let coordinator = Arc::clone(self);
        *task = Some(tokio::spawn(async move { coordinator.run(faults).await }));
        debug!("Recovery coordinator started");
        true
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Record a fault; fatal faults are latched on the monitor straight away
    pub fn note_error(&self, error: &LinkError) {
        warn!(error = %error, strategy = ?error.recovery_strategy(), "Link fault reported");
        let mut state = lock(&self.state);
        state.last_error = Some(error.clone());
        if error.is_fatal() {
            state.latched = Some(error.clone());
            drop(state);
            self.monitor.enter_error(error.to_string());
        }
    }

    /// Abandon any running recovery and run an immediate one
    pub async fn force_recovery(&self) -> bool {
        info!("Forced recovery requested");
        self.reset_error_state();
        self.recover(RecoveryStrategy::Immediate).await
    }

    /// Forget the recorded fault and backoff progress and release the fault latch
    pub fn reset_error_state(&self) {
        lock(&self.current).cancel();
        {
            let mut state = lock(&self.state);
            state.last_error = None;
            state.latched = None;
            state.backoff_attempts = 0;
        }
        self.monitor.clear_error();
        self.monitor
            .apply_snapshot(EndpointLink::probe(self.transport.as_ref()));
    }

    pub fn last_error(&self) -> Option<LinkError> {
        lock(&self.state).last_error.clone()
    }

    /// The fatal fault holding the monitor in `Error`, until a recovery succeeds
    pub fn latched_error(&self) -> Option<LinkError> {
        lock(&self.state).latched.clone()
    }

    /// User-facing hint for the recorded fault
    pub fn recovery_action(&self) -> Option<&'static str> {
        lock(&self.state)
            .last_error
            .as_ref()
            .map(LinkError::recovery_action)
    }

    pub fn is_recovering(&self) -> bool {
        lock(&self.state).recovering
    }

    pub fn status(&self) -> RecoveryStatus {
        let state = lock(&self.state);
        RecoveryStatus {
            recovering: state.recovering,
            last_error: state.last_error.as_ref().map(ToString::to_string),
            recovery_action: state.last_error.as_ref().map(LinkError::recovery_action),
            backoff_attempts: state.backoff_attempts,
            successful_recoveries: state.successes,
            failed_recoveries: state.failures,
        }
    }

    async fn run(self: Arc<Self>, mut faults: mpsc::UnboundedReceiver<LinkError>) {
        loop {
            let mut current = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = faults.recv() => match received {
                    Some(error) => error,
                    None => break,
                },
            };
            self.note_error(&current);

            loop {
                let recovery = self.recover(current.recovery_strategy());
                tokio::pin!(recovery);

                let mut newer = None;
                let recovered = loop {
                    tokio::select! {
                        recovered = &mut recovery => break recovered,
                        Some(error) = faults.recv() => {
                            self.note_error(&error);
                            newer = Some(error);
                        }
                    }
                };

                match newer {
                    Some(error) if !recovered => current = error,
                    _ => break,
                }
            }
        }
        debug!("Recovery coordinator exited");
    }

    #[instrument(level = "debug", skip(self))]
    async fn recover(&self, strategy: RecoveryStrategy) -> bool {
        let _guard = self.in_flight.lock().await;
        let token = self.shutdown.child_token();
        *lock(&self.current) = token.clone();
        lock(&self.state).recovering = true;
        info!(strategy = ?strategy, "Starting link recovery");

        let recovered = tokio::select! {
            _ = token.cancelled() => {
                debug!("Recovery cancelled");
                false
            }
            recovered = self.run_strategy(strategy) => recovered,
        };

        {
            let mut state = lock(&self.state);
            state.recovering = false;
            if recovered {
                state.successes += 1;
                state.backoff_attempts = 0;
                state.last_error = None;
                state.latched = None;
            } else {
                state.failures += 1;
            }
        }

        if recovered {
            self.monitor.clear_error();
            info!("Link recovery succeeded");
        } else {
            warn!(strategy = ?strategy, "Link recovery did not restore connectivity");
        }
        recovered
    }

    async fn run_strategy(&self, strategy: RecoveryStrategy) -> bool {
        match strategy {
            RecoveryStrategy::Immediate => self.immediate().await,
            RecoveryStrategy::Backoff => {
                let attempt = {
                    let mut state = lock(&self.state);
                    if state.backoff_attempts >= self.config.max_backoff_attempts {
                        None
                    } else {
                        state.backoff_attempts += 1;
                        Some(state.backoff_attempts)
                    }
                };
                let Some(attempt) = attempt else {
                    error!(
                        max_attempts = self.config.max_backoff_attempts,
                        "Recovery attempts exhausted; waiting for a manual reset"
                    );
                    return false;
                };

                let delay = self.config.backoff_delay(attempt);
                info!(
                    attempt,
                    max_attempts = self.config.max_backoff_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Recovery retry scheduled"
                );
                tokio::time::sleep(delay).await;
                self.immediate().await
            }
            RecoveryStrategy::ConnectivityWait => {
                self.wait_for_reachability().await;
                self.immediate().await
            }
            RecoveryStrategy::Conservative => {
                tokio::time::sleep(self.config.conservative_delay).await;
                self.immediate().await
            }
        }
    }

    async fn immediate(&self) -> bool {
        let link = EndpointLink::probe(self.transport.as_ref());
        debug!(link = ?link, "Recovery probe");
        if !link.session_activated {
            self.reactivate().await;
        }
        self.verify().await
    }

    async fn reactivate(&self) -> bool {
        info!("Reactivating transport session");
        self.transport.activate();

        let deadline = Instant::now() + self.config.activation_wait;
        loop {
            if self.transport.activation_state() == ActivationState::Activated {
                info!("Session reactivated");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    waited_ms = self.config.activation_wait.as_millis() as u64,
                    "Session reactivation timed out"
                );
                return false;
            }
            tokio::time::sleep(self.config.activation_poll).await;
        }
    }

    async fn wait_for_reachability(&self) {
        info!("Waiting for the companion to become reachable");
        let mut changes = self.monitor.subscribe();
        let mut poll = tokio::time::interval(self.config.connectivity_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        poll.tick().await;

        loop {
            if self.transport.is_reachable() {
                return;
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = poll.tick() => {}
            }
        }
    }

    async fn verify(&self) -> bool {
        let link = EndpointLink::probe(self.transport.as_ref());
        self.monitor.apply_snapshot(link);

        if !link.session_activated {
            warn!("Cannot verify connectivity, session not activated");
            return false;
        }
        if !link.paired || !link.companion_app_installed {
            warn!("Cannot verify connectivity, companion not paired or app not installed");
            return false;
        }
        if !link.reachable {
            info!("Companion not currently reachable");
            return false;
        }

        let ping = OutboundMessage::new(connectivity_ping(), MessagePriority::Critical)
            .with_max_retries(self.config.ping_retries);
        match self.queue.submit_probe(ping).await {
            Ok(delivery) => {
                info!(
                    latency_ms = delivery.latency.as_millis() as u64,
                    "Connectivity ping acknowledged"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "Connectivity ping failed");
                false
            }
        }
    }
}

impl Drop for RecoveryCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
