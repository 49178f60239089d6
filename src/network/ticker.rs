//! Restartable periodic tasks.
//!
//! Each task owns at most one running loop. Starting an already running task
//! is a no-op and stopping a stopped one is harmless.

use crate::network::lock;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spawn the loop unless it is already running. Returns whether a loop was spawned.
    ///
    /// The first tick fires immediately. Ticks missed while `tick` was busy
    /// are skipped rather than replayed.
    pub fn start<F, Fut>(&self, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = lock(&self.running);
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                trace!(task = self.name, "Periodic task already running");
                return false;
            }
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let period = self.period;
        let name = self.name;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tick() => {}
                }
            }
            debug!(task = name, "Periodic task stopped");
        });

        debug!(task = self.name, period_ms = period.as_millis() as u64, "Periodic task started");
        *running = Some(Running { token, handle });
        true
    }

    /// Cancel the loop. Returns whether a loop was running.
    pub fn stop(&self) -> bool {
        match lock(&self.running).take() {
            Some(current) => {
                current.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .map(|current| !current.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(current) = lock(&self.running).take() {
            current.token.cancel();
        }
    }
}
