//! In-memory transport used by the simulator and the test-suite.
//!
//! Every call to `send` is logged before its outcome is decided, so tests can
//! assert on attempts even when the attempt fails. Outcomes come from a
//! script of queued results first, then from the link flags, then from the
//! configured random loss rate.

use crate::messages::{receipt, Payload};
use crate::network::lock;
use crate::network::transport::{ActivationState, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::trace;

#[derive(Debug)]
struct SimulatedLink {
    paired: bool,
    companion_app_installed: bool,
    reachable: bool,
    activation: ActivationState,
    activation_succeeds: bool,
    latency: Duration,
    loss_rate: f64,
    scripted: VecDeque<Result<(), TransportError>>,
}

pub struct SimulatedTransport {
    link: Mutex<SimulatedLink>,
    sent: Mutex<Vec<Payload>>,
    context: Mutex<Option<Payload>>,
    activations: Mutex<u32>,
    rng: Mutex<StdRng>,
}

impl SimulatedTransport {
    /// A paired, installed, reachable and activated link with no latency
    pub fn connected() -> Self {
        Self::with_link(SimulatedLink {
            paired: true,
            companion_app_installed: true,
            reachable: true,
            activation: ActivationState::Activated,
            activation_succeeds: true,
            latency: Duration::ZERO,
            loss_rate: 0.0,
            scripted: VecDeque::new(),
        })
    }

    /// A paired link whose companion is currently out of reach
    pub fn unreachable() -> Self {
        let transport = Self::connected();
        lock(&transport.link).reachable = false;
        transport
    }

    fn with_link(link: SimulatedLink) -> Self {
        Self {
            link: Mutex::new(link),
            sent: Mutex::new(Vec::new()),
            context: Mutex::new(None),
            activations: Mutex::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(0x5eed)),
        }
    }

    /// Seed the loss generator for reproducible runs
    pub fn with_seed(self, seed: u64) -> Self {
        *lock(&self.rng) = StdRng::seed_from_u64(seed);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.link).latency = latency;
    }

    pub fn set_loss_rate(&self, loss_rate: f64) {
        lock(&self.link).loss_rate = loss_rate.clamp(0.0, 1.0);
    }

    /// Flip reachability and return the matching notification
    pub fn set_reachable(&self, reachable: bool) -> TransportEvent {
        lock(&self.link).reachable = reachable;
        TransportEvent::ReachabilityChanged(reachable)
    }

    pub fn set_pairing(&self, paired: bool, companion_app_installed: bool) -> TransportEvent {
        let mut link = lock(&self.link);
        link.paired = paired;
        link.companion_app_installed = companion_app_installed;
        TransportEvent::PairingChanged {
            paired,
            companion_app_installed,
        }
    }

    pub fn set_activation(&self, activation: ActivationState) -> TransportEvent {
        lock(&self.link).activation = activation;
        TransportEvent::ActivationChanged(activation)
    }

    /// Whether `activate` brings the session up
    pub fn set_activation_succeeds(&self, succeeds: bool) {
        lock(&self.link).activation_succeeds = succeeds;
    }

    /// Queue an outcome for the next send, ahead of the link flags
    pub fn push_outcome(&self, outcome: Result<(), TransportError>) {
        lock(&self.link).scripted.push_back(outcome);
    }

    /// Queue `count` identical failures
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut link = lock(&self.link);
        for _ in 0..count {
            link.scripted.push_back(Err(error.clone()));
        }
    }

    /// Every payload handed to `send`, in call order
    pub fn sent_messages(&self) -> Vec<Payload> {
        lock(&self.sent).clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }

    pub fn last_context(&self) -> Option<Payload> {
        lock(&self.context).clone()
    }

    pub fn activation_requests(&self) -> u32 {
        *lock(&self.activations)
    }

    fn decide(&self) -> (Duration, Result<(), TransportError>) {
        let mut link = lock(&self.link);
        let latency = link.latency;

        if let Some(outcome) = link.scripted.pop_front() {
            return (latency, outcome);
        }
        if !link.paired {
            return (Duration::ZERO, Err(TransportError::NotPaired));
        }
        if !link.companion_app_installed {
            return (Duration::ZERO, Err(TransportError::AppNotInstalled));
        }
        if link.activation != ActivationState::Activated {
            return (Duration::ZERO, Err(TransportError::SessionNotActivated));
        }
        if !link.reachable {
            return (Duration::ZERO, Err(TransportError::NotReachable));
        }
        if link.loss_rate > 0.0 && lock(&self.rng).gen_bool(link.loss_rate) {
            return (
                latency,
                Err(TransportError::TransferFailed("simulated loss".to_string())),
            );
        }
        (latency, Ok(()))
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn is_paired(&self) -> bool {
        lock(&self.link).paired
    }

    fn is_companion_app_installed(&self) -> bool {
        lock(&self.link).companion_app_installed
    }

    fn is_reachable(&self) -> bool {
        lock(&self.link).reachable
    }

    fn activation_state(&self) -> ActivationState {
        lock(&self.link).activation
    }

    fn activate(&self) {
        *lock(&self.activations) += 1;
        let mut link = lock(&self.link);
        if link.activation_succeeds {
            link.activation = ActivationState::Activated;
        } else {
            link.activation = ActivationState::Activating;
        }
    }

    async fn send(&self, message: Payload) -> Result<Payload, TransportError> {
        lock(&self.sent).push(message);
        let (latency, outcome) = self.decide();

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        trace!(ok = outcome.is_ok(), "Simulated send resolved");
        outcome.map(|_| receipt())
    }

    fn update_persistent_context(&self, context: Payload) -> Result<(), TransportError> {
        if !lock(&self.link).paired {
            return Err(TransportError::NotPaired);
        }
        *lock(&self.context) = Some(context);
        Ok(())
    }
}
