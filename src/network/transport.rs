use crate::messages::Payload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, instrument};

/// Activation state of the underlying endpoint session
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    NotActivated,
    Activating,
    Activated,
}

impl ActivationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationState::NotActivated => "not_activated",
            ActivationState::Activating => "activating",
            ActivationState::Activated => "activated",
        }
    }
}

/// Failures reported by the transport collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Endpoint session is not activated")]
    SessionNotActivated,

    #[error("Companion device is not paired")]
    NotPaired,

    #[error("Companion app is not installed")]
    AppNotInstalled,

    #[error("Companion device is not reachable")]
    NotReachable,

    #[error("Message reply timed out after {timeout:?}")]
    ReplyTimedOut { timeout: Duration },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Inbound notifications raised by the transport collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ActivationChanged(ActivationState),
    ReachabilityChanged(bool),
    PairingChanged {
        paired: bool,
        companion_app_installed: bool,
    },
}

/// The point-to-point channel to the paired endpoint.
///
/// Probes are cheap synchronous reads of the transport's own view of the
/// link. `send` resolves exactly once with the reply or the error.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_paired(&self) -> bool;

    fn is_companion_app_installed(&self) -> bool;

    fn is_reachable(&self) -> bool;

    fn activation_state(&self) -> ActivationState;

    /// Ask the transport to (re-)activate its session; completion is observed
    /// through `activation_state`
    fn activate(&self);

    async fn send(&self, message: Payload) -> Result<Payload, TransportError>;

    /// Best-effort, coalescing push of latest-value-wins state
    fn update_persistent_context(&self, context: Payload) -> Result<(), TransportError>;
}

/// Send a message and give up after `timeout`.
///
/// An expired timer is reported as [`TransportError::ReplyTimedOut`], so callers
/// only ever see transport errors.
#[instrument(level = "debug", skip(transport, message), fields(timeout_ms = timeout.as_millis() as u64))]
pub async fn send_with_timeout(
    transport: &dyn Transport,
    message: Payload,
    timeout: Duration,
) -> Result<Payload, TransportError> {
    let start_time = Instant::now();

    match tokio::time::timeout(timeout, transport.send(message)).await {
        Ok(result) => {
            debug!("Transport send finished in {:?}", start_time.elapsed());
            result
        }
        Err(_elapsed) => {
            error!(
                timeout = ?timeout,
                elapsed = ?start_time.elapsed(),
                "Transport send timed out"
            );
            Err(TransportError::ReplyTimedOut { timeout })
        }
    }
}
