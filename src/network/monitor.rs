use crate::network::lock;
use crate::network::metrics::{MetricsAggregator, QualityTier};
use crate::network::transport::{ActivationState, Transport, TransportEvent};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Cadence of the monitor's periodic work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Transport probe period
    pub sample_interval: Duration,
    /// Metrics log and backlog pruning period
    pub metrics_refresh_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            metrics_refresh_interval: Duration::from_secs(10),
        }
    }
}

/// The pairing relationship to the remote endpoint as last reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EndpointLink {
    pub paired: bool,
    pub companion_app_installed: bool,
    pub reachable: bool,
    pub session_activated: bool,
}

impl EndpointLink {
    /// Read every field straight from the transport
    pub fn probe(transport: &dyn Transport) -> Self {
        Self {
            paired: transport.is_paired(),
            companion_app_installed: transport.is_companion_app_installed(),
            reachable: transport.is_reachable(),
            session_activated: transport.activation_state() == ActivationState::Activated,
        }
    }

    pub fn is_sendable(&self) -> bool {
        self.paired && self.reachable
    }

    /// Every flag a fatal fault could have been raised for is set again
    pub fn is_healthy(&self) -> bool {
        self.paired && self.companion_app_installed && self.reachable && self.session_activated
    }
}

/// Connection state derived from the link flags and the quality tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Initializing,
    Connected,
    Degraded,
    Disconnected,
    Error(String),
}

impl ConnectionState {
    pub fn description(&self) -> String {
        match self {
            ConnectionState::Initializing => "Initializing connection...".to_string(),
            ConnectionState::Connected => "Connected and optimal".to_string(),
            ConnectionState::Degraded => "Connected but degraded performance".to_string(),
            ConnectionState::Disconnected => "Disconnected".to_string(),
            ConnectionState::Error(reason) => format!("Error: {}", reason),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

/// A change of connection state produced by a recomputation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl StateTransition {
    pub fn entered_connected(&self) -> bool {
        self.to == ConnectionState::Connected && self.from != ConnectionState::Connected
    }
}

/// Derive the connection state; `fault` is a latched fatal transport failure
pub fn derive_state(
    link: &EndpointLink,
    tier: QualityTier,
    fault: Option<&str>,
) -> ConnectionState {
    if !link.paired {
        ConnectionState::Disconnected
    } else if !link.companion_app_installed {
        ConnectionState::Error("app not installed".to_string())
    } else if let Some(reason) = fault {
        ConnectionState::Error(reason.to_string())
    } else if !link.reachable {
        ConnectionState::Disconnected
    } else if tier == QualityTier::Poor {
        ConnectionState::Degraded
    } else {
        ConnectionState::Connected
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    link: EndpointLink,
    observed: bool,
    fault: Option<String>,
}

/// Owner of the endpoint link and publisher of the derived connection state
pub struct ConnectionMonitor {
    state: Mutex<MonitorState>,
    metrics: Arc<MetricsAggregator>,
    publisher: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new(metrics: Arc<MetricsAggregator>) -> Self {
        let (publisher, _) = watch::channel(ConnectionState::Initializing);
        Self {
            state: Mutex::new(MonitorState::default()),
            metrics,
            publisher,
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.publisher.borrow().clone()
    }

    pub fn link(&self) -> EndpointLink {
        lock(&self.state).link
    }

    pub fn quality_tier(&self) -> QualityTier {
        self.metrics.quality_tier()
    }

    /// Paired and reachable; admission check for both outbound paths
    pub fn is_sendable(&self) -> bool {
        lock(&self.state).link.is_sendable()
    }

    /// Receive state changes; the current value is marked as seen
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.publisher.subscribe()
    }

    /// Apply a transport notification and recompute
    pub fn on_link_event(&self, event: &TransportEvent) -> Option<StateTransition> {
        let mut state = lock(&self.state);
        match event {
            TransportEvent::ActivationChanged(activation) => {
                state.link.session_activated = *activation == ActivationState::Activated;
            }
            TransportEvent::ReachabilityChanged(reachable) => {
                state.link.reachable = *reachable;
            }
            TransportEvent::PairingChanged {
                paired,
                companion_app_installed,
            } => {
                state.link.paired = *paired;
                state.link.companion_app_installed = *companion_app_installed;
            }
        }
        debug!(event = ?event, link = ?state.link, "Link event applied");
        state.observed = true;
        self.publish(&state)
    }

    /// Replace the whole link view, typically with a fresh transport probe
    pub fn apply_snapshot(&self, link: EndpointLink) -> Option<StateTransition> {
        let mut state = lock(&self.state);
        state.link = link;
        state.observed = true;
        self.publish(&state)
    }

    /// Latch a classified fatal transport failure
    pub fn enter_error(&self, reason: impl Into<String>) -> Option<StateTransition> {
        let mut state = lock(&self.state);
        let reason = reason.into();
        warn!(reason = %reason, "Latching link fault");
        state.fault = Some(reason);
        state.observed = true;
        self.publish(&state)
    }

    /// Release the fault latch after a verified recovery
    pub fn clear_error(&self) -> Option<StateTransition> {
        let mut state = lock(&self.state);
        if state.fault.take().is_some() {
            info!("Link fault cleared by recovery");
        }
        self.publish(&state)
    }

    pub fn has_fault(&self) -> bool {
        lock(&self.state).fault.is_some()
    }

    /// A fault is still latched although the link it was raised for looks healthy
    pub fn fault_outlived(&self) -> bool {
        let state = lock(&self.state);
        state.fault.is_some() && state.link.is_healthy()
    }

    /// Recompute from the current link and quality tier
    pub fn recompute(&self) -> Option<StateTransition> {
        let state = lock(&self.state);
        self.publish(&state)
    }

    fn publish(&self, state: &MonitorState) -> Option<StateTransition> {
        if !state.observed {
            return None;
        }
        let next = derive_state(
            &state.link,
            self.metrics.quality_tier(),
            state.fault.as_deref(),
        );

        let mut previous = None;
        self.publisher.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = Some(std::mem::replace(current, next.clone()));
            true
        });

        previous.map(|from| {
            info!(from = %from, to = %next, "Connection state changed");
            StateTransition { from, to: next }
        })
    }
}
