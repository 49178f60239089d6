pub mod errors;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod recovery;
pub mod retry_queue;
pub mod simulated;
pub mod stream;
pub mod ticker;
pub mod transport;

pub use errors::{Delivery, DeliveryError, ErrorClass, LinkError, RecoveryStrategy};
pub use manager::{LinkConfig, LinkManager};
pub use metrics::{MetricsAggregator, MetricsSnapshot, MetricsWindow, QualityTier};
pub use monitor::{ConnectionMonitor, ConnectionState, EndpointLink, MonitorConfig, StateTransition};
pub use recovery::{RecoveryConfig, RecoveryCoordinator, RecoveryStatus};
pub use retry_queue::{
    DeliveryResult, PriorityRetryQueue, QueueStats, RetryPolicy, DEFAULT_BACKLOG_CAPACITY,
    DEFAULT_BACKLOG_TTL,
};
pub use simulated::SimulatedTransport;
pub use stream::{PacketRing, StreamConfig, StreamQuality, StreamStats, TelemetryStream};
pub use ticker::PeriodicTask;
pub use transport::{send_with_timeout, ActivationState, Transport, TransportError, TransportEvent};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
