use crate::network::transport::TransportError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Classified link failure, the vocabulary shared by the retry queue and
/// the recovery coordinator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Endpoint session not activated")]
    SessionNotActivated,

    #[error("Companion device not paired")]
    EndpointNotPaired,

    #[error("Companion app not installed")]
    CompanionAppNotInstalled,

    #[error("Companion device not reachable")]
    EndpointNotReachable,

    #[error("Message reply timed out")]
    MessageTimeout,

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Unclassified link error: {0}")]
    Unknown(String),
}

/// Coarse severity used to decide between surfacing and retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Needs user action (pairing, install) or a session restart
    Fatal,
    /// Worth retrying locally
    Transient,
    Unclassified,
}

/// How the recovery coordinator reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Immediate,
    Backoff,
    ConnectivityWait,
    Conservative,
}

impl LinkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LinkError::SessionNotActivated
            | LinkError::EndpointNotPaired
            | LinkError::CompanionAppNotInstalled => ErrorClass::Fatal,
            LinkError::EndpointNotReachable
            | LinkError::MessageTimeout
            | LinkError::TransferFailed(_) => ErrorClass::Transient,
            LinkError::Unknown(_) => ErrorClass::Unclassified,
        }
    }

    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            LinkError::SessionNotActivated
            | LinkError::EndpointNotPaired
            | LinkError::CompanionAppNotInstalled => RecoveryStrategy::Immediate,
            LinkError::MessageTimeout | LinkError::TransferFailed(_) => RecoveryStrategy::Backoff,
            LinkError::EndpointNotReachable => RecoveryStrategy::ConnectivityWait,
            LinkError::Unknown(_) => RecoveryStrategy::Conservative,
        }
    }

    /// Short hint for the host UI
    pub fn recovery_action(&self) -> &'static str {
        match self {
            LinkError::SessionNotActivated => "Restart app",
            LinkError::EndpointNotPaired => "Pair companion device",
            LinkError::CompanionAppNotInstalled => "Install companion app",
            LinkError::EndpointNotReachable => "Check companion connection",
            LinkError::MessageTimeout | LinkError::TransferFailed(_) => "Retry",
            LinkError::Unknown(_) => "Try again",
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl From<&TransportError> for LinkError {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::SessionNotActivated => LinkError::SessionNotActivated,
            TransportError::NotPaired => LinkError::EndpointNotPaired,
            TransportError::AppNotInstalled => LinkError::CompanionAppNotInstalled,
            TransportError::NotReachable => LinkError::EndpointNotReachable,
            TransportError::ReplyTimedOut { .. } => LinkError::MessageTimeout,
            TransportError::TransferFailed(reason) => LinkError::TransferFailed(reason.clone()),
            TransportError::Other(reason) => LinkError::Unknown(reason.clone()),
        }
    }
}

impl From<TransportError> for LinkError {
    fn from(error: TransportError) -> Self {
        LinkError::from(&error)
    }
}

/// Acknowledged delivery of a queued message
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: Uuid,
    /// Total attempts made, including the successful one
    pub attempts: u32,
    pub latency: Duration,
    pub reply: crate::messages::Payload,
}

/// Why a queued message was not delivered
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Delivery failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: LinkError },

    #[error("Link misconfigured: {0}")]
    Fatal(LinkError),

    #[error("Delivery aborted on unclassified error: {0}")]
    Unclassified(LinkError),

    #[error("Message dropped from backlog: {reason}")]
    Dropped { reason: String },

    #[error("Retry queue is shut down")]
    QueueClosed,
}

impl DeliveryError {
    /// Whether retrying later, without user action, can succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DeliveryError::Fatal(_))
    }

    /// The classified link error behind this failure, if any
    pub fn link_error(&self) -> Option<&LinkError> {
        match self {
            DeliveryError::RetriesExhausted { last_error, .. } => Some(last_error),
            DeliveryError::Fatal(e) | DeliveryError::Unclassified(e) => Some(e),
            DeliveryError::Dropped { .. } | DeliveryError::QueueClosed => None,
        }
    }
}
