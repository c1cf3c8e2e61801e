//! Error taxonomy for bus operations.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::types::TypeTag;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
///
/// Publish and request paths return these as values. Delivery paths hand
/// them to the subscriber's error callback wrapped in a [`DeliveryFailure`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("no registration for subject:{0}")]
    UnregisteredSubject(String),

    #[error("no types registered for subject:{0}")]
    UntypedSubject(String),

    #[error("no mapper found. mapper:{mapper} dto:{dto} domain:{domain}")]
    UnregisteredMapper {
        mapper: TypeTag,
        dto: TypeTag,
        domain: TypeTag,
    },

    #[error("type mismatch {context} expected:{expected} got:{}", display_tag(.actual))]
    TypeMismatch {
        context: String,
        expected: TypeTag,
        actual: Option<TypeTag>,
    },

    #[error("mapping failed subject:{subject} dto:{dto} domain:{domain}")]
    MappingFailed {
        subject: String,
        dto: TypeTag,
        domain: TypeTag,
    },

    #[error("request cancelled before a response arrived")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("configuration error: {0}")]
    Config(String),
}

fn display_tag(tag: &Option<TypeTag>) -> &'static str {
    tag.map(|t| t.as_str()).unwrap_or("<none>")
}

impl BusError {
    /// Shorthand for a handler fault raised from user callbacks.
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler(reason.into())
    }

    /// Whether a delivery that failed with this error should go back to the
    /// broker for redelivery.
    ///
    /// Deterministic failures (undecodable envelopes, type mismatches, missing
    /// registrations) are dropped since redelivery yields the same outcome.
    pub fn should_requeue(&self) -> bool {
        matches!(self, Self::Handler(_) | Self::Transport(_))
    }

    /// Human-readable reason string.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Context handed to an error callback when a delivery fails.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub subject: String,
    pub type_tag: Option<TypeTag>,
    pub error: BusError,
    pub event_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Raw envelope bytes as received, when available.
    pub raw: Option<Bytes>,
}

impl DeliveryFailure {
    pub fn reason(&self) -> String {
        self.error.reason()
    }
}

/// Callback invoked for delivery-time failures.
pub type ErrorCallback = Arc<dyn Fn(DeliveryFailure) + Send + Sync>;
