//! Messaging and channel adapter configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::adapter::{DEFAULT_EXCHANGE, DEFAULT_ROUTING_PREFIX};

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagingType {
    /// In-process messaging (no external broker).
    #[default]
    InProcess,
    /// AMQP/RabbitMQ messaging.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpSettings,
    /// In-process adapter configuration.
    pub in_process: InProcessSettings,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL.
    pub url: String,
    /// Direct exchange shared by all subjects.
    pub exchange: String,
    /// Namespace prepended to routing keys.
    pub routing_prefix: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// Publish attempts after the first failure.
    pub publish_retries: usize,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_prefix: DEFAULT_ROUTING_PREFIX.to_string(),
            pool_size: 10,
            publish_retries: 5,
        }
    }
}

/// In-process adapter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InProcessSettings {
    /// Namespace prepended to routing keys.
    pub routing_prefix: String,
    /// Pause before a requeued delivery is retried, in milliseconds.
    pub redelivery_delay_ms: u64,
}

impl InProcessSettings {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

impl Default for InProcessSettings {
    fn default() -> Self {
        Self {
            routing_prefix: DEFAULT_ROUTING_PREFIX.to_string(),
            redelivery_delay_ms: 50,
        }
    }
}

/// Request/reply configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Default time to wait for a reply, in milliseconds.
    pub timeout_ms: u64,
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}
