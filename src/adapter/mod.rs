//! Channel adapter: broker topology and raw byte-level pub/sub.
//!
//! This module contains:
//! - `ChannelAdapter` trait: publish bytes on a subject, subscribe a handler
//! - `DeliveryHandler` trait: processes one delivery and decides its fate
//! - `Subscription`: handle owning one consumer binding
//! - Routing-key derivation shared by all implementations
//! - Implementations: in-process, AMQP (RabbitMQ)

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{MessagingConfig, MessagingType};
use crate::error::{BusError, Result};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod in_process;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannelAdapter, AmqpConfig};
pub use in_process::InProcessChannelAdapter;

/// Direct exchange shared by every subject.
pub const DEFAULT_EXCHANGE: &str = "computer.BusExchange";

/// Namespace prepended to every routing key.
pub const DEFAULT_ROUTING_PREFIX: &str = "computer.bus.subject.";

// ============================================================================
// Routing
// ============================================================================

/// Escape characters that collide with the broker's routing-key delimiter.
///
/// `%` is escaped first so that escapes introduced for `.` stay unambiguous.
pub fn sanitize_subject(subject: &str) -> String {
    subject.replace('%', "%37").replace('.', "%46")
}

/// Build the routing key for a subject.
pub fn routing_key(prefix: &str, subject: &str) -> String {
    format!("{}{}", prefix, sanitize_subject(subject))
}

// ============================================================================
// Delivery
// ============================================================================

/// Processes raw deliveries for one subscription.
///
/// The returned value decides acknowledgement: see [`Disposition`].
pub trait DeliveryHandler: Send + Sync {
    fn handle(&self, body: Bytes) -> BoxFuture<'static, Result<()>>;
}

impl<F> DeliveryHandler for F
where
    F: Fn(Bytes) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    fn handle(&self, body: Bytes) -> BoxFuture<'static, Result<()>> {
        self(body)
    }
}

/// Run `handler` on one delivery, turning a panic into a handler fault.
///
/// A panicking callback must not take the consumer loop down with it; the
/// delivery is requeued like any other handler failure.
pub(crate) async fn deliver(handler: &dyn DeliveryHandler, body: Bytes) -> Result<()> {
    match AssertUnwindSafe(async { handler.handle(body).await })
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(reason = %reason, "Delivery handler panicked");
            Err(BusError::handler(format!("handler panicked: {}", reason)))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What to tell the broker about a processed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler completed, remove the message.
    Ack,
    /// Handler faulted, leave the message for redelivery.
    Requeue,
    /// Message can never succeed, drop it.
    Reject,
}

impl Disposition {
    pub fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(e) if e.should_requeue() => Self::Requeue,
            Err(_) => Self::Reject,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

type Cleanup = Box<dyn FnOnce() + Send>;

/// Handle to one active consumer binding.
///
/// Unsubscribing detaches the consumer and releases its channel. It happens
/// at most once, either through [`Subscription::unsubscribe`] or on drop.
pub struct Subscription {
    subject: String,
    token: CancellationToken,
    cleanup: Mutex<Option<Cleanup>>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            subject: subject.into(),
            token,
            cleanup: Mutex::new(None),
        }
    }

    /// Attach a closure run synchronously on the first unsubscribe.
    pub fn with_cleanup(self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        *self.cleanup.lock().unwrap_or_else(|p| p.into_inner()) = Some(Box::new(cleanup));
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Detach the consumer. Idempotent.
    pub fn unsubscribe(&self) {
        self.token.cancel();
        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(cleanup) = cleanup {
            cleanup();
            debug!(subject = %self.subject, "Unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Byte-level publish/subscribe on named subjects.
///
/// Implementations:
/// - `InProcessChannelAdapter`: broker-free, single process
/// - `AmqpChannelAdapter`: RabbitMQ via AMQP
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Publish a body on `subject`. Publishing with no subscribers succeeds.
    async fn publish(&self, subject: &str, body: Option<Bytes>) -> Result<()>;

    /// Bind a new consumer to `subject`.
    ///
    /// Topology failures are returned as errors and no subscription exists.
    /// Each delivery is acknowledged only after `handler` returns `Ok`.
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription>;
}

// ============================================================================
// Factory
// ============================================================================

/// Build the channel adapter selected by `config`.
pub async fn init_channel_adapter(config: &MessagingConfig) -> Result<Arc<dyn ChannelAdapter>> {
    match config.messaging_type {
        MessagingType::InProcess => {
            let adapter = InProcessChannelAdapter::with_settings(
                &config.in_process.routing_prefix,
                config.in_process.redelivery_delay(),
            );
            info!(messaging_type = "in_process", "Channel adapter initialized");
            Ok(Arc::new(adapter))
        }
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let adapter = AmqpChannelAdapter::new(AmqpConfig::from(&config.amqp)).await?;
                info!(messaging_type = "amqp", "Channel adapter initialized");
                Ok(Arc::new(adapter))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::Config(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
    }
}
