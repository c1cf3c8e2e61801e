//! In-process channel adapter.
//!
//! Mirrors the broker topology inside one process: every subscription gets
//! its own queue bound by routing key, each publish fans out to all bound
//! queues, and requeued deliveries are redelivered to the same queue.
//! Ideal for local development and testing without external dependencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    deliver, routing_key, ChannelAdapter, DeliveryHandler, Disposition, Subscription,
    DEFAULT_ROUTING_PREFIX,
};
use crate::error::{BusError, Result};

/// Default pause before a requeued message is delivered again.
const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(50);

struct QueueBinding {
    id: u64,
    sender: mpsc::UnboundedSender<Bytes>,
}

struct Broker {
    routing_prefix: String,
    redelivery_delay: Duration,
    bindings: RwLock<HashMap<String, Vec<QueueBinding>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Broker {
    fn unbind(&self, key: &str, id: u64) {
        let mut bindings = self.bindings.write().unwrap_or_else(|p| p.into_inner());
        if let Some(queues) = bindings.get_mut(key) {
            queues.retain(|q| q.id != id);
            if queues.is_empty() {
                bindings.remove(key);
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Transport("connection closed".to_string()));
        }
        Ok(())
    }
}

/// In-memory adapter. Clones share the same broker.
#[derive(Clone)]
pub struct InProcessChannelAdapter {
    broker: Arc<Broker>,
}

impl InProcessChannelAdapter {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_ROUTING_PREFIX, DEFAULT_REDELIVERY_DELAY)
    }

    pub fn with_settings(routing_prefix: impl Into<String>, redelivery_delay: Duration) -> Self {
        let routing_prefix = routing_prefix.into();
        info!(
            routing_prefix = %routing_prefix,
            redelivery_delay_ms = redelivery_delay.as_millis() as u64,
            "In-process channel adapter initialized"
        );
        Self {
            broker: Arc::new(Broker {
                routing_prefix,
                redelivery_delay,
                bindings: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of live consumers bound to `subject`.
    pub fn consumer_count(&self, subject: &str) -> usize {
        let key = routing_key(&self.broker.routing_prefix, subject);
        self.broker
            .bindings
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Simulate connection loss.
    ///
    /// Drops every binding and fails all later publishes and subscribes.
    pub fn close(&self) {
        self.broker.closed.store(true, Ordering::SeqCst);
        self.broker
            .bindings
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        info!("In-process channel adapter closed");
    }

    async fn consume(
        mut receiver: mpsc::UnboundedReceiver<Bytes>,
        requeue: mpsc::WeakUnboundedSender<Bytes>,
        handler: Arc<dyn DeliveryHandler>,
        token: CancellationToken,
        redelivery_delay: Duration,
        key: String,
    ) {
        loop {
            let body = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(body) => body,
                    None => break,
                },
            };

            let outcome = deliver(handler.as_ref(), body.clone()).await;
            match Disposition::from_result(&outcome) {
                Disposition::Ack => {}
                Disposition::Requeue => {
                    debug!(routing_key = %key, "Delivery nacked, scheduling redelivery");
                    let requeue = requeue.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(redelivery_delay).await;
                        if let Some(sender) = requeue.upgrade() {
                            let _ = sender.send(body);
                        }
                    });
                }
                Disposition::Reject => {
                    warn!(routing_key = %key, "Delivery rejected, message dropped");
                }
            }
        }

        debug!(routing_key = %key, "In-process consumer stopped");
    }
}

impl Default for InProcessChannelAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for InProcessChannelAdapter {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(subject = %subject))]
    async fn publish(&self, subject: &str, body: Option<Bytes>) -> Result<()> {
        self.broker.ensure_open()?;

        let key = routing_key(&self.broker.routing_prefix, subject);
        let body = body.unwrap_or_default();

        let delivered = {
            let bindings = self
                .broker
                .bindings
                .read()
                .unwrap_or_else(|p| p.into_inner());
            bindings
                .get(&key)
                .map(|queues| {
                    queues
                        .iter()
                        .filter(|q| q.sender.send(body.clone()).is_ok())
                        .count()
                })
                .unwrap_or(0)
        };

        debug!(routing_key = %key, receivers = delivered, "Published to in-process queues");
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        self.broker.ensure_open()?;

        let key = routing_key(&self.broker.routing_prefix, subject);
        let id = self.broker.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        let requeue = sender.downgrade();

        self.broker
            .bindings
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.clone())
            .or_default()
            .push(QueueBinding { id, sender });

        let token = CancellationToken::new();
        tokio::spawn(Self::consume(
            receiver,
            requeue,
            handler,
            token.clone(),
            self.broker.redelivery_delay,
            key.clone(),
        ));

        debug!(subject = %subject, routing_key = %key, "Bound in-process queue");

        let broker = Arc::clone(&self.broker);
        Ok(Subscription::new(subject, token).with_cleanup(move || broker.unbind(&key, id)))
    }
}
