//! AMQP (RabbitMQ) channel adapter.
//!
//! Uses one direct exchange for every subject. Each subscription declares a
//! server-named, durable, auto-delete queue bound with the subject's routing key.
//! A consumer whose stream fails is re-established on a fresh queue with
//! exponential backoff until the subscription is dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::{
    deliver, routing_key, ChannelAdapter, DeliveryHandler, Disposition, Subscription,
    DEFAULT_EXCHANGE, DEFAULT_ROUTING_PREFIX,
};
use crate::config::AmqpSettings;
use crate::error::{BusError, Result};

/// Configuration for the AMQP adapter.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
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

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_prefix: DEFAULT_ROUTING_PREFIX.to_string(),
            pool_size: 10,
            publish_retries: 5,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }
}

impl From<&AmqpSettings> for AmqpConfig {
    fn from(settings: &AmqpSettings) -> Self {
        Self {
            url: settings.url.clone(),
            exchange: settings.exchange.clone(),
            routing_prefix: settings.routing_prefix.clone(),
            pool_size: settings.pool_size,
            publish_retries: settings.publish_retries,
        }
    }
}

/// AMQP channel adapter using RabbitMQ.
///
/// The pooled connection is shared. Every publish and subscribe opens its own
/// channel, since channels are not used concurrently by in-flight operations.
pub struct AmqpChannelAdapter {
    pool: Pool,
    config: AmqpConfig,
}

impl AmqpChannelAdapter {
    /// Connect and declare the exchange.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Transport(format!("Failed to create pool: {}", e)))?;

        let adapter = Self { pool, config };

        // Verify connection
        let channel = Self::open_channel(&adapter.pool).await?;
        Self::declare_exchange(&channel, &adapter.config.exchange).await?;
        let _ = channel.close(200, "connected").await;

        info!(
            exchange = %adapter.config.exchange,
            url = %adapter.config.url,
            "Connected to AMQP"
        );

        Ok(adapter)
    }

    /// Get a fresh channel from a pooled connection.
    async fn open_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Transport(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Transport(format!("Failed to create channel: {}", e)))
    }

    async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Transport(format!("Failed to declare exchange: {}", e)))
    }

    fn routing_key(&self, subject: &str) -> String {
        routing_key(&self.config.routing_prefix, subject)
    }

    async fn publish_once(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        let channel = Self::open_channel(&self.pool).await?;
        Self::declare_exchange(&channel, &self.config.exchange).await?;

        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| BusError::Transport(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Transport(format!("Publish confirmation failed: {}", e)))?;

        if let Err(e) = channel.close(200, "published").await {
            debug!(error = %e, "Failed to close publish channel");
        }
        Ok(())
    }

    /// Declare the subscriber queue, bind it and start a consumer.
    async fn setup_consumer(
        pool: &Pool,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(Channel, lapin::Consumer, String)> {
        let channel = Self::open_channel(pool).await?;
        Self::declare_exchange(&channel, exchange).await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Transport(format!("Failed to declare queue: {}", e)))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Transport(format!("Failed to bind queue: {}", e)))?;

        let consumer_tag = format!("computer-bus-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Transport(format!("Failed to start consumer: {}", e)))?;

        Ok((channel, consumer, queue_name))
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    ///
    /// A failed or ended consumer stream is replaced by a fresh queue, binding
    /// and consumer until the subscription is cancelled.
    async fn consume_with_reconnect(
        pool: Pool,
        exchange: String,
        routing_key: String,
        initial: lapin::Consumer,
        attached: Attached,
        handler: Arc<dyn DeliveryHandler>,
        token: CancellationToken,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();
        let mut consumer = Some(initial);

        loop {
            if let Some(active) = consumer.take() {
                Self::consume(active, handler.as_ref(), &token, &routing_key).await;
                if token.is_cancelled() {
                    break;
                }
                release(&attached);
                info!(routing_key = %routing_key, "Consumer stream ended, reconnecting...");
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match Self::setup_consumer(&pool, &exchange, &routing_key).await {
                Ok((channel, fresh, queue)) => {
                    let tag = fresh.tag().as_str().to_string();
                    *attached.lock().unwrap_or_else(|p| p.into_inner()) = Some((channel, tag));
                    // Unsubscribed while reconnecting
                    if token.is_cancelled() {
                        break;
                    }
                    info!(
                        queue = %queue,
                        routing_key = %routing_key,
                        "Consumer reconnected, processing messages"
                    );
                    backoff_iter = backoff_builder.build();
                    consumer = Some(fresh);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        routing_key = %routing_key,
                        "Failed to set up consumer, retrying after backoff"
                    );
                }
            }
        }

        release(&attached);
        debug!(routing_key = %routing_key, "AMQP consumer stopped");
    }

    /// Deliver messages to `handler` until the stream ends or the subscription is cancelled.
    async fn consume(
        mut consumer: lapin::Consumer,
        handler: &dyn DeliveryHandler,
        token: &CancellationToken,
        routing_key: &str,
    ) {
        loop {
            let mut delivery = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(
                            routing_key = %routing_key,
                            error = %e,
                            "Consumer delivery error, will reconnect"
                        );
                        return;
                    }
                    None => return,
                },
            };

            let body = Bytes::from(std::mem::take(&mut delivery.data));
            let consume_span =
                tracing::info_span!("bus.consume", routing_key = %delivery.routing_key);
            let outcome = deliver(handler, body).instrument(consume_span).await;

            let acked = match Disposition::from_result(&outcome) {
                Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
                Disposition::Requeue => {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                }
                Disposition::Reject => {
                    warn!(routing_key = %routing_key, "Rejecting undeliverable message");
                    delivery
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                }
            };
            if let Err(e) = acked {
                error!(routing_key = %routing_key, error = %e, "Failed to settle delivery");
            }
        }
    }
}

/// Channel and consumer tag of the live consumer, if any.
type Attached = Arc<Mutex<Option<(Channel, String)>>>;

/// Cancel the attached consumer and close its channel.
///
/// The consumer is taken out of `attached` synchronously; the broker round
/// trips run on a spawned task. Unsettled deliveries go back to the queue.
fn release(attached: &Attached) {
    let Some((channel, tag)) = attached.lock().unwrap_or_else(|p| p.into_inner()).take() else {
        return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(consumer_tag = %tag, "No runtime to detach AMQP consumer");
        return;
    };
    runtime.spawn(async move {
        if let Err(e) = channel
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await
        {
            debug!(consumer_tag = %tag, error = %e, "Failed to cancel consumer");
        }
        if let Err(e) = channel.close(200, "unsubscribed").await {
            debug!(consumer_tag = %tag, error = %e, "Failed to close consumer channel");
        }
    });
}

#[async_trait]
impl ChannelAdapter for AmqpChannelAdapter {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(subject = %subject))]
    async fn publish(&self, subject: &str, body: Option<Bytes>) -> Result<()> {
        let routing_key = self.routing_key(subject);
        let body = body.unwrap_or_default();

        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.config.publish_retries)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.publish_once(&routing_key, &body).await {
                Ok(()) => {
                    debug!(
                        exchange = %self.config.exchange,
                        routing_key = %routing_key,
                        "Published"
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = self.config.publish_retries,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Transport("Max retries exceeded".to_string())))
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        let routing_key = self.routing_key(subject);
        let (channel, consumer, queue) =
            Self::setup_consumer(&self.pool, &self.config.exchange, &routing_key).await?;

        debug!(
            subject = %subject,
            queue = %queue,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );

        let tag = consumer.tag().as_str().to_string();
        let attached: Attached = Arc::new(Mutex::new(Some((channel, tag))));
        let token = CancellationToken::new();
        tokio::spawn(Self::consume_with_reconnect(
            self.pool.clone(),
            self.config.exchange.clone(),
            routing_key,
            consumer,
            attached.clone(),
            handler,
            token.clone(),
        ));

        Ok(Subscription::new(subject, token).with_cleanup(move || release(&attached)))
    }
}
