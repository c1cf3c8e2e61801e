//! Dto bus client: envelope-level publish/subscribe.
//!
//! Combines a [`Serializer`] with a [`ChannelAdapter`]. Publishing fills in
//! missing identifiers and returns failures as values. Delivery failures go
//! to the subscriber's [`ErrorCallback`] and never reach the consumer loop as
//! panics.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, error, Instrument};
use uuid::Uuid;

use crate::adapter::{ChannelAdapter, DeliveryHandler, Subscription};
use crate::codec::{BusEvent, Serializer};
use crate::error::{BusError, DeliveryFailure, ErrorCallback, Result};
use crate::types::{erase, Payload, TypeTag, TypeTagged};

/// Generate a fresh event or correlation identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identifiers a publish went out with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub event_id: String,
    pub correlation_id: String,
}

impl Published {
    /// Empty identifiers count as missing; the decoder rejects them.
    fn resolve(event_id: Option<&str>, correlation_id: Option<&str>) -> Self {
        let given = |id: Option<&str>| id.filter(|id| !id.is_empty()).map(str::to_string);
        Self {
            event_id: given(event_id).unwrap_or_else(new_id),
            correlation_id: given(correlation_id).unwrap_or_else(new_id),
        }
    }
}

/// A delivery downcast to its concrete payload type.
#[derive(Debug, Clone)]
pub struct TypedEvent<T> {
    pub payload: Option<Arc<T>>,
    pub event_id: String,
    pub correlation_id: String,
}

impl<T: TypeTagged> TypedEvent<T> {
    pub fn from_event(event: BusEvent) -> Result<Self> {
        Ok(Self {
            payload: event.payload_as::<T>()?,
            event_id: event.event_id,
            correlation_id: event.correlation_id,
        })
    }
}

/// Typed publish/subscribe over a channel adapter.
#[derive(Clone)]
pub struct BusClient {
    adapter: Arc<dyn ChannelAdapter>,
    serializer: Arc<dyn Serializer>,
}

impl BusClient {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            adapter,
            serializer,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn ChannelAdapter> {
        &self.adapter
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Publish a parameterless event.
    #[tracing::instrument(name = "bus.client.publish_signal", skip_all, fields(subject = %subject))]
    pub async fn publish_signal(
        &self,
        subject: &str,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<Published> {
        let ids = Published::resolve(event_id, correlation_id);
        let body = self
            .serializer
            .serialize_signal(&ids.event_id, &ids.correlation_id)?;
        self.send(subject, body, ids).await
    }

    /// Publish `payload` as an event of type `type_tag`.
    #[tracing::instrument(
        name = "bus.client.publish",
        skip_all,
        fields(subject = %subject, type_tag = %type_tag)
    )]
    pub async fn publish(
        &self,
        subject: &str,
        payload: &Payload,
        type_tag: TypeTag,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<Published> {
        let ids = Published::resolve(event_id, correlation_id);
        let body =
            self.serializer
                .serialize(payload, type_tag, &ids.event_id, &ids.correlation_id)?;
        self.send(subject, body, ids).await
    }

    /// Publish a typed value. `None` publishes a parameterless event.
    pub async fn publish_typed<T: TypeTagged>(
        &self,
        subject: &str,
        payload: Option<T>,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<Published> {
        match payload {
            Some(value) => {
                self.publish(subject, &erase(value), T::TYPE_TAG, event_id, correlation_id)
                    .await
            }
            None => self.publish_signal(subject, event_id, correlation_id).await,
        }
    }

    async fn send(&self, subject: &str, body: Bytes, ids: Published) -> Result<Published> {
        self.adapter.publish(subject, Some(body)).await?;
        debug!(
            subject = %subject,
            event_id = %ids.event_id,
            correlation_id = %ids.correlation_id,
            "Published event"
        );
        Ok(ids)
    }

    // ========================================================================
    // Subscribe
    // ========================================================================

    /// Subscribe to events of type `type_tag` on `subject`.
    ///
    /// An `Err` from `callback` is reported and the delivery is requeued or
    /// rejected per [`BusError::should_requeue`].
    pub async fn subscribe<F, Fut>(
        &self,
        subject: &str,
        type_tag: TypeTag,
        callback: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.attach(subject, Some(type_tag), callback, on_error).await
    }

    /// Subscribe to parameterless events on `subject`.
    ///
    /// The callback receives the event and correlation identifiers.
    pub async fn subscribe_signal<F, Fut>(
        &self,
        subject: &str,
        callback: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription>
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.attach(
            subject,
            None,
            move |event: BusEvent| callback(event.event_id, event.correlation_id),
            on_error,
        )
        .await
    }

    /// Subscribe with payloads downcast to `T`.
    ///
    /// A payload that is not a `T` is reported as a type mismatch and the
    /// callback is not invoked.
    pub async fn subscribe_typed<T, F, Fut>(
        &self,
        subject: &str,
        callback: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription>
    where
        T: TypeTagged,
        F: Fn(TypedEvent<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(
            subject,
            T::TYPE_TAG,
            move |event: BusEvent| {
                let delivered = TypedEvent::<T>::from_event(event).map(&callback);
                async move { delivered?.await }
            },
            on_error,
        )
        .await
    }

    async fn attach<F, Fut>(
        &self,
        subject: &str,
        type_tag: Option<TypeTag>,
        callback: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = EventDelivery {
            reporter: Reporter {
                subject: subject.to_string(),
                type_tag,
                on_error,
            },
            serializer: self.serializer.clone(),
            callback,
        };
        let subscription = self.adapter.subscribe(subject, Arc::new(handler)).await?;
        debug!(subject = %subject, type_tag = ?type_tag, "Subscribed");
        Ok(subscription)
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Routes delivery failures to the subscriber's error callback.
#[derive(Clone)]
struct Reporter {
    subject: String,
    type_tag: Option<TypeTag>,
    on_error: Option<ErrorCallback>,
}

impl Reporter {
    fn report(
        &self,
        error: BusError,
        event_id: Option<String>,
        correlation_id: Option<String>,
        raw: Bytes,
    ) {
        match &self.on_error {
            Some(on_error) => on_error(DeliveryFailure {
                subject: self.subject.clone(),
                type_tag: self.type_tag,
                error,
                event_id,
                correlation_id,
                raw: Some(raw),
            }),
            None => error!(
                subject = %self.subject,
                event_id = ?event_id,
                correlation_id = ?correlation_id,
                error = %error,
                "Delivery failed"
            ),
        }
    }
}

/// Decodes envelopes and hands them to a subscriber callback.
struct EventDelivery<F> {
    reporter: Reporter,
    serializer: Arc<dyn Serializer>,
    callback: F,
}

impl<F, Fut> DeliveryHandler for EventDelivery<F>
where
    F: Fn(BusEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, body: Bytes) -> BoxFuture<'static, Result<()>> {
        let event = match self.serializer.deserialize(&body, self.reporter.type_tag) {
            Ok(event) => event,
            Err(e) => {
                self.reporter.report(e.clone(), None, None, body);
                return Box::pin(futures::future::ready(Err(e)));
            }
        };

        let span = tracing::debug_span!(
            "bus.client.deliver",
            subject = %self.reporter.subject,
            event_id = %event.event_id,
            correlation_id = %event.correlation_id,
        );
        let ids = (event.event_id.clone(), event.correlation_id.clone());
        let pending = (self.callback)(event);
        let reporter = self.reporter.clone();

        Box::pin(
            async move {
                let result = pending.await;
                if let Err(e) = &result {
                    let (event_id, correlation_id) = ids;
                    reporter.report(e.clone(), Some(event_id), Some(correlation_id), body);
                }
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests;
