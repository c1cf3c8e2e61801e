use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::Resolver;
use crate::adapter::Subscription;
use crate::client::{BusClient, Published, TypedEvent};
use crate::codec::BusEvent;
use crate::error::{ErrorCallback, Result};
use crate::mapper::MapperFactory;
use crate::registry::Registry;
use crate::types::{erase, Payload, TypeTag, TypeTagged};

/// Publish/subscribe with domain values.
#[derive(Clone)]
pub struct DomainBus {
    client: BusClient,
    resolver: Resolver,
}

impl DomainBus {
    pub fn new(
        client: BusClient,
        registry: Arc<Registry>,
        mappers: Arc<dyn MapperFactory>,
    ) -> Self {
        Self {
            client,
            resolver: Resolver { registry, mappers },
        }
    }

    /// Publish a parameterless event. No registration is needed.
    pub async fn publish_signal(
        &self,
        subject: &str,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<Published> {
        self.client
            .publish_signal(subject, event_id, correlation_id)
            .await
    }

    /// Publish a domain value of type `domain_type`.
    ///
    /// Registration, type and mapping failures are returned before anything
    /// reaches the transport.
    pub async fn publish(
        &self,
        subject: &str,
        domain: &Payload,
        domain_type: TypeTag,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<Published> {
        let route = self.resolver.route(subject, domain_type)?;
        let dto = route.to_dto(domain)?;
        self.client
            .publish(subject, &dto, route.binding.dto, event_id, correlation_id)
            .await
    }

    /// Publish a typed domain value. `None` publishes a parameterless event.
    pub async fn publish_typed<T: TypeTagged>(
        &self,
        subject: &str,
        domain: Option<T>,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<Published> {
        match domain {
            Some(value) => {
                self.publish(subject, &erase(value), T::TYPE_TAG, event_id, correlation_id)
                    .await
            }
            None => self.publish_signal(subject, event_id, correlation_id).await,
        }
    }

    /// Subscribe to domain values of type `domain_type` on `subject`.
    ///
    /// Each delivered dto is mapped to its domain value before `callback`
    /// sees it. A delivery without payload reaches `callback` with no
    /// payload and never touches the mapper.
    pub async fn subscribe<F, Fut>(
        &self,
        subject: &str,
        domain_type: TypeTag,
        callback: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let route = self.resolver.route(subject, domain_type)?;
        let dto_type = route.binding.dto;
        debug!(subject = %subject, dto = %dto_type, domain = %domain_type, "Domain subscribe");

        self.client
            .subscribe(
                subject,
                dto_type,
                move |event: BusEvent| {
                    let delivered = route.event_to_domain(event).map(&callback);
                    async move { delivered?.await }
                },
                on_error,
            )
            .await
    }

    /// Subscribe to parameterless events on `subject`.
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
        self.client
            .subscribe_signal(subject, callback, on_error)
            .await
    }

    /// Typed [`DomainBus::subscribe`].
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
}
