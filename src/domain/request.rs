use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Resolver, Route};
use crate::adapter::Subscription;
use crate::client::TypedEvent;
use crate::codec::BusEvent;
use crate::error::{BusError, ErrorCallback, Result};
use crate::mapper::MapperFactory;
use crate::registry::Registry;
use crate::request::{Reply, RequestService, Response};
use crate::types::{erase, Payload, TypeTag, TypeTagged};

/// Request/reply with domain values.
///
/// The request and response subjects are resolved independently. Each needs
/// its own typed registration and mapper.
#[derive(Clone)]
pub struct DomainRequestService {
    requests: RequestService,
    resolver: Resolver,
}

impl DomainRequestService {
    pub fn new(
        requests: RequestService,
        registry: Arc<Registry>,
        mappers: Arc<dyn MapperFactory>,
    ) -> Self {
        Self {
            requests,
            resolver: Resolver { registry, mappers },
        }
    }

    fn routes(
        &self,
        request_subject: &str,
        request_type: TypeTag,
        response_subject: &str,
        response_type: TypeTag,
    ) -> Result<(Route, Route)> {
        Ok((
            self.resolver.route(request_subject, request_type)?,
            self.resolver.route(response_subject, response_type)?,
        ))
    }

    /// Send a domain request and map the reply back to its domain type.
    ///
    /// Every failure, from lookup through transport and cancellation, comes
    /// back as an error value.
    #[allow(clippy::too_many_arguments)]
    pub async fn request(
        &self,
        request: Option<Payload>,
        request_type: TypeTag,
        request_subject: &str,
        response_type: TypeTag,
        response_subject: &str,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BusEvent> {
        let (request_route, response_route) =
            self.routes(request_subject, request_type, response_subject, response_type)?;
        let dto = request_route.optional_to_dto(request.as_ref())?;

        let reply = self
            .requests
            .request(
                dto,
                request_route.binding.dto,
                request_subject,
                response_route.binding.dto,
                response_subject,
                event_id,
                correlation_id,
                cancel,
            )
            .await?;
        response_route.event_to_domain(reply)
    }

    /// Like [`DomainRequestService::request`], bounded by `timeout`.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_with_timeout(
        &self,
        request: Option<Payload>,
        request_type: TypeTag,
        request_subject: &str,
        response_type: TypeTag,
        response_subject: &str,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
        timeout: Duration,
    ) -> Result<BusEvent> {
        let token = CancellationToken::new();
        let pending = self.request(
            request,
            request_type,
            request_subject,
            response_type,
            response_subject,
            event_id,
            correlation_id,
            &token,
        );
        match tokio::time::timeout(timeout, pending).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Typed domain request.
    pub async fn request_typed<Req, Resp>(
        &self,
        request: Option<Req>,
        request_subject: &str,
        response_subject: &str,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Response<Resp>>
    where
        Req: TypeTagged,
        Resp: TypeTagged,
    {
        let event = self
            .request(
                request.map(erase),
                Req::TYPE_TAG,
                request_subject,
                Resp::TYPE_TAG,
                response_subject,
                event_id,
                correlation_id,
                cancel,
            )
            .await?;
        Response::from_event(event)
    }

    /// Answer domain requests on `request_subject`.
    ///
    /// Registration failures are returned before subscribing. The responder
    /// sees the request as a domain value and replies with one of
    /// `response_type`.
    pub async fn listen<F, Fut>(
        &self,
        request_subject: &str,
        request_type: TypeTag,
        response_subject: &str,
        response_type: TypeTag,
        responder: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        let (request_route, response_route) =
            self.routes(request_subject, request_type, response_subject, response_type)?;
        let (request_dto, response_dto) = (request_route.binding.dto, response_route.binding.dto);
        let response_route = Arc::new(response_route);

        self.requests
            .listen(
                request_subject,
                request_dto,
                response_subject,
                response_dto,
                move |request: BusEvent| {
                    let pending = request_route.event_to_domain(request).map(&responder);
                    let response_route = response_route.clone();

                    async move {
                        let reply = pending?.await?;
                        if reply.type_tag != response_route.binding.domain {
                            return Err(BusError::TypeMismatch {
                                context: format!("subject:{}", response_route.subject),
                                expected: response_route.binding.domain,
                                actual: Some(reply.type_tag),
                            });
                        }
                        Ok(Reply {
                            payload: response_route.optional_to_dto(reply.payload.as_ref())?,
                            type_tag: response_route.binding.dto,
                        })
                    }
                },
                on_error,
            )
            .await
    }

    /// Typed [`DomainRequestService::listen`].
    pub async fn listen_typed<Req, Resp, F, Fut>(
        &self,
        request_subject: &str,
        response_subject: &str,
        responder: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription>
    where
        Req: TypeTagged,
        Resp: TypeTagged,
        F: Fn(TypedEvent<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Resp>>> + Send + 'static,
    {
        self.listen(
            request_subject,
            Req::TYPE_TAG,
            response_subject,
            Resp::TYPE_TAG,
            move |request: BusEvent| {
                let pending = TypedEvent::<Req>::from_event(request).map(&responder);
                async move { pending?.await.map(Reply::from_option) }
            },
            on_error,
        )
        .await
    }
}
