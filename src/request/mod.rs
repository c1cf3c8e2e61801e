//! Request/reply over publish/subscribe.
//!
//! A request subscribes to a reply subject scoped by its correlation id, then
//! publishes. The first reply wins. Responders reply on the subject derived
//! from the request's own correlation id.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::Subscription;
use crate::client::{new_id, BusClient, Published, TypedEvent};
use crate::codec::BusEvent;
use crate::error::{BusError, ErrorCallback, Result};
use crate::types::{erase, Payload, TypeTag, TypeTagged};

/// Typed outcome of a successful request.
pub type Response<T> = TypedEvent<T>;

/// Subject a responder publishes its reply on.
pub fn reply_subject(response_subject: &str, correlation_id: &str) -> String {
    format!("{}:{}", response_subject, correlation_id)
}

/// What a responder sends back.
#[derive(Clone)]
pub struct Reply {
    pub payload: Option<Payload>,
    pub type_tag: TypeTag,
}

impl Reply {
    pub fn new<T: TypeTagged>(value: T) -> Self {
        Self {
            payload: Some(erase(value)),
            type_tag: T::TYPE_TAG,
        }
    }

    /// A reply with no payload.
    pub fn empty(type_tag: TypeTag) -> Self {
        Self {
            payload: None,
            type_tag,
        }
    }

    pub fn from_option<T: TypeTagged>(value: Option<T>) -> Self {
        value.map_or_else(|| Self::empty(T::TYPE_TAG), Self::new)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("has_payload", &self.payload.is_some())
            .field("type_tag", &self.type_tag)
            .finish()
    }
}

/// Request/reply on top of a [`BusClient`].
#[derive(Clone)]
pub struct RequestService {
    client: BusClient,
}

impl RequestService {
    pub fn new(client: BusClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &BusClient {
        &self.client
    }

    /// Send a request and wait for the first reply.
    ///
    /// Resolves to [`BusError::Cancelled`] when `cancel` fires first, and to
    /// the publish error when the request could not be sent. The reply
    /// subscription is gone by the time this returns.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(
        name = "bus.request",
        skip_all,
        fields(request_subject = %request_subject, response_subject = %response_subject)
    )]
    pub async fn request(
        &self,
        payload: Option<Payload>,
        request_type: TypeTag,
        request_subject: &str,
        response_type: TypeTag,
        response_subject: &str,
        event_id: Option<&str>,
        correlation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BusEvent> {
        let correlation_id = correlation_id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_id);
        let reply_to = reply_subject(response_subject, &correlation_id);
        let linked = cancel.child_token();

        // Subscribe before publishing so a fast responder cannot be missed
        let (tx, rx) = oneshot::channel();
        let subscription = self
            .await_reply(&reply_to, response_type, tx, linked.clone())
            .await?;

        let publish = async {
            let sent = match &payload {
                Some(payload) => {
                    self.client
                        .publish(
                            request_subject,
                            payload,
                            request_type,
                            event_id,
                            Some(&correlation_id),
                        )
                        .await
                }
                None => {
                    self.client
                        .publish_signal(request_subject, event_id, Some(&correlation_id))
                        .await
                }
            };
            if sent.is_err() {
                linked.cancel();
            }
            sent
        };

        let wait = async {
            tokio::select! {
                biased;
                reply = rx => reply.map_err(|_| BusError::Cancelled),
                _ = linked.cancelled() => Err(BusError::Cancelled),
            }
        };

        let (sent, reply) = tokio::join!(publish, wait);
        subscription.unsubscribe();

        let sent: Published = sent?;
        match &reply {
            Ok(event) => debug!(
                correlation_id = %sent.correlation_id,
                event_id = %event.event_id,
                "Received reply"
            ),
            Err(e) => warn!(
                correlation_id = %sent.correlation_id,
                reply_subject = %reply_to,
                error = %e,
                "Request ended without reply"
            ),
        }
        reply
    }

    /// Like [`RequestService::request`], bounded by `timeout`.
    ///
    /// Resolves to [`BusError::Timeout`] when the deadline passes first.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_with_timeout(
        &self,
        payload: Option<Payload>,
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
            payload,
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

    /// Typed request: `Req` out, `Resp` back.
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

    /// Answer requests on `request_subject`.
    ///
    /// Each reply goes to `reply_subject(response_subject, correlation_id)`
    /// with the request's correlation id and a fresh event id. A reply whose
    /// type is not `response_type` is reported and never sent.
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
        let client = self.client.clone();
        let response_subject = response_subject.to_string();

        self.client
            .subscribe(
                request_subject,
                request_type,
                move |request: BusEvent| {
                    let client = client.clone();
                    let reply_to = reply_subject(&response_subject, &request.correlation_id);
                    let correlation_id = request.correlation_id.clone();
                    let pending = responder(request);

                    async move {
                        let reply = pending.await?;
                        if reply.type_tag != response_type {
                            return Err(BusError::TypeMismatch {
                                context: format!("reply subject:{}", reply_to),
                                expected: response_type,
                                actual: Some(reply.type_tag),
                            });
                        }

                        match &reply.payload {
                            Some(payload) => {
                                client
                                    .publish(
                                        &reply_to,
                                        payload,
                                        reply.type_tag,
                                        None,
                                        Some(&correlation_id),
                                    )
                                    .await?
                            }
                            None => {
                                client
                                    .publish_signal(&reply_to, None, Some(&correlation_id))
                                    .await?
                            }
                        };
                        Ok(())
                    }
                },
                on_error,
            )
            .await
    }

    /// Typed [`RequestService::listen`].
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

    async fn await_reply(
        &self,
        reply_to: &str,
        response_type: TypeTag,
        tx: oneshot::Sender<BusEvent>,
        resolved: CancellationToken,
    ) -> Result<Subscription> {
        let slot = Arc::new(Mutex::new(Some(tx)));
        self.client
            .subscribe(
                reply_to,
                response_type,
                move |event: BusEvent| {
                    let first = slot
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    // Later deliveries find the slot empty and are dropped
                    if let Some(tx) = first {
                        let _ = tx.send(event);
                        resolved.cancel();
                    }
                    futures::future::ready(Ok(()))
                },
                None,
            )
            .await
    }
}
