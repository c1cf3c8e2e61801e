//! Envelope codec.
//!
//! Every message on the wire is an [`Envelope`]: optional payload bytes plus
//! the event and correlation identifiers. The payload itself is encoded by a
//! [`PayloadCodec`] looked up by the payload's [`TypeTag`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::types::{downcast, Payload, TypeTag, TypeTagged};

/// Wire record exchanged over the transport.
///
/// Identifiers are optional on the wire so that a foreign or truncated record
/// can be told apart from a valid one on decode.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub payload: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub event_id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub correlation_id: Option<String>,
}

/// A decoded delivery.
#[derive(Clone)]
pub struct BusEvent {
    /// `None` for signal-only events.
    pub payload: Option<Payload>,
    pub type_tag: Option<TypeTag>,
    pub event_id: String,
    pub correlation_id: String,
}

impl BusEvent {
    /// Downcast the payload to its concrete type.
    pub fn payload_as<T: TypeTagged>(&self) -> Result<Option<Arc<T>>> {
        self.payload.clone().map(downcast::<T>).transpose()
    }
}

impl std::fmt::Debug for BusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusEvent")
            .field("has_payload", &self.payload.is_some())
            .field("type_tag", &self.type_tag)
            .field("event_id", &self.event_id)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// Envelope serializer contract.
pub trait Serializer: Send + Sync {
    /// Serialize a parameterless event.
    fn serialize_signal(&self, event_id: &str, correlation_id: &str) -> Result<Bytes>;

    /// Serialize an event carrying `payload` of type `type_tag`.
    fn serialize(
        &self,
        payload: &Payload,
        type_tag: TypeTag,
        event_id: &str,
        correlation_id: &str,
    ) -> Result<Bytes>;

    /// Decode an envelope, decoding the payload as `type_tag` when one is given.
    ///
    /// Fails with [`BusError::MalformedEnvelope`] when either identifier is
    /// missing. A missing payload is not an error.
    fn deserialize(&self, bytes: &[u8], type_tag: Option<TypeTag>) -> Result<BusEvent>;
}

/// Encodes and decodes payloads of one type.
pub trait PayloadCodec: Send + Sync {
    fn type_tag(&self) -> TypeTag;
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Payload>;
}

/// [`PayloadCodec`] for prost messages.
pub struct ProstCodec<T>(PhantomData<fn() -> T>);

impl<T> ProstCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ProstCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadCodec for ProstCodec<T>
where
    T: Message + Default + TypeTagged,
{
    fn type_tag(&self) -> TypeTag {
        T::TYPE_TAG
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>> {
        let value = payload.downcast_ref::<T>().ok_or_else(|| {
            BusError::Serialization(format!("payload is not a {}", T::TYPE_TAG))
        })?;
        Ok(value.encode_to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload> {
        let value = T::decode(bytes).map_err(|e| {
            BusError::Serialization(format!("failed to decode {}: {}", T::TYPE_TAG, e))
        })?;
        Ok(Arc::new(value))
    }
}

/// Envelope serializer backed by prost, with payload codecs keyed by tag.
#[derive(Clone, Default)]
pub struct ProstSerializer {
    codecs: HashMap<TypeTag, Arc<dyn PayloadCodec>>,
}

impl ProstSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prost message type, builder style.
    pub fn with<T>(mut self) -> Self
    where
        T: Message + Default + TypeTagged,
    {
        self.register::<T>();
        self
    }

    /// Register a prost message type.
    pub fn register<T>(&mut self)
    where
        T: Message + Default + TypeTagged,
    {
        self.register_codec(Arc::new(ProstCodec::<T>::new()));
    }

    /// Register a custom payload codec. Replaces any codec with the same tag.
    pub fn register_codec(&mut self, codec: Arc<dyn PayloadCodec>) {
        self.codecs.insert(codec.type_tag(), codec);
    }

    pub fn knows(&self, type_tag: TypeTag) -> bool {
        self.codecs.contains_key(&type_tag)
    }

    fn codec(&self, type_tag: TypeTag) -> Result<&Arc<dyn PayloadCodec>> {
        self.codecs
            .get(&type_tag)
            .ok_or_else(|| BusError::Serialization(format!("no codec registered for {}", type_tag)))
    }

    fn encode_envelope(envelope: Envelope) -> Bytes {
        Bytes::from(envelope.encode_to_vec())
    }
}

impl Serializer for ProstSerializer {
    fn serialize_signal(&self, event_id: &str, correlation_id: &str) -> Result<Bytes> {
        Ok(Self::encode_envelope(Envelope {
            payload: None,
            event_id: Some(event_id.to_string()),
            correlation_id: Some(correlation_id.to_string()),
        }))
    }

    fn serialize(
        &self,
        payload: &Payload,
        type_tag: TypeTag,
        event_id: &str,
        correlation_id: &str,
    ) -> Result<Bytes> {
        let body = self.codec(type_tag)?.encode(payload)?;
        Ok(Self::encode_envelope(Envelope {
            payload: Some(body),
            event_id: Some(event_id.to_string()),
            correlation_id: Some(correlation_id.to_string()),
        }))
    }

    fn deserialize(&self, bytes: &[u8], type_tag: Option<TypeTag>) -> Result<BusEvent> {
        let envelope = Envelope::decode(bytes)
            .map_err(|e| BusError::MalformedEnvelope(format!("undecodable envelope: {}", e)))?;

        let event_id = envelope
            .event_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BusError::MalformedEnvelope("missing event id".to_string()))?;
        let correlation_id = envelope
            .correlation_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BusError::MalformedEnvelope("missing correlation id".to_string()))?;

        let payload = match (envelope.payload, type_tag) {
            (None, _) => None,
            (Some(body), Some(tag)) => Some(self.codec(tag)?.decode(&body)?),
            (Some(body), None) => {
                debug!(
                    bytes = body.len(),
                    event_id = %event_id,
                    "Ignoring payload on untyped delivery"
                );
                None
            }
        };

        Ok(BusEvent {
            payload,
            type_tag,
            event_id,
            correlation_id,
        })
    }
}

#[cfg(test)]
mod tests;
