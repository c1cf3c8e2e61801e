//! Computer Bus - typed messaging over a broker
//!
//! Typed publish/subscribe on named subjects, request/reply built from
//! publish/subscribe, and a domain layer that maps application types to wire
//! types through registered mappers.
//!
//! Layers, leaves first:
//! - `codec`: envelope wire format and payload codecs
//! - `adapter`: broker topology and byte-level publish/subscribe
//! - `client`: envelope-level publish/subscribe
//! - `request`: request/reply over the client
//! - `registry` and `mapper`: subject bindings and domain/dto mappers
//! - `domain`: domain-level bus and request service

pub mod adapter;
pub mod client;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod mapper;
pub mod registry;
pub mod request;
pub mod types;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use adapter::{init_channel_adapter, ChannelAdapter, InProcessChannelAdapter, Subscription};
pub use client::{BusClient, Published, TypedEvent};
pub use codec::{BusEvent, ProstSerializer, Serializer};
pub use config::Config;
pub use domain::{DomainBus, DomainRequestService};
pub use error::{BusError, DeliveryFailure, ErrorCallback, Result};
pub use mapper::{FnMapper, Mapper, MapperFactory, MapperTable};
pub use registry::{MapRegistration, Registry, RegistryBuilder, SubjectRegistration};
pub use request::{reply_subject, Reply, RequestService, Response};
pub use types::{erase, Payload, TypeTag, TypeTagged};
