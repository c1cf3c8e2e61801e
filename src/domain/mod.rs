//! Domain-level bus and request service.
//!
//! This module contains:
//! - `DomainBus`: publish/subscribe with domain values
//! - `DomainRequestService`: request/reply with domain values
//!
//! Both look subjects up in a [`Registry`], check the caller's domain type
//! against the registration and convert through a [`Mapper`] resolved from a
//! [`MapperFactory`]. Application code never handles dto types directly.

mod bus;
mod request;

pub use bus::DomainBus;
pub use request::DomainRequestService;

use std::sync::Arc;

use crate::codec::BusEvent;
use crate::error::{BusError, Result};
use crate::mapper::{Mapper, MapperFactory};
use crate::registry::{Registry, TypedBinding};
use crate::types::{Payload, TypeTag};

/// Registry and mappers shared by the domain services.
#[derive(Clone)]
struct Resolver {
    registry: Arc<Registry>,
    mappers: Arc<dyn MapperFactory>,
}

/// A subject whose registration, domain type and mapper all checked out.
#[derive(Clone)]
struct Route {
    subject: String,
    binding: TypedBinding,
    mapper: Arc<dyn Mapper>,
}

impl Resolver {
    /// Resolve `subject` for values of `domain`.
    ///
    /// Fails without side effects when the subject is unknown or untyped, the
    /// domain type does not match, or no mapper is registered.
    fn route(&self, subject: &str, domain: TypeTag) -> Result<Route> {
        let binding = self.registry.lookup(subject)?.expect_domain(domain)?;
        let mapper = self
            .mappers
            .get_mapper(binding.mapper, binding.dto, binding.domain)?;
        Ok(Route {
            subject: subject.to_string(),
            binding,
            mapper,
        })
    }
}

impl Route {
    fn mapping_failed(&self) -> BusError {
        BusError::MappingFailed {
            subject: self.subject.clone(),
            dto: self.binding.dto,
            domain: self.binding.domain,
        }
    }

    fn to_dto(&self, domain: &Payload) -> Result<Payload> {
        self.mapper
            .domain_to_dto(domain)
            .ok_or_else(|| self.mapping_failed())
    }

    fn to_domain(&self, dto: &Payload) -> Result<Payload> {
        self.mapper
            .dto_to_domain(dto)
            .ok_or_else(|| self.mapping_failed())
    }

    /// Map an optional domain value. Absent values skip the mapper.
    fn optional_to_dto(&self, domain: Option<&Payload>) -> Result<Option<Payload>> {
        domain.map(|d| self.to_dto(d)).transpose()
    }

    /// Replace a dto event's payload with its domain value.
    fn event_to_domain(&self, event: BusEvent) -> Result<BusEvent> {
        let payload = event.payload.as_ref().map(|p| self.to_domain(p)).transpose()?;
        Ok(BusEvent {
            payload,
            type_tag: Some(self.binding.domain),
            ..event
        })
    }
}
