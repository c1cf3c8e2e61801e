//! Domain/dto mappers and the factory that resolves them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{BusError, Result};
use crate::types::{Payload, TypeTag, TypeTagged};

/// Converts between one domain type and one dto type.
///
/// Both directions return `None` when the value cannot be converted,
/// including when the input is not of the expected type.
pub trait Mapper: Send + Sync {
    fn dto_to_domain(&self, dto: &Payload) -> Option<Payload>;
    fn domain_to_dto(&self, domain: &Payload) -> Option<Payload>;
}

type Convert<A, B> = Box<dyn Fn(&A) -> Option<B> + Send + Sync>;

/// [`Mapper`] built from a pair of typed conversion functions.
pub struct FnMapper<Domain, Dto> {
    to_dto: Convert<Domain, Dto>,
    to_domain: Convert<Dto, Domain>,
}

impl<Domain, Dto> FnMapper<Domain, Dto>
where
    Domain: TypeTagged,
    Dto: TypeTagged,
{
    pub fn new(
        to_dto: impl Fn(&Domain) -> Option<Dto> + Send + Sync + 'static,
        to_domain: impl Fn(&Dto) -> Option<Domain> + Send + Sync + 'static,
    ) -> Self {
        Self {
            to_dto: Box::new(to_dto),
            to_domain: Box::new(to_domain),
        }
    }
}

impl<Domain, Dto> Mapper for FnMapper<Domain, Dto>
where
    Domain: TypeTagged,
    Dto: TypeTagged,
{
    fn dto_to_domain(&self, dto: &Payload) -> Option<Payload> {
        let dto = dto.downcast_ref::<Dto>()?;
        (self.to_domain)(dto).map(|domain| Arc::new(domain) as Payload)
    }

    fn domain_to_dto(&self, domain: &Payload) -> Option<Payload> {
        let domain = domain.downcast_ref::<Domain>()?;
        (self.to_dto)(domain).map(|dto| Arc::new(dto) as Payload)
    }
}

/// Resolves mappers by tag.
pub trait MapperFactory: Send + Sync {
    /// Fails with [`BusError::UnregisteredMapper`] when no mapper is known.
    fn get_mapper(&self, mapper: TypeTag, dto: TypeTag, domain: TypeTag) -> Result<Arc<dyn Mapper>>;
}

/// Table of mappers keyed by mapper tag.
#[derive(Clone, Default)]
pub struct MapperTable {
    mappers: HashMap<TypeTag, Arc<dyn Mapper>>,
}

impl MapperTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapper, builder style.
    pub fn with(mut self, tag: TypeTag, mapper: impl Mapper + 'static) -> Self {
        self.insert(tag, Arc::new(mapper));
        self
    }

    pub fn insert(&mut self, tag: TypeTag, mapper: Arc<dyn Mapper>) {
        debug!(mapper = %tag, "Registered mapper");
        self.mappers.insert(tag, mapper);
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

impl MapperFactory for MapperTable {
    fn get_mapper(&self, mapper: TypeTag, dto: TypeTag, domain: TypeTag) -> Result<Arc<dyn Mapper>> {
        self.mappers
            .get(&mapper)
            .cloned()
            .ok_or(BusError::UnregisteredMapper {
                mapper,
                dto,
                domain,
            })
    }
}
