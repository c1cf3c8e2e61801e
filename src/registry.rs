//! Subject and mapper registry.
//!
//! Applications declare which dto type travels on each subject
//! ([`SubjectRegistration`]) and how each dto type maps to a domain type
//! ([`MapRegistration`]). The [`Registry`] joins the two on the dto tag and is
//! immutable once built.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{BusError, Result};
use crate::types::TypeTag;

/// Declares the dto type carried on one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRegistration {
    pub subject: String,
    /// `None` for parameterless subjects.
    pub dto: Option<TypeTag>,
}

impl SubjectRegistration {
    pub fn typed(subject: impl Into<String>, dto: TypeTag) -> Self {
        Self {
            subject: subject.into(),
            dto: Some(dto),
        }
    }

    pub fn signal(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            dto: None,
        }
    }
}

/// Declares the domain type and mapper for one dto type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRegistration {
    pub domain: TypeTag,
    pub dto: TypeTag,
    pub mapper: TypeTag,
}

impl MapRegistration {
    pub fn new(domain: TypeTag, dto: TypeTag, mapper: TypeTag) -> Self {
        Self {
            domain,
            dto,
            mapper,
        }
    }
}

/// Subject registration joined with its map registration.
///
/// `dto`, `domain` and `mapper` are either all present or all absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectBinding {
    pub subject: String,
    pub dto: Option<TypeTag>,
    pub domain: Option<TypeTag>,
    pub mapper: Option<TypeTag>,
}

/// The typed half of a [`SubjectBinding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedBinding {
    pub dto: TypeTag,
    pub domain: TypeTag,
    pub mapper: TypeTag,
}

impl SubjectBinding {
    pub fn is_typed(&self) -> bool {
        self.dto.is_some() && self.domain.is_some() && self.mapper.is_some()
    }

    /// The dto/domain/mapper triple, or [`BusError::UntypedSubject`].
    pub fn typed(&self) -> Result<TypedBinding> {
        match (self.dto, self.domain, self.mapper) {
            (Some(dto), Some(domain), Some(mapper)) => Ok(TypedBinding {
                dto,
                domain,
                mapper,
            }),
            _ => Err(BusError::UntypedSubject(self.subject.clone())),
        }
    }

    /// Check that `domain` is the registered domain type of this subject.
    pub fn expect_domain(&self, domain: TypeTag) -> Result<TypedBinding> {
        let typed = self.typed()?;
        if typed.domain != domain {
            return Err(BusError::TypeMismatch {
                context: format!("subject:{}", self.subject),
                expected: typed.domain,
                actual: Some(domain),
            });
        }
        Ok(typed)
    }
}

/// Immutable subject → binding table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    bindings: HashMap<String, SubjectBinding>,
}

impl Registry {
    /// Build a registry in one call.
    pub fn register(
        subjects: impl IntoIterator<Item = SubjectRegistration>,
        maps: impl IntoIterator<Item = MapRegistration>,
    ) -> Result<Self> {
        let mut builder = RegistryBuilder::new();
        builder.register(subjects, maps)?;
        Ok(builder.build())
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Binding for `subject`, or [`BusError::UnregisteredSubject`].
    pub fn lookup(&self, subject: &str) -> Result<&SubjectBinding> {
        self.bindings
            .get(subject)
            .ok_or_else(|| BusError::UnregisteredSubject(subject.to_string()))
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.bindings.contains_key(subject)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

/// Accumulates registrations before freezing them into a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    subjects: Vec<SubjectRegistration>,
    maps: HashMap<TypeTag, MapRegistration>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch of registrations.
    ///
    /// Rejects a subject that is already registered and a map registration
    /// that conflicts with an earlier one for the same dto type. Nothing from
    /// the batch is kept when it is rejected.
    pub fn register(
        &mut self,
        subjects: impl IntoIterator<Item = SubjectRegistration>,
        maps: impl IntoIterator<Item = MapRegistration>,
    ) -> Result<&mut Self> {
        let subjects: Vec<_> = subjects.into_iter().collect();
        let mut new_maps: HashMap<TypeTag, MapRegistration> = HashMap::new();

        for map in maps {
            let existing = self
                .maps
                .get(&map.dto)
                .or_else(|| new_maps.get(&map.dto))
                .copied();
            match existing {
                Some(existing) if existing == map => {}
                Some(existing) => {
                    return Err(BusError::DuplicateRegistration(format!(
                        "dto:{} already maps to domain:{} mapper:{}",
                        map.dto, existing.domain, existing.mapper
                    )));
                }
                None => {
                    new_maps.insert(map.dto, map);
                }
            }
        }

        for (i, registration) in subjects.iter().enumerate() {
            let repeated = self
                .subjects
                .iter()
                .chain(&subjects[..i])
                .any(|s| s.subject == registration.subject);
            if repeated {
                return Err(BusError::DuplicateRegistration(format!(
                    "subject:{}",
                    registration.subject
                )));
            }
        }

        self.maps.extend(new_maps);
        self.subjects.extend(subjects);
        Ok(self)
    }

    /// Join subject registrations to map registrations on dto type.
    pub fn build(self) -> Registry {
        let maps = self.maps;
        let bindings: HashMap<_, _> = self
            .subjects
            .into_iter()
            .map(|registration| {
                let map = registration.dto.and_then(|dto| maps.get(&dto));
                if registration.dto.is_some() && map.is_none() {
                    debug!(
                        subject = %registration.subject,
                        "Subject has no map registration, domain operations will fail"
                    );
                }
                let binding = SubjectBinding {
                    dto: map.map(|m| m.dto),
                    domain: map.map(|m| m.domain),
                    mapper: map.map(|m| m.mapper),
                    subject: registration.subject.clone(),
                };
                (registration.subject, binding)
            })
            .collect();

        info!(
            subjects = bindings.len(),
            mappings = maps.len(),
            "Built subject registry"
        );

        Registry { bindings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{reading_registry, Reading, ReadingDto, Stranger, READING_MAPPER};
    use crate::types::TypeTagged;

    #[test]
    fn test_join_on_dto() {
        let registry = reading_registry(&["readings"], &["ping"]);

        let binding = registry.lookup("readings").unwrap();
        assert!(binding.is_typed());
        assert_eq!(binding.domain, Some(Reading::TYPE_TAG));
        assert_eq!(binding.mapper, Some(READING_MAPPER));

        let signal = registry.lookup("ping").unwrap();
        assert!(!signal.is_typed());
        assert_eq!(signal.dto, None);
    }

    #[test]
    fn test_unmatched_dto_leaves_binding_untyped() {
        let registry = Registry::register(
            vec![SubjectRegistration::typed("orphan", ReadingDto::TYPE_TAG)],
            Vec::new(),
        )
        .unwrap();

        let binding = registry.lookup("orphan").unwrap();
        assert_eq!(binding.dto, None);
        assert!(matches!(binding.typed(), Err(BusError::UntypedSubject(s)) if s == "orphan"));
    }

    #[test]
    fn test_lookup_unknown_subject() {
        let registry = reading_registry(&["readings"], &[]);
        assert!(matches!(
            registry.lookup("nope"),
            Err(BusError::UnregisteredSubject(s)) if s == "nope"
        ));
    }

    #[test]
    fn test_expect_domain_mismatch() {
        let registry = reading_registry(&["readings"], &[]);
        let binding = registry.lookup("readings").unwrap();

        assert!(binding.expect_domain(Reading::TYPE_TAG).is_ok());
        let err = binding.expect_domain(Stranger::TYPE_TAG).unwrap_err();
        assert_eq!(
            err.reason(),
            "type mismatch subject:readings expected:computer.bus.test.Reading got:computer.bus.test.Stranger"
        );
    }

    #[test]
    fn test_duplicate_subject_rejected() {
        let mut builder = Registry::builder();
        builder
            .register(vec![SubjectRegistration::signal("a")], Vec::new())
            .unwrap();

        let err = builder
            .register(
                vec![
                    SubjectRegistration::signal("b"),
                    SubjectRegistration::signal("a"),
                ],
                Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateRegistration(_)));

        // The rejected batch left no trace
        let registry = builder.build();
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains("b"));
    }

    #[test]
    fn test_duplicate_subject_within_batch_rejected() {
        let err = Registry::register(
            vec![
                SubjectRegistration::signal("twice"),
                SubjectRegistration::signal("twice"),
            ],
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BusError::DuplicateRegistration(_)));
    }

    #[test]
    fn test_conflicting_map_rejected() {
        let map = MapRegistration::new(Reading::TYPE_TAG, ReadingDto::TYPE_TAG, READING_MAPPER);
        let conflicting =
            MapRegistration::new(Stranger::TYPE_TAG, ReadingDto::TYPE_TAG, READING_MAPPER);

        // Identical repeats are harmless
        assert!(Registry::register(Vec::new(), vec![map, map]).is_ok());

        let err = Registry::register(Vec::new(), vec![map, conflicting]).unwrap_err();
        assert!(matches!(err, BusError::DuplicateRegistration(_)));
    }

    #[test]
    fn test_incremental_registration() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(
                vec![SubjectRegistration::typed("readings", ReadingDto::TYPE_TAG)],
                Vec::new(),
            )
            .unwrap()
            .register(
                Vec::new(),
                vec![MapRegistration::new(
                    Reading::TYPE_TAG,
                    ReadingDto::TYPE_TAG,
                    READING_MAPPER,
                )],
            )
            .unwrap();

        // Maps registered after the subject still join at build time
        let registry = builder.build();
        assert!(registry.lookup("readings").unwrap().is_typed());
    }
}
