//! Type tokens for values that cross the bus.
//!
//! Dto types, domain types and mappers are identified by application-chosen
//! [`TypeTag`]s rather than by runtime type identity. Values travel through
//! the untyped layers as [`Payload`]s and are downcast only at the typed
//! boundary.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::BusError;

/// Type-erased message value.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Stable identifier for a dto type, domain type or mapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(&'static str);

impl TypeTag {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A concrete type with a registered [`TypeTag`].
pub trait TypeTagged: Send + Sync + 'static {
    const TYPE_TAG: TypeTag;
}

/// Wrap a typed value as a [`Payload`].
pub fn erase<T: TypeTagged>(value: T) -> Payload {
    Arc::new(value)
}

/// Recover a typed value from a [`Payload`].
///
/// Fails with [`BusError::TypeMismatch`] when the payload holds some other type.
pub fn downcast<T: TypeTagged>(payload: Payload) -> Result<Arc<T>, BusError> {
    payload.downcast::<T>().map_err(|_| BusError::TypeMismatch {
        context: "payload downcast".to_string(),
        expected: T::TYPE_TAG,
        actual: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Celsius(f64);
    impl TypeTagged for Celsius {
        const TYPE_TAG: TypeTag = TypeTag::new("test.Celsius");
    }

    #[derive(Debug)]
    struct Kelvin;
    impl TypeTagged for Kelvin {
        const TYPE_TAG: TypeTag = TypeTag::new("test.Kelvin");
    }

    #[test]
    fn test_downcast_roundtrip() {
        let payload = erase(Celsius(21.5));
        let value = downcast::<Celsius>(payload).unwrap();
        assert_eq!(value.0, 21.5);
    }

    #[test]
    fn test_downcast_wrong_type_is_mismatch() {
        let payload = erase(Celsius(0.0));
        let err = downcast::<Kelvin>(payload).unwrap_err();
        assert!(matches!(err, BusError::TypeMismatch { expected, .. } if expected == Kelvin::TYPE_TAG));
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(Celsius::TYPE_TAG.to_string(), "test.Celsius");
    }
}
