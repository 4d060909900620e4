//! Event payloads.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::topology::Topology;

/// Closed tagged union carried by every [`Event`](crate::Event).
///
/// Object payloads are reference counted; [`Value::is_same_object`] compares
/// identity, not contents.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Empty,
    Int64(i64),
    Double(f64),
    Topology(Arc<Topology>),
    Unknown(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_topology(&self) -> Option<&Arc<Topology>> {
        match self {
            Value::Topology(topology) => Some(topology),
            _ => None,
        }
    }

    /// Downcast an opaque object payload.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::Unknown(object) => Arc::clone(object).downcast::<T>().ok(),
            _ => None,
        }
    }

    /// True when both values carry the very same object.
    pub fn is_same_object(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Topology(a), Value::Topology(b)) => Arc::ptr_eq(a, b),
            (Value::Unknown(a), Value::Unknown(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "Empty"),
            Value::Int64(v) => write!(f, "Int64({})", v),
            Value::Double(v) => write!(f, "Double({})", v),
            Value::Topology(t) => write!(f, "Topology({})", t.id()),
            Value::Unknown(_) => write!(f, "Unknown(..)"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<Arc<Topology>> for Value {
    fn from(topology: Arc<Topology>) -> Self {
        Value::Topology(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_accessors() {
        assert!(Value::default().is_empty());
        assert_eq!(Value::from(42i64).as_int64(), Some(42));
        assert_eq!(Value::from(1.5f64).as_double(), Some(1.5));
        assert_eq!(Value::Empty.as_int64(), None);
    }

    #[test]
    fn test_object_identity() {
        let topology = Arc::new(Topology::new());
        let a = Value::from(Arc::clone(&topology));
        let b = Value::from(Arc::clone(&topology));
        let c = Value::from(Arc::new(topology.as_ref().clone()));

        assert!(a.is_same_object(&b));
        assert!(!a.is_same_object(&c));
        assert!(!Value::Int64(1).is_same_object(&Value::Int64(1)));
    }

    #[test]
    fn test_downcast_unknown() {
        let value = Value::Unknown(Arc::new(String::from("payload")));
        assert_eq!(value.downcast::<String>().as_deref(), Some(&"payload".to_string()));
        assert!(value.downcast::<u32>().is_none());
    }
}
