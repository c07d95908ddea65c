use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

/// Scalar argument passed to a kernel by value.
///
/// Equality and hashing are by value. Floating point values compare by bit
/// pattern, so `NaN` equals itself and `0.0` differs from `-0.0`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Primitive {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Char(char),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl Primitive {
    fn key(&self) -> (u8, u64) {
        match *self {
            Primitive::Bool(v) => (0, v as u64),
            Primitive::Byte(v) => (1, v as u8 as u64),
            Primitive::Short(v) => (2, v as u16 as u64),
            Primitive::Char(v) => (3, v as u64),
            Primitive::Int(v) => (4, v as u32 as u64),
            Primitive::Long(v) => (5, v as u64),
            Primitive::Float(v) => (6, v.to_bits() as u64),
            Primitive::Double(v) => (7, v.to_bits()),
        }
    }

    /// Little-endian encoding handed to devices.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match *self {
            Primitive::Bool(v) => vec![v as u8],
            Primitive::Byte(v) => v.to_le_bytes().to_vec(),
            Primitive::Short(v) => v.to_le_bytes().to_vec(),
            Primitive::Char(v) => (v as u32).to_le_bytes().to_vec(),
            Primitive::Int(v) => v.to_le_bytes().to_vec(),
            Primitive::Long(v) => v.to_le_bytes().to_vec(),
            Primitive::Float(v) => v.to_le_bytes().to_vec(),
            Primitive::Double(v) => v.to_le_bytes().to_vec(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Primitive::Byte(v) => Some(v as i64),
            Primitive::Short(v) => Some(v as i64),
            Primitive::Int(v) => Some(v as i64),
            Primitive::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Primitive::Float(v) => Some(v as f64),
            Primitive::Double(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }
}

impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Primitive {}

impl Hash for Primitive {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Bool(v) => write!(f, "{v}"),
            Primitive::Byte(v) => write!(f, "{v}b"),
            Primitive::Short(v) => write!(f, "{v}s"),
            Primitive::Char(v) => write!(f, "'{v}'"),
            Primitive::Int(v) => write!(f, "{v}"),
            Primitive::Long(v) => write!(f, "{v}L"),
            Primitive::Float(v) => write!(f, "{v}f"),
            Primitive::Double(v) => write!(f, "{v}d"),
        }
    }
}

macro_rules! primitive_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Primitive {
            fn from(v: $ty) -> Self {
                Primitive::$variant(v)
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Primitive(Primitive::$variant(v))
            }
        })*
    };
}

primitive_from! {
    bool => Bool,
    i8 => Byte,
    i16 => Short,
    char => Char,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
}

/// Host-side array that tasks read and write.
///
/// Objects are shared through [`ObjectRef`] and identified by pointer, never by
/// contents: two buffers holding the same bytes are still two objects.
#[derive(Debug)]
pub struct HostBuffer {
    name: String,
    data: RwLock<Vec<u8>>,
}

pub type ObjectRef = Arc<HostBuffer>;

impl HostBuffer {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> ObjectRef {
        Arc::new(Self {
            name: name.into(),
            data: RwLock::new(data),
        })
    }

    pub fn zeroed(name: impl Into<String>, len: usize) -> ObjectRef {
        Self::new(name, vec![0; len])
    }

    pub fn from_f32(name: impl Into<String>, values: &[f32]) -> ObjectRef {
        Self::new(name, bytemuck::cast_slice(values).to_vec())
    }

    pub fn from_i32(name: impl Into<String>, values: &[i32]) -> ObjectRef {
        Self::new(name, bytemuck::cast_slice(values).to_vec())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.read()
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        self.read()
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// A task argument as captured by the front-end.
#[derive(Debug, Clone)]
pub enum Value {
    Primitive(Primitive),
    Object(ObjectRef),
}

impl Value {
    pub fn object(object: &ObjectRef) -> Self {
        Value::Object(Arc::clone(object))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Value::Primitive(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Primitive(a), Value::Primitive(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<Primitive> for Value {
    fn from(p: Primitive) -> Self {
        Value::Primitive(p)
    }
}

impl From<&ObjectRef> for Value {
    fn from(object: &ObjectRef) -> Self {
        Value::object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_compare_by_bits() {
        assert_eq!(Primitive::Float(f32::NAN), Primitive::Float(f32::NAN));
        assert_ne!(Primitive::Double(0.0), Primitive::Double(-0.0));
        assert_ne!(Primitive::Int(1), Primitive::Long(1));
    }

    #[test]
    fn objects_compare_by_identity() {
        let a = HostBuffer::from_f32("a", &[1.0, 2.0]);
        let b = HostBuffer::from_f32("b", &[1.0, 2.0]);
        assert_eq!(Value::object(&a), Value::object(&a));
        assert_ne!(Value::object(&a), Value::object(&b));
    }

    #[test]
    fn host_buffer_views() {
        let a = HostBuffer::from_f32("a", &[1.5, -2.0]);
        assert_eq!(a.len(), 8);
        assert_eq!(a.to_f32_vec(), vec![1.5, -2.0]);
    }
}
