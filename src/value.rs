use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ValueError;

/// A serialized task result.
///
/// Values cross thread and process boundaries, so every result is kept in its
/// encoded CBOR form. Equality is byte equality: a value read by a dependent
/// task is bit-identical to what the producing task returned.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Value(Arc<[u8]>);

impl Value {
    /// Encodes any serializable item into a value.
    pub fn encode<T>(item: &T) -> Result<Self, ValueError>
    where
        T: Serialize + ?Sized,
    {
        let mut buffer = Vec::new();
        ciborium::into_writer(item, &mut buffer)?;
        Ok(Self(buffer.into()))
    }

    /// Decodes the value back into a concrete type.
    pub fn decode<T>(&self) -> Result<T, ValueError>
    where
        T: DeserializeOwned,
    {
        Ok(ciborium::from_reader(self.0.as_ref())?)
    }

    /// Wraps already encoded bytes, e.g. received from another process.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value({} bytes)", self.0.len())
    }
}
