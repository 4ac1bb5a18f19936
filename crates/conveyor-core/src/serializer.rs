//! Serializer contract for persistence boundaries.
//!
//! The in-memory engine never serializes payloads; this contract exists for
//! storage backends that do. The object-safe trait works at the
//! `serde_json::Value` level; [`SerializerExt`] adds the typed helpers.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Payload serializer consumed by persistence backends.
pub trait Serializer: Send + Sync {
    fn serialize_value(&self, value: &serde_json::Value) -> Result<Vec<u8>>;
    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Typed convenience layer over any [`Serializer`].
pub trait SerializerExt {
    fn to_vec<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn from_slice<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

impl<S: Serializer + ?Sized> SerializerExt for S {
    fn to_vec<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let value = serde_json::to_value(value)?;
        self.serialize_value(&value)
    }

    fn from_slice<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let value = self.deserialize_value(bytes)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// JSON serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_value(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
