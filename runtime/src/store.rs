//! Storage and serialization capabilities.
//!
//! Neither has a built-in default in the runtime manager: both must be present
//! in the merged resource registry.

use serde_json::Value;

use crate::RuntimeFut;
use crate::error::RuntimeError;

/// Blob store used for per-process storage locations and uploaded assemblies.
pub trait StoreProvider: Send + Sync {
    fn id(&self) -> &str;

    /// A fresh directory path no other process has been given.
    fn create_unique_directory_path(&self) -> String;

    /// A fresh container name no other process has been given.
    fn create_unique_container_name(&self) -> String;

    fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> RuntimeFut<'a, Result<(), RuntimeError>>;

    fn get<'a>(&'a self, path: &'a str) -> RuntimeFut<'a, Result<Option<Vec<u8>>, RuntimeError>>;
}

pub trait Serializer: Send + Sync {
    fn id(&self) -> &str;
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, RuntimeError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, RuntimeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn id(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, RuntimeError> {
        serde_json::to_vec(value).map_err(|e| RuntimeError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, RuntimeError> {
        serde_json::from_slice(bytes).map_err(|e| RuntimeError::Serialization(e.to_string()))
    }
}
