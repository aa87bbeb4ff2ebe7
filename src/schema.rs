//! Payload schemas — the validation gate in front of every stream
//!
//! A `Schema` is a pure function: it accepts an arbitrary JSON payload and
//! either rejects it with a reason or returns the canonical payload that is
//! actually written to the stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Validator bound to a stream
pub trait Schema: Send + Sync {
    /// Schema name, used in logs and error messages
    fn name(&self) -> &str;

    /// Validate a candidate payload, returning the canonical form on success
    fn validate(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String>;
}

impl fmt::Debug for dyn Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("name", &self.name()).finish()
    }
}

/// A typed payload that can carry domain checks beyond its shape
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Reject values that deserialize but are not meaningful (e.g. zero price)
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Schema backed by a serde type
///
/// Validation deserializes into `T`, runs `T::check`, and re-serializes. The
/// round trip drops unknown fields and normalizes representation, so the
/// canonical payload is exactly what `T` describes.
pub struct TypedSchema<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Payload> TypedSchema<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T: Payload> Schema for TypedSchema<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String> {
        let value = T::deserialize(payload).map_err(|e| e.to_string())?;
        value.check()?;
        serde_json::to_value(&value).map_err(|e| e.to_string())
    }
}

/// Untyped schema requiring a set of top-level fields
///
/// Useful for ad-hoc streams and tests. The canonical payload is the input
/// unchanged.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    name: String,
    required_fields: Vec<String>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, required_fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            required_fields: required_fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }
}

impl Schema for FieldSchema {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String> {
        match payload {
            serde_json::Value::Object(map) => {
                if let Some(missing) = self.required_fields.iter().find(|f| !map.contains_key(*f)) {
                    return Err(format!("Missing required field '{}'", missing));
                }
                Ok(payload.clone())
            }
            _ if self.required_fields.is_empty() => Ok(payload.clone()),
            _ => Err("Payload must be a JSON object when schema has required fields".to_string()),
        }
    }
}
