//! Message codec
//!
//! Payloads cross the persistence and component-client boundaries as
//! `(type_tag, bytes)`. Type tags are stable across schema versions: a schema
//! may list legacy tags together with an upgrader that rewrites the old shape
//! into the current one.

use crate::{domain::step::JSON_VALUE_TYPE, CoreError, DataPacket};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An encoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedPayload {
    /// Stable type identity
    pub type_tag: String,

    /// Encoded bytes
    pub bytes: Vec<u8>,
}

impl EncodedPayload {
    /// Create an encoded payload
    pub fn new(type_tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            bytes,
        }
    }
}

/// Encodes and decodes typed payloads
pub trait MessageCodec: Send + Sync {
    /// Encode `value` under `type_tag`
    fn encode(&self, type_tag: &str, value: &DataPacket) -> Result<EncodedPayload, CoreError>;

    /// Decode `payload`, upgrading prior schema versions to `expected_type`
    fn decode(&self, payload: &EncodedPayload, expected_type: &str) -> Result<DataPacket, CoreError>;
}

/// Rewrites a legacy payload into the current shape
pub type Upgrader = Arc<dyn Fn(Value) -> Result<Value, CoreError> + Send + Sync>;

#[derive(Clone, Default)]
struct Schema {
    legacy: HashMap<String, Upgrader>,
}

/// JSON codec with a registry of versioned type tags.
///
/// `json.value` and unregistered expected types accept only an exact tag
/// match; registered types also accept their legacy tags.
#[derive(Clone, Default)]
pub struct JsonMessageCodec {
    schemas: HashMap<String, Schema>,
    aliases: HashMap<String, String>,
}

impl fmt::Debug for JsonMessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.schemas.keys().collect();
        types.sort();
        f.debug_struct("JsonMessageCodec").field("types", &types).finish()
    }
}

impl JsonMessageCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a current type tag
    pub fn register(mut self, type_tag: impl Into<String>) -> Self {
        self.schemas.entry(type_tag.into()).or_default();
        self
    }

    /// Register `legacy_tag` as a prior version of `type_tag`
    pub fn register_legacy<F>(
        mut self,
        type_tag: impl Into<String>,
        legacy_tag: impl Into<String>,
        upgrade: F,
    ) -> Self
    where
        F: Fn(Value) -> Result<Value, CoreError> + Send + Sync + 'static,
    {
        let type_tag = type_tag.into();
        let legacy_tag = legacy_tag.into();
        self.aliases.insert(legacy_tag.clone(), type_tag.clone());
        self.schemas
            .entry(type_tag)
            .or_default()
            .legacy
            .insert(legacy_tag, Arc::new(upgrade));
        self
    }

    /// Whether `type_tag` is known, as a current or legacy tag
    pub fn is_registered(&self, type_tag: &str) -> bool {
        type_tag == JSON_VALUE_TYPE
            || self.schemas.contains_key(type_tag)
            || self.aliases.contains_key(type_tag)
    }

    fn parse(payload: &EncodedPayload) -> Result<Value, CoreError> {
        serde_json::from_slice(&payload.bytes).map_err(|e| {
            CoreError::DecodeError(format!(
                "Malformed payload for type {}: {}",
                payload.type_tag, e
            ))
        })
    }
}

impl MessageCodec for JsonMessageCodec {
    fn encode(&self, type_tag: &str, value: &DataPacket) -> Result<EncodedPayload, CoreError> {
        if let Some(current) = self.aliases.get(type_tag) {
            return Err(CoreError::SerializationError(format!(
                "Cannot encode under legacy type {}; use {}",
                type_tag, current
            )));
        }

        let bytes = serde_json::to_vec(value.as_value())?;
        Ok(EncodedPayload::new(type_tag, bytes))
    }

    fn decode(&self, payload: &EncodedPayload, expected_type: &str) -> Result<DataPacket, CoreError> {
        if payload.type_tag == expected_type {
            return Self::parse(payload).map(DataPacket::new);
        }

        let upgrade = self
            .schemas
            .get(expected_type)
            .and_then(|schema| schema.legacy.get(&payload.type_tag))
            .ok_or_else(|| {
                CoreError::DecodeError(format!(
                    "Unknown type tag {} for expected type {}",
                    payload.type_tag, expected_type
                ))
            })?;

        let legacy = Self::parse(payload)?;
        let upgraded = upgrade(legacy).map_err(|e| {
            CoreError::DecodeError(format!(
                "Failed to upgrade {} to {}: {}",
                payload.type_tag, expected_type, e
            ))
        })?;

        Ok(DataPacket::new(upgraded))
    }
}
