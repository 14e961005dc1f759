//! Domain type registry.
//!
//! Projected payloads form an open type set: snapshots store entries as
//! `(type name, json)` pairs and resolve them back to concrete types at
//! restore time. The registry holds that mapping as a closure table - one
//! decoder per registered [`PayloadType`] - alongside the projector-name to
//! projector-version lookup used for snapshot compatibility checks.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use crate::event::{PayloadType, TagStatePayload};

type PayloadDecoder =
    Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn TagStatePayload>, serde_json::Error> + Send + Sync>;

/// Errors from resolving registered types.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No decoder is registered under this payload type name.
    #[error("unknown payload type `{0}`")]
    UnknownPayloadType(String),
    /// The payload json did not match the registered type's shape.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Registry of payload codecs and projector versions.
///
/// Build one per domain at startup, register every payload type a projector
/// can produce, and share it (typically via `Arc`) with the projection
/// hosts.
#[derive(Clone, Default)]
pub struct DomainTypeRegistry {
    payload_decoders: HashMap<&'static str, PayloadDecoder>,
    projector_versions: HashMap<String, String>,
}

impl DomainTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type under its `TYPE_NAME`.
    ///
    /// Re-registering the same name replaces the previous decoder.
    pub fn register_payload<T: PayloadType>(&mut self) {
        self.payload_decoders.insert(
            T::TYPE_NAME,
            Arc::new(|value| {
                let payload: T = serde_json::from_value(value.clone())?;
                Ok(Box::new(payload) as Box<dyn TagStatePayload>)
            }),
        );
    }

    /// Record the running version for a projector name.
    pub fn register_projector(&mut self, name: impl Into<String>, version: impl Into<String>) {
        self.projector_versions.insert(name.into(), version.into());
    }

    /// Decode a payload by registered type name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownPayloadType`] for unregistered names
    /// and [`RegistryError::Decode`] for shape mismatches.
    pub fn decode_payload(
        &self,
        type_name: &str,
        value: &serde_json::Value,
    ) -> Result<Box<dyn TagStatePayload>, RegistryError> {
        let decoder = self
            .payload_decoders
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownPayloadType(type_name.to_string()))?;
        decoder(value).map_err(RegistryError::Decode)
    }

    /// Look up the registered version for a projector name.
    #[must_use]
    pub fn projector_version(&self, name: &str) -> Option<&str> {
        self.projector_versions.get(name).map(String::as_str)
    }
}

impl std::fmt::Debug for DomainTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainTypeRegistry")
            .field(
                "payload_types",
                &self.payload_decoders.keys().collect::<Vec<_>>(),
            )
            .field("projector_versions", &self.projector_versions)
            .finish()
    }
}
