//! Resource definitions loaded from YAML or JSON manifests

use crate::resource::{InvalidResource, ResourceHandle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Errors that can occur while loading a resource definition
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse resource definition: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Object metadata carried by a manifest
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Desired specification of the resource, as handed to the remote `create` call
///
/// Only `metadata` and `spec.replicas` are interpreted locally; the rest of `spec`
/// is passed through to the controller untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: serde_json::Value,
}

impl ResourceDefinition {
    /// Minimal definition with an empty spec
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: None,
            kind: None,
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
            },
            spec: serde_json::Value::Object(Default::default()),
        }
    }

    /// Parse a manifest; YAML is accepted, and so is JSON since it is a YAML subset
    pub fn from_slice(raw: &[u8]) -> Result<Self, DefinitionError> {
        Ok(serde_yaml::from_slice(raw)?)
    }

    /// Read and parse a manifest file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&raw)
    }

    /// Handle for the object this definition describes
    pub fn handle(&self) -> Result<ResourceHandle, InvalidResource> {
        ResourceHandle::new(self.metadata.namespace.as_deref(), &self.metadata.name)
    }

    /// `spec.replicas`, if present and representable
    pub fn replicas(&self) -> Option<u32> {
        self.spec
            .get("replicas")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    /// Override the namespace (e.g. from the command line)
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = Some(namespace.into());
        self
    }
}
