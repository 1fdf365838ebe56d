//! Resource model
//!
//! Identity, observed state and change events for the remote object being rolled out.
//! Snapshots are immutable values: every observation replaces the previous one wholesale.

pub mod definition;

pub use definition::{DefinitionError, ResourceDefinition};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace used when a resource does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Errors raised while building a [`ResourceHandle`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidResource {
    /// The resource has no name
    #[error("resource cannot have an empty name")]
    EmptyName,
}

/// Identifies the remote object (namespace + name)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    namespace: String,
    name: String,
}

impl ResourceHandle {
    /// Build a handle, falling back to [`DEFAULT_NAMESPACE`] when `namespace` is empty.
    pub fn new(namespace: Option<&str>, name: &str) -> Result<Self, InvalidResource> {
        if name.trim().is_empty() {
            return Err(InvalidResource::EmptyName);
        }

        let namespace = match namespace {
            Some(ns) if !ns.trim().is_empty() => ns.to_string(),
            _ => DEFAULT_NAMESPACE.to_string(),
        };

        Ok(Self {
            namespace,
            name: name.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if `snapshot` describes the object this handle points at
    pub fn matches(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.name == self.name && snapshot.namespace == self.namespace
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque version token attached to every observed state
///
/// Tokens are only ever compared for equality; their ordering is owned by the remote side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Controller-reported state of the resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Accepted but not yet reconciled
    Creating,
    /// Reconciled and serving
    Available,
    /// The controller gave up reconciling
    Failed,
    /// No status reported yet
    #[default]
    Unknown,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Creating => "Creating",
            ResourceStatus::Available => "Available",
            ResourceStatus::Failed => "Failed",
            ResourceStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Full observed state of the resource at one point in time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub name: String,
    pub namespace: String,
    pub status: ResourceStatus,
    /// Desired replica count from the resource spec, if set
    pub desired_replicas: Option<u32>,
    pub version: VersionToken,
    /// Free-form status description from the controller
    pub description: String,
}

impl ResourceSnapshot {
    /// Fresh snapshot for `handle` with no status and no version
    pub fn new(handle: &ResourceHandle) -> Self {
        Self {
            name: handle.name().to_string(),
            namespace: handle.namespace().to_string(),
            status: ResourceStatus::Unknown,
            desired_replicas: None,
            version: VersionToken::default(),
            description: String::new(),
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.desired_replicas = Some(replicas);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = VersionToken::new(version);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Names of the fields that differ from `previous`
    ///
    /// Diagnostic only; control flow never looks at this.
    pub fn changed_fields(&self, previous: &ResourceSnapshot) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.name != previous.name || self.namespace != previous.namespace {
            changed.push("identity");
        }
        if self.status != previous.status {
            changed.push("status");
        }
        if self.desired_replicas != previous.desired_replicas {
            changed.push("desired_replicas");
        }
        if self.version != previous.version {
            changed.push("version");
        }
        if self.description != previous.description {
            changed.push("description");
        }
        changed
    }

    /// Unified diff between the pretty-printed JSON of `previous` and this snapshot
    ///
    /// Diagnostic only, like [`changed_fields`](Self::changed_fields).
    pub fn diff_from(&self, previous: &ResourceSnapshot) -> String {
        let render = |snapshot: &ResourceSnapshot| {
            serde_json::to_string_pretty(snapshot).unwrap_or_default() + "\n"
        };
        let before = render(previous);
        let after = render(self);
        diffy::create_patch(&before, &after).to_string()
    }
}

/// What happened to the resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A single normalized change notification, consumed exactly once
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub snapshot: ResourceSnapshot,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, snapshot: ResourceSnapshot) -> Self {
        Self { snapshot, kind }
    }

    pub fn added(snapshot: ResourceSnapshot) -> Self {
        Self::new(ChangeKind::Added, snapshot)
    }

    pub fn updated(snapshot: ResourceSnapshot) -> Self {
        Self::new(ChangeKind::Updated, snapshot)
    }

    pub fn deleted(snapshot: ResourceSnapshot) -> Self {
        Self::new(ChangeKind::Deleted, snapshot)
    }

    /// Reject events a completion predicate cannot reason about
    pub fn ensure_well_formed(&self) -> Result<(), MalformedEvent> {
        if self.snapshot.name.is_empty() {
            return Err(MalformedEvent::MissingName { kind: self.kind });
        }
        if self.snapshot.version.is_empty() {
            return Err(MalformedEvent::MissingVersion {
                kind: self.kind,
                name: self.snapshot.name.clone(),
            });
        }
        Ok(())
    }
}

/// Structural problems found in a [`ChangeEvent`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEvent {
    #[error("{kind} event carries a snapshot without a name")]
    MissingName { kind: ChangeKind },

    #[error("{kind} event for '{name}' carries no version token")]
    MissingVersion { kind: ChangeKind, name: String },
}
