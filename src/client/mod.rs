//! Remote collaborators (Layer 0)
//!
//! Protocol-agnostic interfaces to the system that stores the resource:
//! - [`ResourceClient`]: create / get / update / delete calls
//! - [`WatchClient`]: change-notification subscriptions for a resource kind
//!
//! [`InMemoryCluster`] implements both for local runs and tests; [`ScriptedWatchClient`]
//! replays hand-written notification sequences.

pub mod memory;
pub mod scripted;
pub mod watch;

pub use memory::{ClientCall, InMemoryCluster, ReconcilerHandle};
pub use scripted::{ScriptedWatchClient, WatchScript};
pub use watch::{WatchClient, WatchError, WatchNotification, WatchSubscription};

use crate::resource::{ResourceDefinition, ResourceHandle, ResourceSnapshot, VersionToken};
use std::fmt;

/// How dependents of a deleted object are cleaned up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Delete the object now, let the controller collect dependents afterwards
    Background,
}

impl fmt::Display for PropagationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropagationPolicy::Background => f.write_str("Background"),
        }
    }
}

/// Errors returned by a [`ResourceClient`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The write carried a stale version token
    #[error("operation cannot be fulfilled on '{name}': the object has been modified (sent version {sent}, current version {current})")]
    Conflict {
        name: String,
        sent: VersionToken,
        current: VersionToken,
    },

    #[error("resource '{0}' not found")]
    NotFound(String),

    #[error("resource '{0}' already exists")]
    AlreadyExists(String),

    /// The remote side refused the request as invalid
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The request never got a definitive answer
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Conflicts are the only errors worth retrying with a fresh read
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict { .. })
    }
}

/// Remote write client for one resource kind
///
/// Implementations must reject an `update` whose snapshot version is not the
/// current one with [`ClientError::Conflict`].
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create the object described by `definition`
    async fn create(&self, definition: &ResourceDefinition) -> Result<ResourceSnapshot, ClientError>;

    /// Read the current state of the object
    async fn get(&self, handle: &ResourceHandle) -> Result<ResourceSnapshot, ClientError>;

    /// Replace the object's desired state, guarded by `snapshot.version`
    async fn update(&self, snapshot: &ResourceSnapshot) -> Result<ResourceSnapshot, ClientError>;

    /// Delete the object
    async fn delete(
        &self,
        handle: &ResourceHandle,
        propagation: PropagationPolicy,
    ) -> Result<(), ClientError>;
}
