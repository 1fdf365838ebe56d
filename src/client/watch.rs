//! Change-notification subscriptions
//!
//! A watch session reports raw add/update/delete notifications for every object of
//! the resource kind it was opened against. Filtering, de-duplication and ordering
//! guarantees are layered on top by [`crate::observer::ChangeObserver`].

use crate::resource::{ResourceHandle, ResourceSnapshot};

/// Raw notification delivered by a watch session
#[derive(Clone, Debug, PartialEq)]
pub enum WatchNotification {
    Added(ResourceSnapshot),
    Updated {
        old: ResourceSnapshot,
        new: ResourceSnapshot,
    },
    Deleted(ResourceSnapshot),
}

impl WatchNotification {
    /// The most recent state carried by this notification
    pub fn latest(&self) -> &ResourceSnapshot {
        match self {
            WatchNotification::Added(snapshot) => snapshot,
            WatchNotification::Updated { new, .. } => new,
            WatchNotification::Deleted(snapshot) => snapshot,
        }
    }
}

/// Reasons a watch session stops
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// The session ended without being asked to
    #[error("watch session closed")]
    Closed,

    /// The session fell behind and notifications were lost
    #[error("watch session lagged behind by {0} notifications")]
    Lagged(u64),

    /// The remote side terminated the session
    #[error("watch session failed: {0}")]
    Session(String),
}

/// An open watch session
#[async_trait::async_trait]
pub trait WatchSubscription: Send {
    /// Wait for the next notification
    ///
    /// Any `Err` is terminal: the session must not be polled again.
    async fn next(&mut self) -> Result<WatchNotification, WatchError>;
}

/// Opens watch sessions
#[async_trait::async_trait]
pub trait WatchClient: Send + Sync {
    /// Subscribe to the kind `handle` belongs to
    ///
    /// The session may report other objects too; callers filter by handle.
    async fn subscribe(
        &self,
        handle: &ResourceHandle,
    ) -> Result<Box<dyn WatchSubscription>, WatchError>;
}
