//! Scripted watch sessions for tests
//!
//! The test holds a [`WatchScript`] and pushes notifications (or a failure) by hand;
//! the orchestrator under test subscribes through [`ScriptedWatchClient`].

use crate::client::{WatchClient, WatchError, WatchNotification, WatchSubscription};
use crate::resource::{ResourceHandle, ResourceSnapshot};
use tokio::sync::{mpsc, Mutex};

/// Sending half of a scripted watch session
#[derive(Clone)]
pub struct WatchScript {
    tx: mpsc::UnboundedSender<Result<WatchNotification, WatchError>>,
}

impl WatchScript {
    /// Queue a raw notification; returns false once the session is gone
    pub fn push(&self, notification: WatchNotification) -> bool {
        self.tx.send(Ok(notification)).is_ok()
    }

    pub fn added(&self, snapshot: ResourceSnapshot) -> bool {
        self.push(WatchNotification::Added(snapshot))
    }

    pub fn updated(&self, old: ResourceSnapshot, new: ResourceSnapshot) -> bool {
        self.push(WatchNotification::Updated { old, new })
    }

    pub fn deleted(&self, snapshot: ResourceSnapshot) -> bool {
        self.push(WatchNotification::Deleted(snapshot))
    }

    /// Terminate the session abnormally
    pub fn fail(&self, error: WatchError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }
}

/// Watch client handing out a single scripted session
pub struct ScriptedWatchClient {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<WatchNotification, WatchError>>>>,
}

impl ScriptedWatchClient {
    pub fn new() -> (WatchScript, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            WatchScript { tx },
            Self {
                rx: Mutex::new(Some(rx)),
            },
        )
    }
}

#[async_trait::async_trait]
impl WatchClient for ScriptedWatchClient {
    async fn subscribe(
        &self,
        _handle: &ResourceHandle,
    ) -> Result<Box<dyn WatchSubscription>, WatchError> {
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| WatchError::Session("scripted session already taken".to_string()))?;
        Ok(Box::new(ScriptedSubscription { rx }))
    }
}

struct ScriptedSubscription {
    rx: mpsc::UnboundedReceiver<Result<WatchNotification, WatchError>>,
}

#[async_trait::async_trait]
impl WatchSubscription for ScriptedSubscription {
    async fn next(&mut self) -> Result<WatchNotification, WatchError> {
        // Every script sender dropped means the session hung up
        self.rx.recv().await.unwrap_or(Err(WatchError::Closed))
    }
}
