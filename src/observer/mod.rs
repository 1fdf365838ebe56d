//! Change Observer (Layer 1)
//!
//! Turns a raw watch session into a single ordered feed of [`ChangeEvent`]s for one
//! resource:
//! - notifications about other objects are filtered out
//! - `Updated` notifications that carry no new version token are suppressed
//! - events are handed over one at a time through a single-slot channel, so a slow
//!   consumer applies backpressure instead of losing events
//! - an abnormal end of the session is reported once through the error handler

use crate::client::{WatchError, WatchNotification, WatchSubscription};
use crate::resource::{ChangeEvent, ResourceHandle, ResourceSnapshot};
use slog::{debug, error, o, Logger};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Failure reported by a [`ChangeObserver`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    /// The watch session ended without being cancelled
    #[error("change stream for '{resource}' stopped: {source}")]
    Stream {
        resource: String,
        #[source]
        source: WatchError,
    },
}

/// Callback invoked at most once when the watch session fails
pub type ErrorHandler = Box<dyn FnOnce(ObserverError) + Send>;

/// How an observer's run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObserverExit {
    /// The cancellation scope ended
    Cancelled,
    /// The consumer dropped its end of the feed
    ConsumerGone,
    /// The watch session failed; the error handler has been called
    Failed(ObserverError),
}

/// Summary of one observer run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserverReport {
    pub delivered: usize,
    pub suppressed: usize,
    pub exit: ObserverExit,
}

/// Consumer end of an observer's event feed
pub struct EventFeed {
    rx: mpsc::Receiver<ChangeEvent>,
}

impl EventFeed {
    /// Take the next event; `None` once the observer has stopped
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

/// Single-producer observer for one named resource
pub struct ChangeObserver {
    handle: ResourceHandle,
    subscription: Box<dyn WatchSubscription>,
    tx: mpsc::Sender<ChangeEvent>,

    /// Last snapshot seen for this resource; only read here
    last_seen: Option<ResourceSnapshot>,

    on_error: Option<ErrorHandler>,
    debug: bool,
    delivered: usize,
    suppressed: usize,
    logger: Logger,
}

impl ChangeObserver {
    /// Create an observer over `subscription` and the feed it produces into
    pub fn new(
        handle: ResourceHandle,
        subscription: Box<dyn WatchSubscription>,
        logger: Logger,
    ) -> (Self, EventFeed) {
        // One slot: the producer waits until the previous event has been taken
        let (tx, rx) = mpsc::channel(1);
        let logger = logger.new(o!("component" => "observer", "resource" => handle.to_string()));

        let observer = Self {
            handle,
            subscription,
            tx,
            last_seen: None,
            on_error: None,
            debug: false,
            delivered: 0,
            suppressed: 0,
            logger,
        };

        (observer, EventFeed { rx })
    }

    /// Register the handler called if the session stops unexpectedly
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(ObserverError) + Send + 'static,
    {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Log a diff between consecutive observations
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Consume the session until `cancel` fires, the consumer goes away or the session fails
    ///
    /// Meant to be spawned on its own task; it is the only producer into the feed.
    pub async fn run(mut self, cancel: CancellationToken) -> ObserverReport {
        debug!(self.logger, "Observer started");

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break ObserverExit::Cancelled,
                next = self.subscription.next() => next,
            };

            let notification = match next {
                Ok(notification) => notification,
                Err(source) => {
                    let err = ObserverError::Stream {
                        resource: self.handle.to_string(),
                        source,
                    };
                    error!(self.logger, "Change stream stopped unexpectedly"; "error" => %err);
                    if let Some(handler) = self.on_error.take() {
                        handler(err.clone());
                    }
                    break ObserverExit::Failed(err);
                }
            };

            let Some(event) = self.normalize(notification) else {
                continue;
            };

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break ObserverExit::Cancelled,
                sent = self.tx.send(event) => sent,
            };
            if sent.is_err() {
                break ObserverExit::ConsumerGone;
            }
            self.delivered += 1;
        };

        debug!(self.logger, "Observer stopped";
            "exit" => ?exit,
            "delivered" => self.delivered,
            "suppressed" => self.suppressed
        );

        // Dropping self closes the feed, releasing a consumer still waiting on it
        ObserverReport {
            delivered: self.delivered,
            suppressed: self.suppressed,
            exit,
        }
    }

    fn normalize(&mut self, notification: WatchNotification) -> Option<ChangeEvent> {
        if !self.handle.matches(notification.latest()) {
            return None;
        }

        match notification {
            WatchNotification::Added(snapshot) => Some(ChangeEvent::added(self.observe(snapshot))),
            WatchNotification::Updated { old, new } => self.on_update(old, new),
            WatchNotification::Deleted(snapshot) => {
                Some(ChangeEvent::deleted(self.observe(snapshot)))
            }
        }
    }

    fn on_update(&mut self, old: ResourceSnapshot, new: ResourceSnapshot) -> Option<ChangeEvent> {
        let previous = self.last_seen.as_ref().unwrap_or(&old);

        if new.version == previous.version || new.version == old.version {
            self.suppressed += 1;
            debug!(self.logger, "Version unchanged, dropping update"; "version" => %new.version);
            return None;
        }

        Some(ChangeEvent::updated(self.observe(new)))
    }

    fn observe(&mut self, snapshot: ResourceSnapshot) -> ResourceSnapshot {
        if self.debug {
            match &self.last_seen {
                Some(previous) => debug!(self.logger, "Observed change";
                    "version" => %snapshot.version,
                    "changed" => snapshot.changed_fields(previous).join(","),
                    "diff" => snapshot.diff_from(previous)
                ),
                None => debug!(self.logger, "Observed initial state";
                    "version" => %snapshot.version,
                    "status" => %snapshot.status,
                    "replicas" => ?snapshot.desired_replicas
                ),
            }
        }
        self.last_seen = Some(snapshot.clone());
        snapshot
    }
}
