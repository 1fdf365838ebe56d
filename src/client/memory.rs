//! In-memory cluster (Layer 0, testing)
//!
//! Stores objects in process, stamps every write with a fresh version token and
//! fans notifications out to watch sessions over a broadcast channel. An optional
//! reconciler task plays the part of the remote controller so whole rollouts can
//! run without a real cluster.

use crate::client::{
    ClientError, PropagationPolicy, ResourceClient, WatchClient, WatchError, WatchNotification,
    WatchSubscription,
};
use crate::resource::{
    ResourceDefinition, ResourceHandle, ResourceSnapshot, ResourceStatus, VersionToken,
};
use slog::{debug, info, o, Logger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

type NotificationResult = Result<WatchNotification, WatchError>;

/// A call received by the in-memory cluster, in arrival order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientCall {
    Create { name: String },
    Get { name: String },
    Update { name: String, version: VersionToken },
    Delete { name: String, propagation: PropagationPolicy },
}

struct ClusterState {
    objects: HashMap<ResourceHandle, StoredObject>,
    calls: Vec<ClientCall>,
}

struct StoredObject {
    definition: ResourceDefinition,
    snapshot: ResourceSnapshot,
}

struct Inner {
    state: Mutex<ClusterState>,

    /// Last version token handed out; tokens are cluster-wide like resource versions
    version: AtomicU64,

    /// Number of upcoming updates to reject as if another writer got there first
    pending_conflicts: AtomicU32,

    /// Watch fan-out; errors are injected here too
    watch_tx: broadcast::Sender<NotificationResult>,

    logger: Logger,
}

/// In-memory stand-in for a remote cluster
///
/// Cheap to clone; all clones share the same objects and watch sessions.
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<Inner>,
}

impl InMemoryCluster {
    /// Create an empty cluster
    pub fn new(logger: Logger) -> Self {
        let (watch_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ClusterState {
                    objects: HashMap::new(),
                    calls: Vec::new(),
                }),
                version: AtomicU64::new(0),
                pending_conflicts: AtomicU32::new(0),
                watch_tx,
                logger: logger.new(o!("component" => "in-memory-cluster")),
            }),
        }
    }

    /// Reject the next `count` updates with a conflict
    ///
    /// Each rejected update also bumps the stored version, as a concurrent writer would.
    pub fn fail_next_updates_with_conflict(&self, count: u32) {
        self.inner.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Terminate every open watch session with `error`
    pub fn close_watches(&self, error: WatchError) {
        let _ = self.inner.watch_tx.send(Err(error));
    }

    /// Calls received so far
    pub async fn calls(&self) -> Vec<ClientCall> {
        self.inner.state.lock().await.calls.clone()
    }

    /// Number of delete calls received so far
    pub async fn delete_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| matches!(call, ClientCall::Delete { .. }))
            .count()
    }

    /// Current stored state of an object, if it exists
    pub async fn snapshot(&self, handle: &ResourceHandle) -> Option<ResourceSnapshot> {
        let state = self.inner.state.lock().await;
        state.objects.get(handle).map(|object| object.snapshot.clone())
    }

    /// Definition an object was created from, if it exists
    pub async fn definition(&self, handle: &ResourceHandle) -> Option<ResourceDefinition> {
        let state = self.inner.state.lock().await;
        state.objects.get(handle).map(|object| object.definition.clone())
    }

    /// Start a reconciler that drives objects towards their desired state
    ///
    /// Created objects become `Available` and replica changes are acknowledged
    /// after `delay`. Each step is reported through the watch sessions.
    pub fn spawn_reconciler(&self, delay: Duration) -> ReconcilerHandle {
        let cluster = self.clone();
        let mut rx = self.inner.watch_tx.subscribe();
        let logger = self.inner.logger.new(o!("task" => "reconciler"));

        let task = tokio::spawn(async move {
            info!(logger, "Reconciler started"; "delay_ms" => delay.as_millis() as u64);
            loop {
                let notification = match rx.recv().await {
                    Ok(Ok(notification)) => notification,
                    Ok(Err(_)) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match notification {
                    WatchNotification::Added(snapshot)
                        if snapshot.status == ResourceStatus::Creating =>
                    {
                        tokio::time::sleep(delay).await;
                        cluster
                            .reconcile(&snapshot, ResourceStatus::Available, "all replicas ready")
                            .await;
                    }
                    WatchNotification::Updated { old, new }
                        if old.desired_replicas != new.desired_replicas =>
                    {
                        tokio::time::sleep(delay).await;
                        let description = match new.desired_replicas {
                            Some(n) => format!("scaled to {} replicas", n),
                            None => "replica count cleared".to_string(),
                        };
                        cluster
                            .reconcile(&new, ResourceStatus::Available, &description)
                            .await;
                    }
                    _ => {}
                }
            }
            debug!(logger, "Reconciler stopped");
        });

        ReconcilerHandle { task }
    }

    /// Write controller-owned status fields and notify watchers
    async fn reconcile(&self, observed: &ResourceSnapshot, status: ResourceStatus, description: &str) {
        let handle = match ResourceHandle::new(Some(&observed.namespace), &observed.name) {
            Ok(handle) => handle,
            Err(_) => return,
        };

        let mut state = self.inner.state.lock().await;
        let Some(object) = state.objects.get_mut(&handle) else {
            // Deleted while we were waiting
            return;
        };

        let old = object.snapshot.clone();
        object.snapshot = ResourceSnapshot {
            status,
            description: description.to_string(),
            version: self.next_version(),
            ..old.clone()
        };
        let new = object.snapshot.clone();
        drop(state);

        debug!(self.inner.logger, "Reconciled";
            "resource" => %handle,
            "status" => %new.status,
            "version" => %new.version
        );
        self.publish(WatchNotification::Updated { old, new });
    }

    fn next_version(&self) -> VersionToken {
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        VersionToken::new(version.to_string())
    }

    fn publish(&self, notification: WatchNotification) {
        // No subscribers is fine
        let _ = self.inner.watch_tx.send(Ok(notification));
    }

    fn take_pending_conflict(&self) -> bool {
        self.inner
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl ResourceClient for InMemoryCluster {
    async fn create(&self, definition: &ResourceDefinition) -> Result<ResourceSnapshot, ClientError> {
        let handle = definition
            .handle()
            .map_err(|e| ClientError::Rejected(e.to_string()))?;

        let mut state = self.inner.state.lock().await;
        state.calls.push(ClientCall::Create {
            name: handle.name().to_string(),
        });

        if state.objects.contains_key(&handle) {
            return Err(ClientError::AlreadyExists(handle.to_string()));
        }

        let mut snapshot = ResourceSnapshot::new(&handle)
            .with_status(ResourceStatus::Creating)
            .with_description("waiting for controller");
        snapshot.desired_replicas = definition.replicas();
        snapshot.version = self.next_version();

        state.objects.insert(
            handle.clone(),
            StoredObject {
                definition: definition.clone(),
                snapshot: snapshot.clone(),
            },
        );
        drop(state);

        debug!(self.inner.logger, "Created"; "resource" => %handle, "version" => %snapshot.version);
        self.publish(WatchNotification::Added(snapshot.clone()));
        Ok(snapshot)
    }

    async fn get(&self, handle: &ResourceHandle) -> Result<ResourceSnapshot, ClientError> {
        let mut state = self.inner.state.lock().await;
        state.calls.push(ClientCall::Get {
            name: handle.name().to_string(),
        });

        state
            .objects
            .get(handle)
            .map(|object| object.snapshot.clone())
            .ok_or_else(|| ClientError::NotFound(handle.to_string()))
    }

    async fn update(&self, snapshot: &ResourceSnapshot) -> Result<ResourceSnapshot, ClientError> {
        let handle = ResourceHandle::new(Some(&snapshot.namespace), &snapshot.name)
            .map_err(|e| ClientError::Rejected(e.to_string()))?;

        let mut state = self.inner.state.lock().await;
        state.calls.push(ClientCall::Update {
            name: handle.name().to_string(),
            version: snapshot.version.clone(),
        });

        if !state.objects.contains_key(&handle) {
            return Err(ClientError::NotFound(handle.to_string()));
        }

        if self.take_pending_conflict() {
            // Someone else wrote first; the stored version moves on
            let version = self.next_version();
            if let Some(object) = state.objects.get_mut(&handle) {
                let old = object.snapshot.clone();
                object.snapshot.version = version.clone();
                let new = object.snapshot.clone();
                drop(state);
                self.publish(WatchNotification::Updated { old, new });
            }
            return Err(ClientError::Conflict {
                name: handle.name().to_string(),
                sent: snapshot.version.clone(),
                current: version,
            });
        }

        let version = self.next_version();
        let Some(object) = state.objects.get_mut(&handle) else {
            return Err(ClientError::NotFound(handle.to_string()));
        };

        if object.snapshot.version != snapshot.version {
            return Err(ClientError::Conflict {
                name: handle.name().to_string(),
                sent: snapshot.version.clone(),
                current: object.snapshot.version.clone(),
            });
        }

        // Only the desired state is writable; status belongs to the controller
        let old = object.snapshot.clone();
        object.snapshot.desired_replicas = snapshot.desired_replicas;
        object.snapshot.version = version;
        if let (Some(replicas), Some(spec)) = (
            snapshot.desired_replicas,
            object.definition.spec.as_object_mut(),
        ) {
            spec.insert("replicas".to_string(), serde_json::Value::from(replicas));
        }
        let new = object.snapshot.clone();
        drop(state);

        debug!(self.inner.logger, "Updated";
            "resource" => %handle,
            "replicas" => ?new.desired_replicas,
            "version" => %new.version
        );
        self.publish(WatchNotification::Updated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    async fn delete(
        &self,
        handle: &ResourceHandle,
        propagation: PropagationPolicy,
    ) -> Result<(), ClientError> {
        let mut state = self.inner.state.lock().await;
        state.calls.push(ClientCall::Delete {
            name: handle.name().to_string(),
            propagation,
        });

        let Some(object) = state.objects.remove(handle) else {
            return Err(ClientError::NotFound(handle.to_string()));
        };
        drop(state);

        let mut snapshot = object.snapshot;
        snapshot.version = self.next_version();

        debug!(self.inner.logger, "Deleted";
            "resource" => %handle,
            "propagation" => %propagation
        );
        self.publish(WatchNotification::Deleted(snapshot));
        Ok(())
    }
}

#[async_trait::async_trait]
impl WatchClient for InMemoryCluster {
    async fn subscribe(
        &self,
        _handle: &ResourceHandle,
    ) -> Result<Box<dyn WatchSubscription>, WatchError> {
        Ok(Box::new(InMemoryWatch {
            rx: self.inner.watch_tx.subscribe(),
        }))
    }
}

/// Watch session over the cluster's broadcast channel
struct InMemoryWatch {
    rx: broadcast::Receiver<NotificationResult>,
}

#[async_trait::async_trait]
impl WatchSubscription for InMemoryWatch {
    async fn next(&mut self) -> Result<WatchNotification, WatchError> {
        match self.rx.recv().await {
            Ok(result) => result,
            Err(broadcast::error::RecvError::Lagged(missed)) => Err(WatchError::Lagged(missed)),
            Err(broadcast::error::RecvError::Closed) => Err(WatchError::Closed),
        }
    }
}

/// Running reconciler task; stopped on drop
pub struct ReconcilerHandle {
    task: JoinHandle<()>,
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
