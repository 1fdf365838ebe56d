//! Instructions
//!
//! One step of a rollout: a mutation sent to the remote side, paired with the
//! condition that tells the orchestrator the controller has caught up with it.
//! Completion predicates only ever see a single event, so every condition must be
//! checkable from one snapshot.

pub mod retry;

pub use retry::{retry_on_conflict, RetryPolicy};

use crate::client::{ClientError, PropagationPolicy, ResourceClient};
use crate::resource::{
    ChangeEvent, ChangeKind, MalformedEvent, ResourceDefinition, ResourceHandle, ResourceStatus,
};
use slog::{debug, Logger};

/// Failure of an instruction's mutation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Every allowed attempt hit a write conflict
    #[error("gave up after {attempts} conflicting writes: {last}")]
    RetriesExhausted { attempts: u32, last: ClientError },
}

/// Failure while evaluating a completion predicate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    #[error("cannot evaluate event: {0}")]
    MalformedEvent(#[from] MalformedEvent),
}

/// Everything an instruction may use while applying its mutation
pub struct ApplyContext<'a> {
    pub handle: &'a ResourceHandle,
    pub definition: &'a ResourceDefinition,
    pub client: &'a dyn ResourceClient,
    pub retry: &'a RetryPolicy,
    pub logger: &'a Logger,
}

/// A single rollout step
#[async_trait::async_trait]
pub trait Instruction: Send + Sync {
    /// Short label used in logs and errors
    fn name(&self) -> String;

    /// Send this step's mutation to the remote side
    async fn apply(&self, ctx: &ApplyContext<'_>) -> Result<(), ApplyError>;

    /// Whether `event` shows the mutation has taken effect
    fn is_done(&self, event: &ChangeEvent) -> Result<bool, PredicateError>;
}

/// Create the resource and wait until the controller reports it available
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Create;

#[async_trait::async_trait]
impl Instruction for Create {
    fn name(&self) -> String {
        "Create".to_string()
    }

    async fn apply(&self, ctx: &ApplyContext<'_>) -> Result<(), ApplyError> {
        let created = ctx.client.create(ctx.definition).await?;
        debug!(ctx.logger, "Create accepted"; "version" => %created.version);
        Ok(())
    }

    fn is_done(&self, event: &ChangeEvent) -> Result<bool, PredicateError> {
        event.ensure_well_formed()?;
        Ok(event.snapshot.status == ResourceStatus::Available)
    }
}

/// Set the desired replica count and wait until the change is observed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScaleReplicas {
    pub replicas: u32,
}

impl ScaleReplicas {
    pub fn new(replicas: u32) -> Self {
        Self { replicas }
    }
}

#[async_trait::async_trait]
impl Instruction for ScaleReplicas {
    fn name(&self) -> String {
        format!("ScaleReplicas({})", self.replicas)
    }

    async fn apply(&self, ctx: &ApplyContext<'_>) -> Result<(), ApplyError> {
        let client = ctx.client;
        let handle = ctx.handle;
        let replicas = self.replicas;

        // Each attempt re-reads so a conflict is resolved against the latest version
        let updated = retry_on_conflict(ctx.retry, ctx.logger, move || async move {
            let current = client.get(handle).await?;
            client.update(&current.with_replicas(replicas)).await
        })
        .await?;

        debug!(ctx.logger, "Replica change accepted";
            "replicas" => replicas,
            "version" => %updated.version
        );
        Ok(())
    }

    fn is_done(&self, event: &ChangeEvent) -> Result<bool, PredicateError> {
        event.ensure_well_formed()?;
        Ok(event.snapshot.desired_replicas == Some(self.replicas))
    }
}

/// Delete the resource, collecting dependents in the background
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delete;

#[async_trait::async_trait]
impl Instruction for Delete {
    fn name(&self) -> String {
        "Delete".to_string()
    }

    async fn apply(&self, ctx: &ApplyContext<'_>) -> Result<(), ApplyError> {
        ctx.client
            .delete(ctx.handle, PropagationPolicy::Background)
            .await?;
        Ok(())
    }

    fn is_done(&self, event: &ChangeEvent) -> Result<bool, PredicateError> {
        event.ensure_well_formed()?;
        Ok(event.kind == ChangeKind::Deleted)
    }
}
