pub mod client;
pub mod config;
pub mod instruction;
pub mod observer;
pub mod orchestrator;
pub mod resource;

pub use client::{
    ClientError, InMemoryCluster, PropagationPolicy, ResourceClient, ScriptedWatchClient,
    WatchClient, WatchError, WatchNotification, WatchScript, WatchSubscription,
};
pub use config::OrchestratorConfig;
pub use instruction::{
    ApplyContext, ApplyError, Create, Delete, Instruction, PredicateError, RetryPolicy,
    ScaleReplicas,
};
pub use observer::{ChangeObserver, EventFeed, ObserverError, ObserverExit, ObserverReport};
pub use orchestrator::{FailureKind, Orchestrator, OrchestratorError, Phase, RunError, RunState};
pub use resource::{
    ChangeEvent, ChangeKind, ResourceDefinition, ResourceHandle, ResourceSnapshot, ResourceStatus,
    VersionToken,
};
