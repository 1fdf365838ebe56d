use crate::client::WatchError;
use crate::instruction::{ApplyError, PredicateError};
use crate::observer::ObserverError;
use crate::resource::InvalidResource;
use std::fmt;
use std::time::Duration;

/// Errors raised while building an [`Orchestrator`](super::Orchestrator)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid resource: {0}")]
    InvalidResource(#[from] InvalidResource),
}

/// Which half of an instruction was running when the run failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Sending the mutation
    Apply,
    /// Waiting for the completion predicate
    Wait,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Apply => write!(f, "apply"),
            Phase::Wait => write!(f, "wait"),
        }
    }
}

/// Root cause of a failed run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureKind {
    #[error("apply failed: {0}")]
    Apply(#[source] ApplyError),

    #[error("completion check failed: {0}")]
    Predicate(#[source] PredicateError),

    #[error("{0}")]
    Stream(#[source] ObserverError),

    /// The change stream could not be opened at all
    #[error("could not watch resource: {0}")]
    Subscribe(#[source] WatchError),

    #[error("run deadline of {0:?} elapsed")]
    Timeout(Duration),

    #[error("run cancelled")]
    Cancelled,
}

/// A failed run, naming the instruction and phase that failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("instruction {index} ({instruction}) failed during {phase}: {kind}")]
pub struct RunError {
    pub index: usize,
    pub instruction: String,
    pub phase: Phase,
    #[source]
    pub kind: FailureKind,
}

impl RunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout(_))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.kind, FailureKind::Stream(_))
    }
}
