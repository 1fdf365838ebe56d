//! Orchestrator (Layer 2)
//!
//! Runs instructions strictly in order against one resource. Each instruction's
//! mutation is sent, then the run blocks on the observer's feed until the
//! instruction's completion predicate accepts an event. The next mutation is never
//! sent before that happens.
//!
//! One deadline covers the whole run. Any failure (apply error, predicate error,
//! broken change stream, deadline, caller cancellation) aborts the run and triggers
//! a single best-effort delete of the resource under its own short timeout.

mod error;

pub use error::{FailureKind, OrchestratorError, Phase, RunError};

use crate::client::{PropagationPolicy, ResourceClient, WatchClient};
use crate::config::OrchestratorConfig;
use crate::instruction::{ApplyContext, Instruction};
use crate::observer::{ChangeObserver, EventFeed, ObserverError, ObserverReport};
use crate::resource::{ResourceDefinition, ResourceHandle};
use slog::{crit, debug, error, info, o, warn, Logger};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Progress of the orchestrator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    /// Instruction `index` is being applied or awaited
    Running { index: usize },
    Succeeded,
    /// The run stopped at instruction `index`
    Failed { index: usize },
}

/// Slot the observer's error handler writes into
type StreamFailure = Arc<Mutex<Option<ObserverError>>>;

/// Deadlines past this horizon are treated as unbounded
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn run_deadline(start: Instant, deadline: Duration) -> Instant {
    start
        .checked_add(deadline)
        .filter(|_| deadline < FAR_FUTURE)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Drives one resource through a sequence of instructions
pub struct Orchestrator {
    handle: ResourceHandle,
    definition: ResourceDefinition,
    client: Arc<dyn ResourceClient>,
    watch: Arc<dyn WatchClient>,
    config: OrchestratorConfig,
    state: RunState,
    events_consumed: usize,
    logger: Logger,
}

impl Orchestrator {
    /// Create an orchestrator for the resource described by `definition`
    ///
    /// Fails without contacting the remote side if the resource has no name.
    pub fn new(
        definition: ResourceDefinition,
        client: Arc<dyn ResourceClient>,
        watch: Arc<dyn WatchClient>,
        config: OrchestratorConfig,
        logger: Logger,
    ) -> Result<Self, OrchestratorError> {
        let handle = definition.handle()?;
        let logger = logger.new(o!("resource" => handle.to_string()));

        let namespace_set = definition
            .metadata
            .namespace
            .as_deref()
            .map_or(false, |ns| !ns.trim().is_empty());
        if !namespace_set {
            warn!(logger, "Resource has no namespace, using default"; "namespace" => handle.namespace());
        }

        Ok(Self {
            handle,
            definition,
            client,
            watch,
            config,
            state: RunState::Idle,
            events_consumed: 0,
            logger,
        })
    }

    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Events taken from the feed during the last run
    pub fn events_consumed(&self) -> usize {
        self.events_consumed
    }

    /// Run `instructions` in order under the configured deadline
    pub async fn run(&mut self, instructions: &[Box<dyn Instruction>]) -> Result<(), RunError> {
        self.run_with_cancel(instructions, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but also stops when `cancel` fires
    ///
    /// A cancelled run counts as failed and gets the compensating delete.
    pub async fn run_with_cancel(
        &mut self,
        instructions: &[Box<dyn Instruction>],
        cancel: CancellationToken,
    ) -> Result<(), RunError> {
        self.events_consumed = 0;
        let deadline = run_deadline(Instant::now(), self.config.deadline);

        // Ends on deadline, stream failure, caller cancel or completion
        let scope = cancel.child_token();
        let stream_failure: StreamFailure = Arc::new(Mutex::new(None));

        info!(self.logger, "Starting run";
            "instructions" => instructions.len(),
            "deadline_secs" => self.config.deadline.as_secs_f64()
        );

        let result = match self.start_observer(&scope, &stream_failure, deadline).await {
            Ok((mut feed, observer)) => {
                let result = self
                    .execute(instructions, &mut feed, &scope, &cancel, &stream_failure, deadline)
                    .await;

                // Stop the observer and release the feed
                scope.cancel();
                drop(feed);
                match observer.await {
                    Ok(report) => debug!(self.logger, "Observer finished";
                        "delivered" => report.delivered,
                        "suppressed" => report.suppressed,
                        "exit" => ?report.exit
                    ),
                    Err(e) => error!(self.logger, "Observer task failed"; "error" => %e),
                }
                result
            }
            Err(kind) => {
                scope.cancel();
                Err(self.failure(instructions, 0, Phase::Wait, kind))
            }
        };

        match result {
            Ok(()) => {
                self.state = RunState::Succeeded;
                info!(self.logger, "Run succeeded"; "events_consumed" => self.events_consumed);
                Ok(())
            }
            Err(err) => {
                self.state = RunState::Failed { index: err.index };
                crit!(self.logger, "Run aborted";
                    "index" => err.index,
                    "instruction" => &err.instruction,
                    "phase" => %err.phase,
                    "error" => %err.kind
                );
                self.cleanup().await;
                Err(err)
            }
        }
    }

    async fn start_observer(
        &self,
        scope: &CancellationToken,
        stream_failure: &StreamFailure,
        deadline: Instant,
    ) -> Result<(EventFeed, JoinHandle<ObserverReport>), FailureKind> {
        let subscription = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(FailureKind::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(FailureKind::Timeout(self.config.deadline)),
            subscription = self.watch.subscribe(&self.handle) => {
                subscription.map_err(FailureKind::Subscribe)?
            }
        };

        let slot = stream_failure.clone();
        let run_scope = scope.clone();
        let (observer, feed) =
            ChangeObserver::new(self.handle.clone(), subscription, self.logger.clone());
        let observer = observer
            .with_debug(self.config.debug)
            .with_error_handler(move |err| {
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(err);
                }
                // Wakes the run loop if it is waiting on the feed
                run_scope.cancel();
            });

        let task = tokio::spawn(observer.run(scope.clone()));
        Ok((feed, task))
    }

    async fn execute(
        &mut self,
        instructions: &[Box<dyn Instruction>],
        feed: &mut EventFeed,
        scope: &CancellationToken,
        cancel: &CancellationToken,
        stream_failure: &StreamFailure,
        deadline: Instant,
    ) -> Result<(), RunError> {
        for (index, instruction) in instructions.iter().enumerate() {
            self.state = RunState::Running { index };
            let name = instruction.name();
            info!(self.logger, "Applying instruction"; "index" => index, "instruction" => &name);

            let ctx = ApplyContext {
                handle: &self.handle,
                definition: &self.definition,
                client: self.client.as_ref(),
                retry: &self.config.retry,
                logger: &self.logger,
            };

            let applied = tokio::select! {
                biased;
                _ = scope.cancelled() => Err(self.interruption(cancel, stream_failure, deadline)),
                _ = tokio::time::sleep_until(deadline) => Err(FailureKind::Timeout(self.config.deadline)),
                applied = instruction.apply(&ctx) => applied.map_err(FailureKind::Apply),
            };
            applied.map_err(|kind| self.failure(instructions, index, Phase::Apply, kind))?;

            self.wait_for(instruction.as_ref(), feed, scope, cancel, stream_failure, deadline)
                .await
                .map_err(|kind| self.failure(instructions, index, Phase::Wait, kind))?;

            info!(self.logger, "Instruction complete"; "index" => index, "instruction" => &name);
        }

        Ok(())
    }

    /// Consume events until `instruction` is satisfied; the only place predicates run
    async fn wait_for(
        &mut self,
        instruction: &dyn Instruction,
        feed: &mut EventFeed,
        scope: &CancellationToken,
        cancel: &CancellationToken,
        stream_failure: &StreamFailure,
        deadline: Instant,
    ) -> Result<(), FailureKind> {
        loop {
            let event = tokio::select! {
                biased;
                _ = scope.cancelled() => return Err(self.interruption(cancel, stream_failure, deadline)),
                _ = tokio::time::sleep_until(deadline) => return Err(FailureKind::Timeout(self.config.deadline)),
                event = feed.recv() => event,
            };

            // The observer only closes the feed when it stops
            let Some(event) = event else {
                return Err(self.interruption(cancel, stream_failure, deadline));
            };
            self.events_consumed += 1;

            match instruction.is_done(&event) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!(self.logger, "Not done yet";
                        "kind" => %event.kind,
                        "status" => %event.snapshot.status,
                        "replicas" => ?event.snapshot.desired_replicas,
                        "version" => %event.snapshot.version
                    );
                }
                Err(e) => return Err(FailureKind::Predicate(e)),
            }
        }
    }

    /// Work out why the run scope ended
    fn interruption(
        &self,
        cancel: &CancellationToken,
        stream_failure: &StreamFailure,
        deadline: Instant,
    ) -> FailureKind {
        let failure = stream_failure.lock().ok().and_then(|mut slot| slot.take());
        if let Some(err) = failure {
            return FailureKind::Stream(err);
        }
        if cancel.is_cancelled() {
            return FailureKind::Cancelled;
        }
        if Instant::now() >= deadline {
            return FailureKind::Timeout(self.config.deadline);
        }
        FailureKind::Stream(ObserverError::Stream {
            resource: self.handle.to_string(),
            source: crate::client::WatchError::Closed,
        })
    }

    fn failure(
        &self,
        instructions: &[Box<dyn Instruction>],
        index: usize,
        phase: Phase,
        kind: FailureKind,
    ) -> RunError {
        let instruction = instructions
            .get(index)
            .map(|i| i.name())
            .unwrap_or_else(|| "none".to_string());
        RunError {
            index,
            instruction,
            phase,
            kind,
        }
    }

    /// Best-effort delete after a failed run; errors are logged, never returned
    async fn cleanup(&self) {
        warn!(self.logger, "Deleting resource after failed run";
            "timeout_secs" => self.config.cleanup_timeout.as_secs_f64()
        );

        let delete = self.client.delete(&self.handle, PropagationPolicy::Background);
        match tokio::time::timeout(self.config.cleanup_timeout, delete).await {
            Ok(Ok(())) => info!(self.logger, "Compensating delete issued"),
            Ok(Err(e)) => error!(self.logger, "Compensating delete failed"; "error" => %e),
            Err(_) => error!(self.logger, "Compensating delete timed out"),
        }
    }
}
