#![allow(dead_code)]

use slog::{o, Logger};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stepwise::{
    ApplyContext, ApplyError, ChangeEvent, Instruction, PredicateError, ResourceDefinition,
    ResourceHandle, ResourceSnapshot,
};

pub fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

pub fn definition() -> ResourceDefinition {
    let mut definition = ResourceDefinition::new(Some("models"), "iris");
    definition.spec["replicas"] = serde_json::Value::from(1);
    definition
}

pub fn handle() -> ResourceHandle {
    definition().handle().expect("Definition should have a valid handle")
}

pub fn snapshot(version: &str) -> ResourceSnapshot {
    ResourceSnapshot::new(&handle()).with_version(version)
}

/// One observed call into an instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Apply(usize),
    Check { index: usize, done: bool },
}

/// Shared log of instruction calls across a run
#[derive(Clone, Default)]
pub struct Trace {
    steps: Arc<Mutex<Vec<Step>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Trace {
    pub fn steps(&self) -> Vec<Step> {
        self.steps.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wrap `inner` so its calls land in this trace
    pub fn record(&self, index: usize, inner: impl Instruction + 'static) -> Box<dyn Instruction> {
        Box::new(Recorded {
            index,
            inner: Box::new(inner),
            trace: self.clone(),
            after_apply: None,
        })
    }

    /// Like [`record`](Self::record), running `hook` once the mutation has been accepted
    pub fn record_with_hook(
        &self,
        index: usize,
        inner: impl Instruction + 'static,
        hook: impl Fn() + Send + Sync + 'static,
    ) -> Box<dyn Instruction> {
        Box::new(Recorded {
            index,
            inner: Box::new(inner),
            trace: self.clone(),
            after_apply: Some(Box::new(hook)),
        })
    }

    /// Every apply after the first must follow a successful check of the previous instruction
    pub fn assert_ordered(&self) {
        let steps = self.steps();
        for (position, step) in steps.iter().enumerate() {
            if let Step::Apply(index) = step {
                if *index == 0 {
                    continue;
                }
                let confirmed = steps[..position].contains(&Step::Check {
                    index: index - 1,
                    done: true,
                });
                assert!(
                    confirmed,
                    "Apply({}) issued before instruction {} completed: {:?}",
                    index,
                    index - 1,
                    steps
                );
            }
        }
    }
}

struct Recorded {
    index: usize,
    inner: Box<dyn Instruction>,
    trace: Trace,
    after_apply: Option<Box<dyn Fn() + Send + Sync>>,
}

#[async_trait::async_trait]
impl Instruction for Recorded {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn apply(&self, ctx: &ApplyContext<'_>) -> Result<(), ApplyError> {
        self.trace.steps.lock().unwrap().push(Step::Apply(self.index));
        self.inner.apply(ctx).await?;
        if let Some(hook) = &self.after_apply {
            hook();
        }
        Ok(())
    }

    fn is_done(&self, event: &ChangeEvent) -> Result<bool, PredicateError> {
        let now = self.trace.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.trace.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.inner.is_done(event);
        if let Ok(done) = result {
            self.trace.steps.lock().unwrap().push(Step::Check {
                index: self.index,
                done,
            });
        }

        self.trace.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
