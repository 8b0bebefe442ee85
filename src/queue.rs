//! The resumable provisioning engine.
//!
//! An [`InfrastructureQueue`] is an ordered sequence of [`StepGroup`]s, each
//! holding a narration label and an ordered list of mutator steps over one
//! record. Steps are expected to be idempotent: a step first checks whether
//! its target field is already populated and returns success without touching
//! the cloud if so. That check is what makes re-running a whole queue after a
//! partial failure safe.
//!
//! The engine performs no dependency inference. Callers append groups in
//! dependency order, and the same engine type runs teardown by appending
//! groups in reverse dependency order with mutators that null fields out.
//!
//! The record is mutated in place even when a step fails, so callers MUST
//! persist the record after every [`InfrastructureQueue::run`], win or lose;
//! resumable progress is encoded entirely in which fields are populated.

use crate::progress::ProgressReporter;
use anyhow::Result;
use futures::future::BoxFuture;
use tracing::debug;

/// A single idempotent mutator over the record.
pub type Step<R> = Box<dyn for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, Result<()>> + Send>;

/// An ordered unit of idempotent mutators sharing one narration label.
pub struct StepGroup<R> {
    narration: String,
    steps: Vec<Step<R>>,
}

impl<R> StepGroup<R> {
    pub fn new(narration: impl Into<String>) -> Self {
        Self {
            narration: narration.into(),
            steps: Vec::new(),
        }
    }

    /// Append a mutator step to this group.
    pub fn step<F>(mut self, f: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        self.steps.push(Box::new(f));
        self
    }

    pub fn narration(&self) -> &str {
        &self.narration
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Ordered sequence of step groups executed left to right over one record.
pub struct InfrastructureQueue<R> {
    groups: Vec<StepGroup<R>>,
}

impl<R> Default for InfrastructureQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> InfrastructureQueue<R> {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    /// Append a group. Groups run in append order; ordering is a correctness
    /// requirement since later groups read fields written by earlier ones.
    pub fn group(mut self, group: StepGroup<R>) -> Self {
        self.groups.push(group);
        self
    }

    pub fn push(&mut self, group: StepGroup<R>) {
        self.groups.push(group);
    }

    /// Execute all groups in order, steps in order within each group.
    ///
    /// The first step error aborts the entire run; no later step or group
    /// executes. The record keeps every mutation applied before the failure.
    pub async fn run(self, record: &mut R, reporter: &dyn ProgressReporter) -> Result<()> {
        for group in self.groups {
            reporter.start_step(&group.narration);
            debug!(group = %group.narration, steps = group.steps.len(), "Running step group");

            for step in group.steps {
                step(record).await?;
            }
        }

        Ok(())
    }
}
