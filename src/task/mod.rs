//! Sequential task pipeline
//!
//! A reconciliation pass is expressed as an ordered list of [`Task`]s sharing
//! one mutable context. Every task returns exactly one [`TaskResult`]; the
//! [`Pipeline`] stops at the first result that is not `Complete` and hands it
//! back to the caller. A pass that stops early is never resumed mid-way: the
//! next pass starts again from the first task, so every task must tolerate a
//! replay of all the tasks before it.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Outcome category of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// The task converged; the pipeline continues
    Complete,
    /// A precondition is not met yet; try again after a short delay
    Wait,
    /// An action was taken and another pass is needed to observe it
    Retry,
    /// An operation errored; surfaced to the operator and retried with backoff
    Fail,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "Complete"),
            Self::Wait => write!(f, "Wait"),
            Self::Retry => write!(f, "Retry"),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

/// Tagged outcome of a single task invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskResult {
    kind: TaskKind,
    reason: String,
}

impl TaskResult {
    /// The task converged
    pub fn complete(reason: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Complete,
            reason: reason.into(),
        }
    }

    /// A precondition is not yet satisfied
    pub fn wait(reason: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Wait,
            reason: reason.into(),
        }
    }

    /// Progress requires another pass
    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Retry,
            reason: reason.into(),
        }
    }

    /// The task failed. An empty reason is replaced so operators always see one.
    pub fn fail(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            "unknown failure".to_string()
        } else {
            reason
        };
        Self {
            kind: TaskKind::Fail,
            reason,
        }
    }

    /// Outcome category
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Human-readable reason
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns true if the pipeline should continue past this result
    pub fn is_complete(&self) -> bool {
        self.kind == TaskKind::Complete
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// A named, side-effecting unit of work over a shared context
#[async_trait]
pub trait Task<C: Send>: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Run the task once against the context
    async fn run(&self, ctx: &mut C) -> TaskResult;
}

/// Result of one task within a pipeline run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    /// Task name
    pub task: String,
    /// What the task returned
    pub result: TaskResult,
}

/// Record of a full pipeline run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Outcomes of every task that ran, in order
    pub steps: Vec<StepOutcome>,
}

impl PipelineReport {
    /// Final result of the run: the first non-Complete outcome, or Complete
    pub fn result(&self) -> TaskResult {
        match self.steps.last() {
            Some(step) if !step.result.is_complete() => step.result.clone(),
            Some(step) => TaskResult::complete(step.result.reason()),
            None => TaskResult::complete("no tasks to run"),
        }
    }

    /// Name of the task that stopped the run, if any
    pub fn stopped_at(&self) -> Option<&str> {
        self.steps
            .last()
            .filter(|s| !s.result.is_complete())
            .map(|s| s.task.as_str())
    }

    /// Names of the tasks that ran
    pub fn ran(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.task.as_str()).collect()
    }
}

/// Ordered list of tasks executed against one context
pub struct Pipeline<C: Send> {
    tasks: Vec<Box<dyn Task<C>>>,
}

impl<C: Send> Default for Pipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send> Pipeline<C> {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Append a task and return self for chaining
    pub fn with(mut self, task: impl Task<C> + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    /// Names of the tasks in execution order
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Run the tasks in order, stopping at the first non-Complete result
    pub async fn run(&self, ctx: &mut C) -> PipelineReport {
        let mut report = PipelineReport::default();

        for task in &self.tasks {
            let result = task.run(ctx).await;
            match result.kind() {
                TaskKind::Complete => {
                    debug!(task = task.name(), reason = result.reason(), "task complete")
                }
                TaskKind::Wait | TaskKind::Retry => {
                    info!(task = task.name(), kind = %result.kind(), reason = result.reason(), "task suspended pipeline")
                }
                TaskKind::Fail => {
                    warn!(task = task.name(), reason = result.reason(), "task failed")
                }
            }

            let stop = !result.is_complete();
            report.steps.push(StepOutcome {
                task: task.name().to_string(),
                result,
            });
            if stop {
                break;
            }
        }

        report
    }
}
