//! Sequencing of asynchronous steps.
//!
//! A [`TaskChain`] runs an ordered list of single-shot steps over a shared
//! context, one step at a time. A step is a closure that borrows the context
//! and returns a boxed future; the future resolving is the step's signal to
//! advance. Each step produces an [`Outcome`], and the first failure ends the
//! chain unless [`FailurePolicy::Continue`] is selected.
//!
//! ```rust,ignore
//! let mut chain = TaskChain::new();
//! let open_cx = cx.clone();
//! chain.add_task("open", move |conn, _step| {
//!     Box::pin(async move { conn.connect(&open_cx).await })
//! });
//! chain.add_task("close", move |conn, _step| {
//!     Box::pin(async move { conn.disconnect(&cx).await })
//! });
//! let outcome = chain.run(&mut conn).await;
//! ```
//!
//! Steps may schedule more work while they run through
//! [`StepContext::add_task`]; the new step lands right after the running one
//! unless the chain is still on its first step or already on its last, in
//! which case it is appended. Each addition is placed on its own, so two
//! steps queued from the middle of the chain run in reverse call order.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use asupersync::{CancelReason, Outcome, PanicPayload};

use crate::error::{Error, ProgrammingErrorKind};

/// The future a step returns.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Outcome<(), Error>> + 'a>>;

type StepBody<C> =
    Box<dyn for<'a> FnOnce(&'a mut C, &'a mut StepContext<C>) -> StepFuture<'a>>;

/// Lifecycle of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not started yet
    Init,
    /// Body is executing
    Running,
    /// Body has completed (successfully or not)
    Finished,
}

/// One step of a chain. Runs at most once.
pub struct Task<C> {
    name: String,
    state: TaskState,
    body: Option<StepBody<C>>,
}

impl<C> Task<C> {
    /// Create a task from a step body.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut C, &'a mut StepContext<C>) -> StepFuture<'a> + 'static,
    {
        Self {
            name: name.into(),
            state: TaskState::Init,
            body: Some(Box::new(body)),
        }
    }

    /// Task name, used in logs and outcomes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Run the body.
    ///
    /// Fails with [`ProgrammingErrorKind::TaskReentered`] unless the task is
    /// still in [`TaskState::Init`].
    pub async fn run(&mut self, ctx: &mut C, step: &mut StepContext<C>) -> Outcome<(), Error> {
        let body = match (self.state, self.body.take()) {
            (TaskState::Init, Some(body)) => body,
            (state, _) => {
                return Outcome::Err(Error::programming(
                    ProgrammingErrorKind::TaskReentered,
                    format!("task '{}' started again while {:?}", self.name, state),
                ));
            }
        };

        self.state = TaskState::Running;
        let outcome = body(ctx, step).await;
        self.state = TaskState::Finished;
        outcome
    }
}

impl<C> fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Cloneable flag that freezes a chain after its current step.
///
/// Stopping never interrupts the step that is running; it only prevents the
/// chain from advancing past it.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request the chain to stop after the current step.
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Has a stop been requested since the chain last started?
    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

/// Handle passed to a running step.
pub struct StepContext<C> {
    index: usize,
    added: Vec<Task<C>>,
    stop: StopHandle,
}

impl<C> StepContext<C> {
    fn new(index: usize, stop: StopHandle) -> Self {
        Self {
            index,
            added: Vec::new(),
            stop,
        }
    }

    /// Index of the running step.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Schedule another step. It is placed once the running step completes.
    pub fn add_task<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: for<'a> FnOnce(&'a mut C, &'a mut StepContext<C>) -> StepFuture<'a> + 'static,
    {
        self.added.push(Task::new(name, body));
    }

    /// Stop the chain after this step.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// A handle that can stop the chain from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }
}

/// What happens when a step returns `Outcome::Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// End the chain at the first failing step.
    #[default]
    ShortCircuit,
    /// Record the failure and advance as if the step had succeeded.
    Continue,
}

/// A step failure recorded under [`FailurePolicy::Continue`].
#[derive(Debug)]
pub struct StepFailure {
    pub index: usize,
    pub name: String,
    pub error: Error,
}

/// How a chain run ended.
#[derive(Debug)]
pub enum ChainOutcome {
    /// The chain had no steps; nothing ran.
    Empty,
    /// Every step ran.
    Completed {
        steps: usize,
        failures: Vec<StepFailure>,
    },
    /// A stop was requested during step `index`; later steps did not run.
    Stopped { index: usize },
    /// Step `index` failed and the chain short-circuited.
    Failed {
        index: usize,
        name: String,
        error: Error,
    },
    /// Step `index` was cancelled.
    Cancelled { index: usize, reason: CancelReason },
    /// Step `index` panicked.
    Panicked { index: usize, payload: PanicPayload },
}

impl ChainOutcome {
    /// Did every step run without short-circuiting?
    pub fn is_completed(&self) -> bool {
        matches!(self, ChainOutcome::Completed { .. })
    }

    /// The error that ended the chain, if any.
    pub fn error(&self) -> Option<&Error> {
        match self {
            ChainOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Convert into a `Result`, treating only `Failed` as an error.
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            ChainOutcome::Failed { error, .. } => Err(error),
            _ => Ok(()),
        }
    }
}

/// Ordered list of single-shot asynchronous steps.
pub struct TaskChain<C> {
    tasks: Vec<Task<C>>,
    cursor: usize,
    stop: StopHandle,
    policy: FailurePolicy,
    on_task_begin: Option<Box<dyn FnMut(usize, &str)>>,
    on_finish: Option<Box<dyn FnMut(&ChainOutcome)>>,
}

impl<C> Default for TaskChain<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for TaskChain<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskChain")
            .field("tasks", &self.tasks)
            .field("cursor", &self.cursor)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<C> TaskChain<C> {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cursor: 0,
            stop: StopHandle::default(),
            policy: FailurePolicy::default(),
            on_task_begin: None,
            on_finish: None,
        }
    }

    /// Set the failure policy.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Invoke `hook` before every step, with the step index and name.
    pub fn when_task_begin(&mut self, hook: impl FnMut(usize, &str) + 'static) {
        self.on_task_begin = Some(Box::new(hook));
    }

    /// Invoke `hook` once per run, after the last step (or the failing one).
    pub fn when_finish(&mut self, hook: impl FnMut(&ChainOutcome) + 'static) {
        self.on_finish = Some(Box::new(hook));
    }

    /// Add a step.
    pub fn add_task<F>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: for<'a> FnOnce(&'a mut C, &'a mut StepContext<C>) -> StepFuture<'a> + 'static,
    {
        self.insert_tasks(vec![Task::new(name, body)]);
        self
    }

    /// Index of the step that is running (or ran last).
    pub fn current_task_index(&self) -> usize {
        self.cursor
    }

    /// Number of steps in the chain.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Names of the steps in execution order.
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(Task::name).collect()
    }

    /// State of the step at `index`.
    pub fn task_state(&self, index: usize) -> Option<TaskState> {
        self.tasks.get(index).map(Task::state)
    }

    /// Stop after the current step.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// A handle that stops this chain from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the chain from its first step.
    ///
    /// Steps that already ran are not run again: starting a finished chain
    /// fails at step 0 with [`ProgrammingErrorKind::TaskReentered`].
    pub async fn run(&mut self, ctx: &mut C) -> ChainOutcome {
        self.stop.reset();
        if self.tasks.is_empty() {
            return ChainOutcome::Empty;
        }

        self.cursor = 0;
        let mut failures = Vec::new();

        loop {
            let index = self.cursor;
            if let Some(hook) = self.on_task_begin.as_mut() {
                hook(index, self.tasks[index].name());
            }
            tracing::trace!(index, task = self.tasks[index].name(), "Starting chain step");

            let mut step = StepContext::new(index, self.stop.clone());
            let outcome = self.tasks[index].run(ctx, &mut step).await;
            self.insert_tasks(step.added);

            match outcome {
                Outcome::Ok(()) => {}
                Outcome::Err(error) => {
                    let name = self.tasks[index].name().to_string();
                    match self.policy {
                        FailurePolicy::ShortCircuit => {
                            tracing::debug!(index, task = %name, error = %error, "Chain step failed");
                            return self.finish(ChainOutcome::Failed { index, name, error });
                        }
                        FailurePolicy::Continue => {
                            tracing::warn!(index, task = %name, error = %error, "Chain step failed, continuing");
                            failures.push(StepFailure { index, name, error });
                        }
                    }
                }
                Outcome::Cancelled(reason) => {
                    return self.finish(ChainOutcome::Cancelled { index, reason });
                }
                Outcome::Panicked(payload) => {
                    return self.finish(ChainOutcome::Panicked { index, payload });
                }
            }

            if self.stop.is_stop_requested() {
                tracing::debug!(index, "Chain stopped");
                return ChainOutcome::Stopped { index };
            }

            if index + 1 < self.tasks.len() {
                self.cursor += 1;
            } else {
                let steps = self.tasks.len();
                return self.finish(ChainOutcome::Completed { steps, failures });
            }
        }
    }

    fn finish(&mut self, outcome: ChainOutcome) -> ChainOutcome {
        if let Some(hook) = self.on_finish.as_mut() {
            hook(&outcome);
        }
        outcome
    }

    fn insert_tasks(&mut self, tasks: Vec<Task<C>>) {
        // One placement per task, in call order, against the current length.
        for task in tasks {
            let at = insertion_index(self.cursor, self.tasks.len());
            self.tasks.insert(at, task);
        }
    }
}

/// Where a new step goes given the cursor and the current length.
fn insertion_index(cursor: usize, len: usize) -> usize {
    if cursor == 0 || cursor + 1 >= len {
        len
    } else {
        cursor + 1
    }
}
