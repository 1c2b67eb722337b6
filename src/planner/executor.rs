//! Plan executor.
//!
//! The executor walks a plan with bounded concurrency. A single coordinator
//! loop owns every node's status and the state snapshot; provider calls run
//! as tasks and report back to it. An operation starts only after all of its
//! dependencies are `Done`. When an operation fails, every operation that
//! transitively depends on it is `Skipped` while independent branches keep
//! running. On cancellation or run timeout no new operation starts and
//! in-flight ones are allowed to finish.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{CheckpointMode, EngineConfig};
use crate::error::{ConvergeError, ProviderError, ReconcileError, Result};
use crate::graph::{AttributeMap, ResourceGraph, ResourceId};
use crate::provider::{
    CreatedResource, Provider, ProviderRegistry, ProviderResult, RetryPolicy, call_with_retry,
};
use crate::state::{ResourceState, RunCounts, StateSnapshot, StateStore};

use super::diff::{DiffEngine, OperationKind};
use super::plan::{Plan, PlannedOperation};

/// Scheduling status of an operation within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for dependencies.
    Pending,
    /// Provider call in flight.
    Running,
    /// Finished successfully.
    Done,
    /// Provider call failed.
    Failed,
    /// Not started because a dependency failed.
    Skipped,
    /// Not started because the run stopped early.
    Cancelled,
}

/// Lifecycle of a resource as seen by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Planned but not started.
    Planned,
    /// Being created.
    Creating,
    /// Exists and matches its declaration.
    Ready,
    /// Being updated in place.
    Updating,
    /// Being deleted.
    Deleting,
    /// Deleted.
    Deleted,
    /// Last operation failed.
    Failed,
}

/// Progress notifications emitted while executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A provider call was dispatched.
    Started {
        /// Resource identity.
        id: ResourceId,
        /// Operation kind.
        kind: OperationKind,
    },
    /// A provider call is being retried.
    Retrying {
        /// Resource identity.
        id: ResourceId,
        /// Attempt number, starting at 2.
        attempt: u32,
    },
    /// An operation finished successfully.
    Finished {
        /// Resource identity.
        id: ResourceId,
        /// Operation kind that was applied.
        kind: OperationKind,
        /// Resulting lifecycle state.
        lifecycle: LifecycleState,
    },
    /// An operation failed.
    Failed {
        /// Resource identity.
        id: ResourceId,
        /// Error message.
        error: String,
    },
    /// An operation was skipped.
    Skipped {
        /// Resource identity.
        id: ResourceId,
        /// Why it was skipped.
        reason: String,
    },
    /// An operation was never started because the run stopped.
    Cancelled {
        /// Resource identity.
        id: ResourceId,
    },
}

/// Execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum provider calls in flight.
    pub concurrency: usize,
    /// Retry settings for each provider call.
    pub retry: RetryPolicy,
    /// Deadline for the whole run.
    pub run_timeout: Option<Duration>,
    /// When the snapshot is written.
    pub checkpoint: CheckpointMode,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl ExecutorOptions {
    /// Builds options from the stack's engine settings.
    #[must_use]
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            concurrency: engine.concurrency.max(1),
            retry: engine.retry_policy(),
            run_timeout: engine.run_timeout(),
            checkpoint: engine.checkpoint,
        }
    }
}

/// Cooperative cancellation shared between the caller and the executor.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Result of a single operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    /// Operation index in the plan.
    pub index: usize,
    /// Resource identity.
    pub id: ResourceId,
    /// Operation kind that was applied, which may differ from the plan
    /// once upstream outputs are known.
    pub kind: OperationKind,
    /// Final scheduling status.
    pub status: NodeStatus,
    /// Final lifecycle state.
    pub lifecycle: LifecycleState,
    /// Provider call attempts, retries included.
    pub attempts: u32,
    /// Error message, if failed or skipped.
    pub error: Option<String>,
    /// Non-fatal problem, e.g. a replaced instance left for later deletion.
    pub warning: Option<String>,
    /// Wall time spent in provider calls.
    pub duration_ms: u64,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Per-operation results, in plan order.
    pub results: Vec<OperationResult>,
    /// Per-kind counts.
    pub counts: RunCounts,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Whether the run hit its timeout.
    pub timed_out: bool,
    /// Total wall time.
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Returns true if every operation finished successfully.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.counts.is_clean() && !self.cancelled && !self.timed_out
    }

    /// Returns the number of operations that reached a terminal state.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, NodeStatus::Done | NodeStatus::Failed))
            .count()
    }

    /// Returns the first failure message, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<&str> {
        self.results
            .iter()
            .find(|r| r.status == NodeStatus::Failed)
            .and_then(|r| r.error.as_deref())
    }
}

/// Executor for plans.
pub struct PlanExecutor<'a> {
    registry: &'a ProviderRegistry,
    store: &'a dyn StateStore,
    graph: &'a ResourceGraph,
    options: ExecutorOptions,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

/// Provider call handed to a task.
struct Work {
    id: ResourceId,
    kind: OperationKind,
    provider: Arc<dyn Provider>,
    inputs: AttributeMap,
    prior: Option<ResourceState>,
    create_before_delete: bool,
    retry: RetryPolicy,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

/// What a task reports back.
enum WorkOutcome {
    Applied {
        provider_id: String,
        outputs: AttributeMap,
        orphan_error: Option<String>,
    },
    Deleted,
    Failed {
        error: String,
        old_deleted: bool,
    },
}

struct Finished {
    outcome: WorkOutcome,
    attempts: u32,
}

/// Bookkeeping for a dispatched operation.
struct Dispatched {
    kind: OperationKind,
    inputs: AttributeMap,
    hash: String,
    prior: Option<ResourceState>,
    started: Instant,
}

enum Prepared {
    Unchanged,
    Work(Work, Dispatched),
}

/// Scheduling state owned by the coordinator.
struct RunState {
    status: Vec<NodeStatus>,
    remaining: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BinaryHeap<Reverse<usize>>,
    results: Vec<OperationResult>,
    counts: RunCounts,
    /// False for deletes that belong to a replacement counted elsewhere.
    counted: Vec<bool>,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        registry: &'a ProviderRegistry,
        store: &'a dyn StateStore,
        graph: &'a ResourceGraph,
    ) -> Self {
        Self {
            registry,
            store,
            graph,
            options: ExecutorOptions::default(),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Sets execution options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the channel progress events are sent on.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Executes a plan, recording every success in `snapshot`.
    ///
    /// Provider failures do not make this return an error: they are reported
    /// per operation in the result.
    ///
    /// # Errors
    ///
    /// Returns an error if a checkpoint cannot be written. In-flight
    /// operations are drained first.
    pub async fn execute(
        &self,
        plan: &Plan,
        snapshot: &mut StateSnapshot,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let concurrency = self.options.concurrency.max(1);
        info!(
            "Executing plan with {} operations ({} changes, concurrency {concurrency})",
            plan.operations.len(),
            plan.changes().count()
        );

        let mut run = RunState::new(plan);
        let mut dispatched: Vec<Option<Dispatched>> =
            plan.operations.iter().map(|_| None).collect();
        let mut in_flight: JoinSet<(usize, Finished)> = JoinSet::new();

        let deadline = self
            .options
            .run_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let run_deadline = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(run_deadline);

        let mut stopping = false;
        let mut cancelled = false;
        let mut timed_out = false;
        let mut fatal: Option<ConvergeError> = None;

        loop {
            if !stopping && self.cancel.is_cancelled() {
                warn!("Cancellation requested before dispatch");
                stopping = true;
                cancelled = true;
            }

            if !stopping {
                let mut refreshed = false;
                while in_flight.len() < concurrency {
                    let Some(Reverse(idx)) = run.ready.pop() else {
                        break;
                    };
                    if run.status[idx] != NodeStatus::Pending {
                        continue;
                    }
                    refreshed |=
                        self.dispatch(idx, plan, snapshot, &mut run, &mut dispatched, &mut in_flight);
                }
                if refreshed && let Err(e) = self.checkpoint(snapshot).await {
                    error!("Checkpoint failed, stopping run: {e}");
                    fatal.get_or_insert(e);
                    stopping = true;
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok((idx, finished))) => {
                            if let Err(e) = self
                                .settle(idx, finished, plan, snapshot, &mut run, &mut dispatched)
                                .await
                            {
                                error!("Checkpoint failed, stopping run: {e}");
                                fatal.get_or_insert(e);
                                stopping = true;
                            }
                        }
                        Some(Err(e)) => error!("Operation task failed: {e}"),
                        None => {}
                    }
                }
                () = self.cancel.cancelled(), if !stopping => {
                    warn!("Cancellation requested, waiting for in-flight operations");
                    stopping = true;
                    cancelled = true;
                }
                () = &mut run_deadline, if !stopping => {
                    warn!("Run timeout reached, waiting for in-flight operations");
                    stopping = true;
                    timed_out = true;
                }
            }
        }

        for idx in 0..plan.operations.len() {
            match run.status[idx] {
                NodeStatus::Pending if stopping => {
                    run.status[idx] = NodeStatus::Cancelled;
                    run.results[idx].status = NodeStatus::Cancelled;
                    run.counts.cancelled += 1;
                    self.emit(ProgressEvent::Cancelled {
                        id: plan.operations[idx].id.clone(),
                    });
                }
                NodeStatus::Pending => {
                    run.status[idx] = NodeStatus::Skipped;
                    run.results[idx].status = NodeStatus::Skipped;
                    run.counts.skipped += 1;
                }
                NodeStatus::Running => {
                    run.fail(idx, String::from("operation task was lost"), 0);
                }
                _ => {}
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let result = ExecutionResult {
            results: run.results,
            counts: run.counts,
            cancelled,
            timed_out,
            duration_ms: elapsed_ms(started),
        };
        info!("Execution finished: {}", result.counts);
        Ok(result)
    }

    /// Re-diffs an operation against current state and starts it. Returns
    /// true if the snapshot changed without a provider call.
    fn dispatch(
        &self,
        idx: usize,
        plan: &Plan,
        snapshot: &mut StateSnapshot,
        run: &mut RunState,
        dispatched: &mut [Option<Dispatched>],
        in_flight: &mut JoinSet<(usize, Finished)>,
    ) -> bool {
        let op = &plan.operations[idx];
        let mut refreshed = false;

        match self.prepare(op, snapshot) {
            Err(error) => {
                error!("Cannot start {}: {error}", op.id);
                self.fail(idx, plan, run, error, 0);
            }
            Ok(Prepared::Unchanged) => {
                if let Some(node) = op.node {
                    let dependencies = self.graph.dependency_keys(node);
                    if let Some(state) = snapshot.resources.get_mut(&op.id.key())
                        && state.dependencies != dependencies
                    {
                        debug!("{} now depends on {dependencies:?}", op.id);
                        state.dependencies = dependencies;
                        refreshed = true;
                    }
                }
                debug!("{} unchanged", op.id);
                run.succeed(idx, OperationKind::NoOp, LifecycleState::Ready, 0, None, 0);
                self.emit(ProgressEvent::Finished {
                    id: op.id.clone(),
                    kind: OperationKind::NoOp,
                    lifecycle: LifecycleState::Ready,
                });
            }
            Ok(Prepared::Work(work, record)) => {
                info!("{}: {}", work.kind, op.id);
                run.status[idx] = NodeStatus::Running;
                run.results[idx].status = NodeStatus::Running;
                run.results[idx].kind = record.kind;
                run.results[idx].lifecycle = match record.kind {
                    OperationKind::Update => LifecycleState::Updating,
                    OperationKind::Delete => LifecycleState::Deleting,
                    _ => LifecycleState::Creating,
                };
                self.emit(ProgressEvent::Started {
                    id: op.id.clone(),
                    kind: record.kind,
                });
                dispatched[idx] = Some(record);

                in_flight.spawn(async move {
                    let id = work.id.clone();
                    let finished = match tokio::spawn(work.run()).await {
                        Ok(finished) => finished,
                        Err(e) => Finished {
                            outcome: WorkOutcome::Failed {
                                error: format!("operation on {id} aborted: {e}"),
                                old_deleted: false,
                            },
                            attempts: 0,
                        },
                    };
                    (idx, finished)
                });
            }
        }
        refreshed
    }

    /// Decides what a ready operation has to do now that its upstream
    /// outputs are known.
    fn prepare(
        &self,
        op: &PlannedOperation,
        snapshot: &StateSnapshot,
    ) -> std::result::Result<Prepared, String> {
        let provider = self
            .registry
            .provider_for(&op.id.resource_type)
            .ok_or_else(|| format!("no provider handles type '{}'", op.id.resource_type))?;

        let Some(node) = op.node else {
            return Ok(Prepared::Work(
                Work {
                    id: op.id.clone(),
                    kind: OperationKind::Delete,
                    provider,
                    inputs: AttributeMap::new(),
                    prior: op.prior.clone(),
                    create_before_delete: false,
                    retry: self.options.retry,
                    events: self.events.clone(),
                },
                Dispatched {
                    kind: OperationKind::Delete,
                    inputs: AttributeMap::new(),
                    hash: String::new(),
                    prior: op.prior.clone(),
                    started: Instant::now(),
                },
            ));
        };

        let schema = self
            .registry
            .schema(&op.id.resource_type)
            .ok_or_else(|| format!("no schema for type '{}'", op.id.resource_type))?;
        let inputs = DiffEngine::resolve(self.graph, node, snapshot, &HashSet::new())
            .map_err(|e| e.to_string())?;
        let prior = snapshot.get(&op.id);
        let diff = DiffEngine::new().diff_resource(&op.id, &inputs, prior, schema);

        // The old instance was deleted by its own operation; creating the new
        // one completes the replacement.
        let reported = if diff.kind == OperationKind::Create && op.deletes_first() {
            OperationKind::Replace
        } else {
            diff.kind
        };
        if reported != op.kind {
            debug!("{} re-planned from {} to {}", op.id, op.kind, reported);
        }
        if diff.kind == OperationKind::NoOp {
            return Ok(Prepared::Unchanged);
        }

        let hash = diff
            .new_hash
            .ok_or_else(|| String::from("inputs are still unknown after dependencies finished"))?;

        Ok(Prepared::Work(
            Work {
                id: op.id.clone(),
                kind: diff.kind,
                provider,
                inputs: inputs.known.clone(),
                prior: prior.cloned(),
                create_before_delete: schema.create_before_delete,
                retry: self.options.retry,
                events: self.events.clone(),
            },
            Dispatched {
                kind: reported,
                inputs: inputs.known,
                hash,
                prior: prior.cloned(),
                started: Instant::now(),
            },
        ))
    }

    /// Records a finished task in the snapshot and checkpoints it.
    async fn settle(
        &self,
        idx: usize,
        finished: Finished,
        plan: &Plan,
        snapshot: &mut StateSnapshot,
        run: &mut RunState,
        dispatched: &mut [Option<Dispatched>],
    ) -> Result<()> {
        let op = &plan.operations[idx];
        let Some(record) = dispatched[idx].take() else {
            return Ok(());
        };
        let duration_ms = elapsed_ms(record.started);

        match finished.outcome {
            WorkOutcome::Applied {
                provider_id,
                outputs,
                orphan_error,
            } => {
                let dependencies = op
                    .node
                    .map(|node| self.graph.dependency_keys(node))
                    .unwrap_or_default();
                let mut state = ResourceState::new(op.id.clone(), provider_id, record.hash)
                    .with_outputs(outputs)
                    .with_inputs(record.inputs)
                    .with_dependencies(dependencies);
                if record.kind == OperationKind::Update
                    && let Some(prior) = &record.prior
                {
                    state.created_at = prior.created_at;
                }
                snapshot.upsert(state);

                let warning = match (orphan_error, record.prior) {
                    (Some(e), Some(old)) => {
                        warn!(
                            "Replaced {} but could not delete old instance {}: {e}",
                            op.id, old.provider_id
                        );
                        let message = format!(
                            "old instance {} queued for deletion: {e}",
                            old.provider_id
                        );
                        snapshot.push_pending_delete(old);
                        Some(message)
                    }
                    _ => None,
                };

                info!("{} {} ({} attempts)", op.id, done_verb(record.kind), finished.attempts);
                run.succeed(
                    idx,
                    record.kind,
                    LifecycleState::Ready,
                    finished.attempts,
                    warning,
                    duration_ms,
                );
                self.emit(ProgressEvent::Finished {
                    id: op.id.clone(),
                    kind: record.kind,
                    lifecycle: LifecycleState::Ready,
                });
            }
            WorkOutcome::Deleted => {
                if op.pending_delete {
                    if let Some(old) = &record.prior {
                        snapshot.clear_pending_delete(&op.id, &old.provider_id);
                    }
                } else {
                    snapshot.remove(&op.id);
                }
                if op.retires_prior {
                    info!("{} old instance deleted, re-creating", op.id);
                } else {
                    info!("{} deleted", op.id);
                }
                run.succeed(
                    idx,
                    OperationKind::Delete,
                    LifecycleState::Deleted,
                    finished.attempts,
                    None,
                    duration_ms,
                );
                self.emit(ProgressEvent::Finished {
                    id: op.id.clone(),
                    kind: OperationKind::Delete,
                    lifecycle: LifecycleState::Deleted,
                });
            }
            WorkOutcome::Failed { error, old_deleted } => {
                error!("{} {} failed: {error}", record.kind, op.id);
                if old_deleted {
                    snapshot.remove(&op.id);
                }
                run.results[idx].duration_ms = duration_ms;
                self.fail(idx, plan, run, error, finished.attempts);
                if !old_deleted {
                    return Ok(());
                }
            }
        }

        self.checkpoint(snapshot).await
    }

    fn fail(&self, idx: usize, plan: &Plan, run: &mut RunState, error: String, attempts: u32) {
        let id = plan.operations[idx].id.clone();
        let skipped = run.fail(idx, error.clone(), attempts);
        self.emit(ProgressEvent::Failed {
            id: id.clone(),
            error,
        });
        for s in skipped {
            warn!("Skipping {}: dependency {id} failed", plan.operations[s].id);
            self.emit(ProgressEvent::Skipped {
                id: plan.operations[s].id.clone(),
                reason: format!("dependency {id} failed"),
            });
        }
    }

    async fn checkpoint(&self, snapshot: &mut StateSnapshot) -> Result<()> {
        if self.options.checkpoint == CheckpointMode::Incremental {
            snapshot.bump_serial();
            self.store.save(snapshot).await?;
            debug!("Checkpointed state at serial {}", snapshot.serial);
        }
        Ok(())
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

impl RunState {
    fn new(plan: &Plan) -> Self {
        let count = plan.operations.len();
        let mut remaining = vec![0usize; count];
        let mut dependents = vec![Vec::new(); count];

        for (idx, op) in plan.operations.iter().enumerate() {
            for &dep in &op.dependencies {
                dependents[dep].push(idx);
                remaining[idx] += 1;
            }
        }

        let ready = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();

        let counted = plan.operations.iter().map(|op| !op.retires_prior).collect();
        let results = plan
            .operations
            .iter()
            .enumerate()
            .map(|(index, op)| OperationResult {
                index,
                id: op.id.clone(),
                kind: op.kind,
                status: NodeStatus::Pending,
                lifecycle: LifecycleState::Planned,
                attempts: 0,
                error: None,
                warning: None,
                duration_ms: 0,
            })
            .collect();

        Self {
            status: vec![NodeStatus::Pending; count],
            remaining,
            dependents,
            ready,
            results,
            counts: RunCounts::default(),
            counted,
        }
    }

    fn succeed(
        &mut self,
        idx: usize,
        kind: OperationKind,
        lifecycle: LifecycleState,
        attempts: u32,
        warning: Option<String>,
        duration_ms: u64,
    ) {
        self.status[idx] = NodeStatus::Done;
        let result = &mut self.results[idx];
        result.status = NodeStatus::Done;
        result.kind = kind;
        result.lifecycle = lifecycle;
        result.attempts = attempts;
        result.warning = warning;
        result.duration_ms = duration_ms;

        if self.counted[idx] {
            match kind {
                OperationKind::Create => self.counts.created += 1,
                OperationKind::Update => self.counts.updated += 1,
                OperationKind::Replace => self.counts.replaced += 1,
                OperationKind::Delete => self.counts.deleted += 1,
                OperationKind::NoOp => self.counts.unchanged += 1,
            }
        }

        for &dependent in &self.dependents[idx] {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 && self.status[dependent] == NodeStatus::Pending {
                self.ready.push(Reverse(dependent));
            }
        }
    }

    /// Marks an operation failed and skips everything downstream of it.
    /// Returns the skipped operations.
    fn fail(&mut self, idx: usize, error: String, attempts: u32) -> Vec<usize> {
        self.status[idx] = NodeStatus::Failed;
        self.counts.failed += 1;
        let result = &mut self.results[idx];
        result.status = NodeStatus::Failed;
        result.lifecycle = LifecycleState::Failed;
        result.attempts = attempts;
        let failed_id = result.id.clone();
        result.error = Some(error);

        let mut skipped = Vec::new();
        let mut stack: Vec<usize> = self.dependents[idx].clone();
        while let Some(dependent) = stack.pop() {
            if self.status[dependent] != NodeStatus::Pending {
                continue;
            }
            self.status[dependent] = NodeStatus::Skipped;
            self.counts.skipped += 1;
            self.results[dependent].status = NodeStatus::Skipped;
            self.results[dependent].error = Some(format!("dependency {failed_id} failed"));
            skipped.push(dependent);
            stack.extend(self.dependents[dependent].iter().copied());
        }
        skipped.sort_unstable();
        skipped
    }
}

impl Work {
    async fn run(self) -> Finished {
        let mut attempts = 0;
        let outcome = match self.kind {
            OperationKind::Create => match self.create(&mut attempts).await {
                Ok(created) => WorkOutcome::Applied {
                    provider_id: created.provider_id,
                    outputs: created.outputs,
                    orphan_error: None,
                },
                Err(error) => WorkOutcome::Failed {
                    error,
                    old_deleted: false,
                },
            },
            OperationKind::Update => self.update(&mut attempts).await,
            OperationKind::Replace => self.replace(&mut attempts).await,
            OperationKind::Delete => match &self.prior {
                Some(prior) => match self.delete(&prior.provider_id, &mut attempts).await {
                    Ok(()) => WorkOutcome::Deleted,
                    Err(error) => WorkOutcome::Failed {
                        error,
                        old_deleted: false,
                    },
                },
                None => WorkOutcome::Deleted,
            },
            OperationKind::NoOp => WorkOutcome::Failed {
                error: String::from("nothing to apply"),
                old_deleted: false,
            },
        };
        Finished { outcome, attempts }
    }

    async fn create(&self, attempts: &mut u32) -> std::result::Result<CreatedResource, String> {
        let provider = &self.provider;
        let resource_type = self.id.resource_type.as_str();
        let inputs = &self.inputs;
        self.call(&format!("create {}", self.id), attempts, move || {
            provider.create(resource_type, inputs)
        })
        .await
    }

    async fn update(&self, attempts: &mut u32) -> WorkOutcome {
        let Some(prior) = &self.prior else {
            return WorkOutcome::Failed {
                error: String::from("no recorded instance to update"),
                old_deleted: false,
            };
        };
        let provider = &self.provider;
        let resource_type = self.id.resource_type.as_str();
        let provider_id = prior.provider_id.as_str();
        let inputs = &self.inputs;

        match self
            .call(&format!("update {}", self.id), attempts, move || {
                provider.update(resource_type, provider_id, inputs)
            })
            .await
        {
            Ok(outputs) => WorkOutcome::Applied {
                provider_id: prior.provider_id.clone(),
                outputs,
                orphan_error: None,
            },
            Err(error) => WorkOutcome::Failed {
                error,
                old_deleted: false,
            },
        }
    }

    async fn replace(&self, attempts: &mut u32) -> WorkOutcome {
        let Some(prior) = &self.prior else {
            return WorkOutcome::Failed {
                error: String::from("no recorded instance to replace"),
                old_deleted: false,
            };
        };

        if self.create_before_delete {
            let created = match self.create(attempts).await {
                Ok(created) => created,
                Err(error) => {
                    return WorkOutcome::Failed {
                        error,
                        old_deleted: false,
                    };
                }
            };
            let orphan_error = self.delete(&prior.provider_id, attempts).await.err();
            return WorkOutcome::Applied {
                provider_id: created.provider_id,
                outputs: created.outputs,
                orphan_error,
            };
        }

        if let Err(error) = self.delete(&prior.provider_id, attempts).await {
            return WorkOutcome::Failed {
                error,
                old_deleted: false,
            };
        }
        match self.create(attempts).await {
            Ok(created) => WorkOutcome::Applied {
                provider_id: created.provider_id,
                outputs: created.outputs,
                orphan_error: None,
            },
            Err(error) => WorkOutcome::Failed {
                error,
                old_deleted: true,
            },
        }
    }

    /// Deletes an instance; an instance that is already gone counts as deleted.
    async fn delete(&self, provider_id: &str, attempts: &mut u32) -> std::result::Result<(), String> {
        let provider = &self.provider;
        let resource_type = self.id.resource_type.as_str();
        self.call(&format!("delete {}", self.id), attempts, move || async move {
            match provider.delete(resource_type, provider_id).await {
                Err(ProviderError::NotFound { provider_id: gone }) => {
                    debug!("{gone} already gone");
                    Ok(())
                }
                other => other,
            }
        })
        .await
    }

    async fn call<T, F, Fut>(
        &self,
        what: &str,
        attempts: &mut u32,
        mut call: F,
    ) -> std::result::Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0u32;
        let events = self.events.clone();
        let id = self.id.clone();
        let counted = || {
            attempt += 1;
            if attempt > 1
                && let Some(events) = &events
            {
                let _ = events.send(ProgressEvent::Retrying {
                    id: id.clone(),
                    attempt,
                });
            }
            call()
        };

        match call_with_retry(&self.retry, what, counted).await {
            Ok((value, tries)) => {
                *attempts += tries;
                Ok(value)
            }
            Err((e, tries)) => {
                *attempts += tries;
                if e.is_retryable() {
                    Err(ReconcileError::MaxRetriesExceeded {
                        attempts: tries,
                        resource: self.id.to_string(),
                        last_error: e.to_string(),
                    }
                    .to_string())
                } else {
                    Err(e.to_string())
                }
            }
        }
    }
}

const fn done_verb(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Create => "created",
        OperationKind::Update => "updated",
        OperationKind::Replace => "replaced",
        OperationKind::Delete => "deleted",
        OperationKind::NoOp => "unchanged",
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
