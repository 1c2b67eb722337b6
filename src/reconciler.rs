//! Reconciler for converging recorded state towards declarations.
//!
//! Every mutating run follows the same path: validate, acquire the state
//! lock, load the snapshot, plan, execute, record outputs and history,
//! save, and release the lock on every exit path.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigValidator, InputHasher, StackConfig};
use crate::error::{ProviderError, Result};
use crate::graph::{
    AttributeMap, GraphBuilder, InputValue, OutputRef, ResourceDeclaration, ResourceGraph,
    ResourceId, Resolved,
};
use crate::planner::{
    CancellationToken, ExecutionResult, ExecutorOptions, OperationResult, Plan, PlanExecutor,
    ProgressEvent,
};
use crate::provider::{ProviderRegistry, RetryPolicy, call_with_retry};
use crate::state::{
    RunCounts, RunHistoryEntry, RunOperation, StateSnapshot, StateStore, generate_holder_id,
};

/// Reconciler for one stack.
pub struct Reconciler<'a, S: StateStore> {
    /// Stack configuration.
    config: &'a StackConfig,
    /// State store.
    store: &'a S,
    /// Providers by resource type.
    registry: &'a ProviderRegistry,
    /// Stack hasher.
    hasher: InputHasher,
    /// Execution settings.
    options: ExecutorOptions,
    /// Cancellation shared with the caller.
    cancel: CancellationToken,
    /// Progress channel.
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    /// Lock holder identity.
    holder: String,
}

/// Result of an apply or destroy run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    /// Kind of run.
    pub operation: RunOperation,
    /// Whether every operation succeeded.
    pub success: bool,
    /// Per-kind counts.
    pub counts: RunCounts,
    /// Per-operation results.
    pub results: Vec<OperationResult>,
    /// Resolved stack outputs.
    pub outputs: AttributeMap,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Whether the run hit its timeout.
    pub timed_out: bool,
    /// Snapshot serial after the run.
    pub serial: u64,
    /// Total wall time.
    pub duration_ms: u64,
}

/// Result of a refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Resources read.
    pub checked: usize,
    /// Resources whose outputs changed.
    pub updated: Vec<ResourceId>,
    /// Resources that no longer exist.
    pub removed: Vec<ResourceId>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources that have drifted.
    pub drifted: Vec<DriftedResource>,
    /// Number of recorded resources checked.
    pub checked: usize,
}

/// One drifted resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftedResource {
    /// Resource identity.
    pub id: ResourceId,
    /// Provider identifier.
    pub provider_id: String,
    /// Output attributes whose live value differs; empty when missing.
    pub changed_outputs: Vec<String>,
    /// Whether the resource no longer exists.
    pub missing: bool,
}

/// Live view of one recorded resource.
struct Observation {
    id: ResourceId,
    live: Option<AttributeMap>,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a StackConfig, store: &'a S, registry: &'a ProviderRegistry) -> Self {
        Self {
            config,
            store,
            registry,
            hasher: InputHasher::new(),
            options: ExecutorOptions::from_engine(&config.engine),
            cancel: CancellationToken::new(),
            events: None,
            holder: generate_holder_id(),
        }
    }

    /// Overrides execution settings.
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

    /// Sets the progress channel.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates the stack and builds its resource graph.
    ///
    /// # Errors
    ///
    /// Returns a validation error on malformed declarations, unknown
    /// references or types, or a dependency cycle.
    pub fn build_graph(&self) -> Result<ResourceGraph> {
        let validation = ConfigValidator::new()
            .with_registry(self.registry)
            .validate(self.config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let declarations = self
            .config
            .resources
            .iter()
            .map(ResourceDeclaration::from_config)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let graph = GraphBuilder::new().declare_all(declarations).build()?;

        debug!("Built graph with {} resources", graph.len());
        Ok(graph)
    }

    /// Computes a plan without changing anything.
    ///
    /// With `refresh`, recorded outputs are replaced with live ones in
    /// memory before planning.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, state cannot be loaded, or a
    /// refresh read fails.
    pub async fn plan(&self, refresh: bool) -> Result<Plan> {
        let graph = self.build_graph()?;
        let mut snapshot = self.load().await?;
        if refresh {
            self.refresh_snapshot(&mut snapshot).await?;
        }
        let plan = Plan::build(&graph, &snapshot, self.registry, self.stack_hash())?;
        info!("Plan: {}", plan.summary());
        Ok(plan)
    }

    /// Converges recorded state towards the declarations.
    ///
    /// # Errors
    ///
    /// Returns an error on validation failure, if the lock is held by
    /// another run, or if state cannot be written. Provider failures are
    /// reported in the result instead.
    pub async fn apply(&self, refresh: bool) -> Result<ReconciliationResult> {
        info!(
            "Applying stack {}/{}",
            self.config.stack.name, self.config.stack.environment
        );
        let graph = self.build_graph()?;

        let lock = self.store.acquire_lock(&self.holder).await?;
        let outcome = self.apply_locked(&graph, refresh).await;
        self.release(&lock.lock_id).await;
        outcome
    }

    async fn apply_locked(&self, graph: &ResourceGraph, refresh: bool) -> Result<ReconciliationResult> {
        let mut snapshot = self.load().await?;
        if refresh {
            self.refresh_snapshot(&mut snapshot).await?;
        }

        let plan = Plan::build(graph, &snapshot, self.registry, self.stack_hash())?;
        info!("Plan: {}", plan.summary());

        let execution = self.executor(graph).execute(&plan, &mut snapshot).await?;
        snapshot.outputs = self.resolve_outputs(graph, &snapshot);
        self.finish(RunOperation::Apply, snapshot, execution).await
    }

    /// Deletes every recorded resource in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held by another run or state cannot
    /// be loaded or written.
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        info!(
            "Destroying stack {}/{}",
            self.config.stack.name, self.config.stack.environment
        );
        let lock = self.store.acquire_lock(&self.holder).await?;
        let outcome = self.destroy_locked().await;
        self.release(&lock.lock_id).await;
        outcome
    }

    async fn destroy_locked(&self) -> Result<ReconciliationResult> {
        let mut snapshot = self.load().await?;
        let plan = Plan::destroy(&snapshot, self.stack_hash());
        let graph = ResourceGraph::default();

        let execution = self.executor(&graph).execute(&plan, &mut snapshot).await?;
        if snapshot.resources.is_empty() {
            snapshot.outputs.clear();
        }
        self.finish(RunOperation::Destroy, snapshot, execution).await
    }

    /// Replaces recorded outputs with live ones and drops resources that no
    /// longer exist, then saves.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held, a read fails, or state cannot
    /// be written.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let lock = self.store.acquire_lock(&self.holder).await?;
        let outcome = self.refresh_locked().await;
        self.release(&lock.lock_id).await;
        outcome
    }

    async fn refresh_locked(&self) -> Result<RefreshReport> {
        let mut snapshot = self.load().await?;
        let report = self.refresh_snapshot(&mut snapshot).await?;

        let counts = RunCounts {
            updated: report.updated.len(),
            deleted: report.removed.len(),
            unchanged: report.checked - report.updated.len() - report.removed.len(),
            ..RunCounts::default()
        };
        snapshot.add_history(RunHistoryEntry::new(RunOperation::Refresh, counts, None));
        snapshot.bump_serial();
        self.store.save(&snapshot).await?;
        info!("{report}");
        Ok(report)
    }

    /// Compares live outputs with recorded ones without changing state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.config.stack.name, self.config.stack.environment
        );
        let snapshot = self.load().await?;
        let observations = self.observe(&snapshot).await?;

        let mut report = DriftReport {
            checked: observations.len(),
            ..DriftReport::default()
        };

        for observation in observations {
            let Some(recorded) = snapshot.get(&observation.id) else {
                continue;
            };
            match observation.live {
                None => report.drifted.push(DriftedResource {
                    id: observation.id,
                    provider_id: recorded.provider_id.clone(),
                    changed_outputs: Vec::new(),
                    missing: true,
                }),
                Some(live) => {
                    let changed_outputs: Vec<String> = recorded
                        .outputs
                        .keys()
                        .chain(live.keys())
                        .filter(|k| recorded.outputs.get(*k) != live.get(*k))
                        .cloned()
                        .collect::<std::collections::BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    if !changed_outputs.is_empty() {
                        report.drifted.push(DriftedResource {
                            id: observation.id,
                            provider_id: recorded.provider_id.clone(),
                            changed_outputs,
                            missing: false,
                        });
                    }
                }
            }
        }

        report.has_drift = !report.drifted.is_empty();
        Ok(report)
    }

    async fn load(&self) -> Result<StateSnapshot> {
        self.store
            .load_or_default(&self.config.stack.name, &self.config.stack.environment)
            .await
    }

    async fn release(&self, lock_id: &str) {
        if let Err(e) = self.store.release_lock(lock_id).await {
            error!("Failed to release state lock {lock_id}: {e}");
        }
    }

    fn executor<'g>(&'g self, graph: &'g ResourceGraph) -> PlanExecutor<'g> {
        let executor = PlanExecutor::new(self.registry, self.store, graph)
            .with_options(self.options)
            .with_cancellation(self.cancel.clone());
        match &self.events {
            Some(events) => executor.with_events(events.clone()),
            None => executor,
        }
    }

    fn stack_hash(&self) -> String {
        self.hasher.hash_stack(self.config)
    }

    /// Records history and writes the final snapshot.
    async fn finish(
        &self,
        operation: RunOperation,
        mut snapshot: StateSnapshot,
        execution: ExecutionResult,
    ) -> Result<ReconciliationResult> {
        let error = execution.first_error().map(String::from).or_else(|| {
            if execution.cancelled {
                Some(String::from("run cancelled"))
            } else if execution.timed_out {
                Some(String::from("run timed out"))
            } else {
                None
            }
        });
        snapshot.add_history(RunHistoryEntry::new(operation, execution.counts, error));
        snapshot.bump_serial();
        self.store.save(&snapshot).await?;

        let result = ReconciliationResult {
            operation,
            success: execution.is_success(),
            counts: execution.counts,
            results: execution.results,
            outputs: snapshot.outputs.clone(),
            cancelled: execution.cancelled,
            timed_out: execution.timed_out,
            serial: snapshot.serial,
            duration_ms: execution.duration_ms,
        };

        if result.success {
            info!("{operation} complete: {}", result.counts);
        } else {
            warn!("{operation} finished with problems: {}", result.counts);
        }
        Ok(result)
    }

    /// Resolves the stack's declared outputs from recorded state.
    fn resolve_outputs(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> AttributeMap {
        let lookup = |r: &OutputRef| -> Option<Resolved> {
            let id = graph.id_of(&r.resource)?;
            snapshot
                .get(id)?
                .outputs
                .get(&r.output)
                .cloned()
                .map(Resolved::Known)
        };

        let mut outputs = AttributeMap::new();
        for (name, expr) in &self.config.outputs {
            let value = match InputValue::parse(&Value::String(expr.clone())) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Stack output {name} is malformed: {e}");
                    continue;
                }
            };
            match value.resolve(&lookup) {
                Ok(Resolved::Known(v)) => {
                    outputs.insert(name.clone(), v);
                }
                Ok(Resolved::Unknown) => {}
                Err(missing) => warn!("Stack output {name} unavailable: {missing} is not recorded"),
            }
        }
        outputs
    }

    /// Reads every recorded resource from its provider.
    async fn observe(&self, snapshot: &StateSnapshot) -> Result<Vec<Observation>> {
        let policy: RetryPolicy = self.options.retry;
        let mut observations = Vec::with_capacity(snapshot.resources.len());

        for state in snapshot.resources.values() {
            let Some(provider) = self.registry.provider_for(&state.id.resource_type) else {
                warn!("No provider for {}; skipping", state.id);
                continue;
            };
            let resource_type = state.id.resource_type.as_str();
            let provider_id = state.provider_id.as_str();
            let provider = &provider;

            let live = match call_with_retry(&policy, &format!("read {}", state.id), move || {
                provider.read(resource_type, provider_id)
            })
            .await
            {
                Ok((live, _)) => live,
                Err((ProviderError::NotFound { .. }, _)) => None,
                Err((e, _)) => return Err(e.into()),
            };

            debug!("Observed {} (exists: {})", state.id, live.is_some());
            observations.push(Observation {
                id: state.id.clone(),
                live,
            });
        }

        Ok(observations)
    }

    async fn refresh_snapshot(&self, snapshot: &mut StateSnapshot) -> Result<RefreshReport> {
        let observations = self.observe(snapshot).await?;
        let mut report = RefreshReport {
            checked: observations.len(),
            ..RefreshReport::default()
        };

        for observation in observations {
            match observation.live {
                None => {
                    warn!("{} no longer exists; it will be re-created", observation.id);
                    snapshot.remove(&observation.id);
                    report.removed.push(observation.id);
                }
                Some(live) => {
                    let Some(mut state) = snapshot.get(&observation.id).cloned() else {
                        continue;
                    };
                    if state.outputs != live {
                        debug!("Refreshed outputs of {}", observation.id);
                        state.outputs = live;
                        snapshot.upsert(state);
                        report.updated.push(observation.id);
                    }
                }
            }
        }

        Ok(report)
    }
}

impl DriftReport {
    /// Returns true if recorded state matches live state.
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for resource in &self.drifted {
                if resource.missing {
                    writeln!(f, "  - {} (missing)", resource.id)?;
                } else {
                    writeln!(
                        f,
                        "  - {} (changed: {})",
                        resource.id,
                        resource.changed_outputs.join(", ")
                    )?;
                }
            }
        } else {
            write!(f, "No drift detected - {} resources match recorded state", self.checked)?;
        }
        Ok(())
    }
}

impl fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Refreshed {} resources: {} updated, {} removed",
            self.checked,
            self.updated.len(),
            self.removed.len()
        )
    }
}

impl fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "successful" } else { "incomplete" };
        writeln!(f, "{} {status}:", capitalize(&self.operation.to_string()))?;
        writeln!(f, "  Created: {}", self.counts.created)?;
        writeln!(f, "  Updated: {}", self.counts.updated)?;
        writeln!(f, "  Replaced: {}", self.counts.replaced)?;
        writeln!(f, "  Deleted: {}", self.counts.deleted)?;
        writeln!(f, "  Unchanged: {}", self.counts.unchanged)?;

        if self.counts.failed > 0 || self.counts.skipped > 0 || self.counts.cancelled > 0 {
            writeln!(f, "  Failed: {}", self.counts.failed)?;
            writeln!(f, "  Skipped: {}", self.counts.skipped)?;
            writeln!(f, "  Cancelled: {}", self.counts.cancelled)?;
        }

        let errors: Vec<&OperationResult> =
            self.results.iter().filter(|r| r.error.is_some()).collect();
        if !errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for result in errors {
                writeln!(
                    f,
                    "    - {}: {}",
                    result.id,
                    result.error.as_deref().unwrap_or_default()
                )?;
            }
        }

        if !self.outputs.is_empty() {
            writeln!(f, "  Outputs:")?;
            for (name, value) in &self.outputs {
                writeln!(f, "    {name} = {value}")?;
            }
        }

        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().collect::<String>() + chars.as_str()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{ConvergeError, StateError, ValidationError};
    use crate::planner::{NodeStatus, OperationKind};
    use crate::provider::{CreatedResource, Provider, ProviderResult, ResourceSchema};
    use crate::state::{LocalStateStore, MemoryStateStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const STACK: &str = r#"
stack:
  name: test-stack
  environment: test
engine:
  concurrency: 4
  max_retries: 2
  backoff_base_ms: 1
  backoff_max_ms: 4
resources:
  - name: net
    type: test:net
    inputs:
      cidr: 10.0.0.0/16
  - name: sub
    type: test:subnet
    inputs:
      net_id: "${net.id}"
      cidr: 10.0.1.0/24
outputs:
  net_id: "${net.id}"
"#;

    struct FailRule {
        op: &'static str,
        resource_type: &'static str,
        remaining: usize,
        error: ProviderError,
    }

    /// Provider that keeps objects in memory and logs every mutating call.
    #[derive(Default)]
    struct RecordingProvider {
        calls: Mutex<Vec<String>>,
        objects: Mutex<BTreeMap<String, AttributeMap>>,
        failures: Mutex<Vec<FailRule>>,
        delay: Mutex<Option<Duration>>,
        next_id: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl RecordingProvider {
        fn fail(&self, op: &'static str, resource_type: &'static str, times: usize, error: ProviderError) {
            self.failures.lock().unwrap().push(FailRule {
                op,
                resource_type,
                remaining: times,
                error,
            });
        }

        fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn take_calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn tamper(&self, provider_id: &str, key: &str, value: Value) {
            if let Some(outputs) = self.objects.lock().unwrap().get_mut(provider_id) {
                outputs.insert(key.to_string(), value);
            }
        }

        fn forget(&self, provider_id: &str) {
            self.objects.lock().unwrap().remove(provider_id);
        }

        fn injected(&self, op: &str, resource_type: &str) -> Option<ProviderError> {
            let mut rules = self.failures.lock().unwrap();
            let rule = rules.iter_mut().find(|r| {
                r.op == op && r.resource_type == resource_type && r.remaining > 0
            })?;
            rule.remaining -= 1;
            Some(rule.error.clone())
        }

        async fn begin(&self, call: String) {
            self.calls.lock().unwrap().push(call);
            let delay = *self.delay.lock().unwrap();
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Provider for RecordingProvider {
        fn schemas(&self) -> Vec<ResourceSchema> {
            vec![
                ResourceSchema::new("test:net")
                    .replace_required("cidr")
                    .update_in_place("tags"),
                ResourceSchema::new("test:subnet")
                    .replace_required("net_id")
                    .update_in_place("cidr"),
                ResourceSchema::new("test:dns").update_in_place("record"),
                ResourceSchema::new("test:cbd")
                    .replace_required("size")
                    .create_before_delete(),
            ]
        }

        async fn create(
            &self,
            resource_type: &str,
            inputs: &AttributeMap,
        ) -> ProviderResult<CreatedResource> {
            self.begin(format!("create {resource_type}")).await;
            if let Some(e) = self.injected("create", resource_type) {
                return Err(e);
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let provider_id = format!("{}-{n}", resource_type.trim_start_matches("test:"));
            let mut outputs = inputs.clone();
            outputs.insert(String::from("id"), json!(provider_id));
            self.objects
                .lock()
                .unwrap()
                .insert(provider_id.clone(), outputs.clone());
            Ok(CreatedResource {
                provider_id,
                outputs,
            })
        }

        async fn read(
            &self,
            _resource_type: &str,
            provider_id: &str,
        ) -> ProviderResult<Option<AttributeMap>> {
            Ok(self.objects.lock().unwrap().get(provider_id).cloned())
        }

        async fn update(
            &self,
            resource_type: &str,
            provider_id: &str,
            inputs: &AttributeMap,
        ) -> ProviderResult<AttributeMap> {
            self.begin(format!("update {provider_id}")).await;
            if let Some(e) = self.injected("update", resource_type) {
                return Err(e);
            }
            let mut objects = self.objects.lock().unwrap();
            let Some(outputs) = objects.get_mut(provider_id) else {
                return Err(ProviderError::NotFound {
                    provider_id: provider_id.to_string(),
                });
            };
            *outputs = inputs.clone();
            outputs.insert(String::from("id"), json!(provider_id));
            Ok(outputs.clone())
        }

        async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
            self.begin(format!("delete {provider_id}")).await;
            if let Some(e) = self.injected("delete", resource_type) {
                return Err(e);
            }
            match self.objects.lock().unwrap().remove(provider_id) {
                Some(_) => Ok(()),
                None => Err(ProviderError::NotFound {
                    provider_id: provider_id.to_string(),
                }),
            }
        }
    }

    fn stack(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("stack parses")
    }

    fn registry(provider: &Arc<RecordingProvider>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::clone(provider) as Arc<dyn Provider>)
            .expect("register");
        registry
    }

    fn net_id() -> ResourceId {
        ResourceId::new("test:net", "net")
    }

    fn sub_id() -> ResourceId {
        ResourceId::new("test:subnet", "sub")
    }

    fn result_for<'r>(result: &'r ReconciliationResult, id: &ResourceId) -> &'r OperationResult {
        result
            .results
            .iter()
            .find(|r| &r.id == id)
            .expect("operation result")
    }

    async fn saved(store: &MemoryStateStore) -> StateSnapshot {
        store.load().await.expect("load").expect("state saved")
    }

    #[tokio::test]
    async fn test_apply_creates_in_dependency_order() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();

        let result = Reconciler::new(&config, &store, &registry)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.success);
        assert_eq!(result.counts.created, 2);
        assert_eq!(provider.calls(), vec!["create test:net", "create test:subnet"]);
        assert_eq!(result.outputs.get("net_id"), Some(&json!("net-1")));

        let snapshot = saved(&store).await;
        let sub = snapshot.get(&sub_id()).expect("sub recorded");
        assert_eq!(sub.provider_id, "subnet-2");
        assert_eq!(sub.inputs.get("net_id"), Some(&json!("net-1")));
        assert_eq!(sub.dependencies, vec![String::from("test:net::net")]);
        assert_eq!(snapshot.history.len(), 1);
    }

    #[tokio::test]
    async fn test_second_apply_changes_nothing() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();
        let reconciler = Reconciler::new(&config, &store, &registry);

        let first = reconciler.apply(false).await.expect("first apply");
        provider.take_calls();

        let plan = reconciler.plan(false).await.expect("plan");
        assert!(!plan.has_changes());

        let second = reconciler.apply(false).await.expect("second apply");
        assert!(second.success);
        assert_eq!(second.counts.unchanged, 2);
        assert_eq!(second.counts.changed(), 0);
        assert!(provider.calls().is_empty());
        assert!(second.serial > first.serial);
    }

    #[tokio::test]
    async fn test_removed_declaration_deletes_only_that_resource() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let store = MemoryStateStore::new();

        let full = stack(STACK);
        Reconciler::new(&full, &store, &registry)
            .apply(false)
            .await
            .expect("apply");
        provider.take_calls();

        let net_only = stack(
            r"
stack:
  name: test-stack
  environment: test
resources:
  - name: net
    type: test:net
    inputs:
      cidr: 10.0.0.0/16
",
        );
        let result = Reconciler::new(&net_only, &store, &registry)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.success);
        assert_eq!(provider.calls(), vec!["delete subnet-2"]);
        assert_eq!(result.counts.deleted, 1);
        assert_eq!(result.counts.unchanged, 1);

        let snapshot = saved(&store).await;
        assert!(snapshot.get(&sub_id()).is_none());
        assert!(snapshot.get(&net_id()).is_some());
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_siblings() {
        let provider = Arc::new(RecordingProvider::default());
        provider.fail("create", "test:net", 1, ProviderError::permanent("quota exceeded"));
        let registry = registry(&provider);
        let config = stack(
            r#"
stack:
  name: test-stack
  environment: test
resources:
  - name: net
    type: test:net
    inputs:
      cidr: 10.0.0.0/16
  - name: sub
    type: test:subnet
    inputs:
      net_id: "${net.id}"
  - name: dns
    type: test:dns
    inputs:
      record: app.example.com
"#,
        );
        let store = MemoryStateStore::new();

        let result = Reconciler::new(&config, &store, &registry)
            .apply(false)
            .await
            .expect("provider failures are reported, not raised");

        assert!(!result.success);
        assert_eq!(result.counts.failed, 1);
        assert_eq!(result.counts.skipped, 1);
        assert_eq!(result.counts.created, 1);
        assert!(!provider.calls().contains(&String::from("create test:subnet")));

        let net = result_for(&result, &net_id());
        assert_eq!(net.status, NodeStatus::Failed);
        assert!(net.error.as_deref().unwrap_or_default().contains("quota exceeded"));
        assert_eq!(result_for(&result, &sub_id()).status, NodeStatus::Skipped);

        let snapshot = saved(&store).await;
        assert!(snapshot.get(&ResourceId::new("test:dns", "dns")).is_some());
        assert!(snapshot.get(&net_id()).is_none());
        let last = snapshot.history.last().expect("history");
        assert!(!last.success);
    }

    #[tokio::test]
    async fn test_replace_passes_fresh_outputs_downstream() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let store = MemoryStateStore::new();

        Reconciler::new(&stack(STACK), &store, &registry)
            .apply(false)
            .await
            .expect("apply");
        provider.take_calls();

        let changed = stack(&STACK.replace("10.0.0.0/16", "10.1.0.0/16"));
        let reconciler = Reconciler::new(&changed, &store, &registry);

        let plan = reconciler.plan(false).await.expect("plan");
        assert_eq!(plan.count(OperationKind::Replace), 2);

        let result = reconciler.apply(false).await.expect("apply");
        assert!(result.success);
        assert_eq!(result.counts.replaced, 2);
        assert_eq!(result.counts.deleted, 0);
        assert_eq!(
            provider.calls(),
            vec!["delete subnet-2", "delete net-1", "create test:net", "create test:subnet"]
        );

        let snapshot = saved(&store).await;
        let sub = snapshot.get(&sub_id()).expect("sub recorded");
        assert_eq!(sub.inputs.get("net_id"), Some(&json!("net-3")));
        assert_eq!(result.outputs.get("net_id"), Some(&json!("net-3")));
    }

    #[tokio::test]
    async fn test_removed_dependent_deleted_before_upstream_is_replaced() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let store = MemoryStateStore::new();

        Reconciler::new(&stack(STACK), &store, &registry)
            .apply(false)
            .await
            .expect("apply");
        provider.take_calls();

        let net_only = stack(
            r"
stack:
  name: test-stack
  environment: test
engine:
  concurrency: 1
resources:
  - name: net
    type: test:net
    inputs:
      cidr: 10.1.0.0/16
",
        );
        let result = Reconciler::new(&net_only, &store, &registry)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.success);
        assert_eq!(
            provider.calls(),
            vec!["delete subnet-2", "delete net-1", "create test:net"]
        );
        assert_eq!(result.counts.replaced, 1);
        assert_eq!(result.counts.deleted, 1);

        let snapshot = saved(&store).await;
        assert!(snapshot.get(&sub_id()).is_none());
        assert_eq!(snapshot.get(&net_id()).expect("net").provider_id, "net-3");
    }

    #[tokio::test]
    async fn test_create_before_delete_replacement() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let store = MemoryStateStore::new();
        let disk = |size: u32| {
            stack(&format!(
                "
stack:
  name: test-stack
  environment: test
resources:
  - name: disk
    type: test:cbd
    inputs:
      size: {size}
"
            ))
        };

        Reconciler::new(&disk(10), &store, &registry)
            .apply(false)
            .await
            .expect("apply");
        provider.take_calls();

        let result = Reconciler::new(&disk(20), &store, &registry)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.success);
        assert_eq!(provider.calls(), vec!["create test:cbd", "delete cbd-1"]);
        let snapshot = saved(&store).await;
        let recorded = snapshot
            .get(&ResourceId::new("test:cbd", "disk"))
            .expect("disk recorded");
        assert_eq!(recorded.provider_id, "cbd-2");
        assert!(snapshot.pending_deletes.is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_instance_is_deleted_on_next_run() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let store = MemoryStateStore::new();
        let disk = |size: u32| {
            stack(&format!(
                "
stack:
  name: test-stack
  environment: test
resources:
  - name: disk
    type: test:cbd
    inputs:
      size: {size}
"
            ))
        };

        Reconciler::new(&disk(10), &store, &registry)
            .apply(false)
            .await
            .expect("apply");
        provider.fail("delete", "test:cbd", 1, ProviderError::permanent("in use"));

        let replaced = Reconciler::new(&disk(20), &store, &registry)
            .apply(false)
            .await
            .expect("apply");
        assert!(replaced.success);
        let id = ResourceId::new("test:cbd", "disk");
        assert!(result_for(&replaced, &id).warning.is_some());
        assert_eq!(saved(&store).await.pending_deletes.len(), 1);
        provider.take_calls();

        let cleanup = Reconciler::new(&disk(20), &store, &registry)
            .apply(false)
            .await
            .expect("apply");
        assert!(cleanup.success);
        assert_eq!(provider.calls(), vec!["delete cbd-1"]);
        let snapshot = saved(&store).await;
        assert!(snapshot.pending_deletes.is_empty());
        assert_eq!(snapshot.get(&id).expect("disk").provider_id, "cbd-2");
    }

    #[tokio::test]
    async fn test_update_in_place_leaves_dependents_alone() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let store = MemoryStateStore::new();

        Reconciler::new(&stack(STACK), &store, &registry)
            .apply(false)
            .await
            .expect("apply");
        let created_at = saved(&store).await.get(&net_id()).expect("net").created_at;
        provider.take_calls();

        let tagged = stack(&STACK.replace(
            "      cidr: 10.0.0.0/16\n",
            "      cidr: 10.0.0.0/16\n      tags: prod\n",
        ));
        let result = Reconciler::new(&tagged, &store, &registry)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.success);
        assert_eq!(provider.calls(), vec!["update net-1"]);
        assert_eq!(result.counts.updated, 1);
        assert_eq!(result.counts.unchanged, 1);

        let snapshot = saved(&store).await;
        let net = snapshot.get(&net_id()).expect("net");
        assert_eq!(net.provider_id, "net-1");
        assert_eq!(net.created_at, created_at);
        assert_eq!(net.outputs.get("tags"), Some(&json!("prod")));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_any_call() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(
            r#"
stack:
  name: test-stack
  environment: test
resources:
  - name: a
    type: test:dns
    inputs:
      record: "${b.id}"
  - name: b
    type: test:dns
    inputs:
      record: "${a.id}"
"#,
        );
        let store = MemoryStateStore::new();

        let err = Reconciler::new(&config, &store, &registry)
            .apply(false)
            .await
            .expect_err("cycle");

        assert!(matches!(
            err,
            ConvergeError::Validation(ValidationError::Cycle { .. })
        ));
        assert!(provider.calls().is_empty());
        assert_eq!(store.save_count(), 0);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_missing_output_reference_fails_dependent() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(&STACK.replace("${net.id}\"\n      cidr", "${net.gateway}\"\n      cidr"));
        let store = MemoryStateStore::new();

        let result = Reconciler::new(&config, &store, &registry)
            .apply(false)
            .await
            .expect("apply");

        assert_eq!(result.counts.created, 1);
        assert_eq!(result.counts.failed, 1);
        let sub = result_for(&result, &sub_id());
        assert_eq!(sub.attempts, 0);
        assert!(sub.error.as_deref().unwrap_or_default().contains("net.gateway"));
        assert_eq!(provider.calls(), vec!["create test:net"]);
    }

    #[tokio::test]
    async fn test_state_round_trips_through_local_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(STACK);

        {
            let store = LocalStateStore::with_base_dir(dir.path().join(".converge"));
            Reconciler::new(&config, &store, &registry)
                .apply(false)
                .await
                .expect("apply");
        }

        let reopened = LocalStateStore::with_base_dir(dir.path().join(".converge"));
        let snapshot = reopened.load().await.expect("load").expect("state saved");
        assert_eq!(snapshot.resources.len(), 2);
        assert_eq!(snapshot.outputs.get("net_id"), Some(&json!("net-1")));

        let plan = Reconciler::new(&config, &reopened, &registry)
            .plan(false)
            .await
            .expect("plan");
        assert!(!plan.has_changes());
    }

    #[tokio::test]
    async fn test_destroy_deletes_in_reverse_order() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();
        let reconciler = Reconciler::new(&config, &store, &registry);

        reconciler.apply(false).await.expect("apply");
        provider.take_calls();

        let result = reconciler.destroy().await.expect("destroy");
        assert!(result.success);
        assert_eq!(result.operation, RunOperation::Destroy);
        assert_eq!(provider.calls(), vec!["delete subnet-2", "delete net-1"]);
        assert!(result.outputs.is_empty());

        let snapshot = saved(&store).await;
        assert!(snapshot.is_empty());
        assert_eq!(
            snapshot.history.last().map(|h| h.operation),
            Some(RunOperation::Destroy)
        );
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let provider = Arc::new(RecordingProvider::default());
        provider.set_delay(Duration::from_millis(20));
        let registry = registry(&provider);
        let config = stack(
            r"
stack:
  name: test-stack
  environment: test
resources:
  - name: a
    type: test:dns
    inputs:
      record: a.example.com
  - name: b
    type: test:dns
    inputs:
      record: b.example.com
  - name: c
    type: test:dns
    inputs:
      record: c.example.com
  - name: d
    type: test:dns
    inputs:
      record: d.example.com
",
        );
        let store = MemoryStateStore::new();
        let options = ExecutorOptions {
            concurrency: 2,
            ..ExecutorOptions::from_engine(&config.engine)
        };

        let result = Reconciler::new(&config, &store, &registry)
            .with_options(options)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.success);
        assert_eq!(result.counts.created, 4);
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_work_finish() {
        let provider = Arc::new(RecordingProvider::default());
        provider.set_delay(Duration::from_millis(100));
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = Reconciler::new(&config, &store, &registry)
            .with_cancellation(token)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.counts.created, 1);
        assert_eq!(result.counts.cancelled, 1);
        assert_eq!(result_for(&result, &sub_id()).status, NodeStatus::Cancelled);
        assert_eq!(provider.calls(), vec!["create test:net"]);

        let snapshot = saved(&store).await;
        assert!(snapshot.get(&net_id()).is_some());
        assert!(snapshot.get(&sub_id()).is_none());
    }

    #[tokio::test]
    async fn test_run_timeout_stops_dispatch() {
        let provider = Arc::new(RecordingProvider::default());
        provider.set_delay(Duration::from_millis(100));
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();
        let options = ExecutorOptions {
            run_timeout: Some(Duration::from_millis(20)),
            ..ExecutorOptions::from_engine(&config.engine)
        };

        let result = Reconciler::new(&config, &store, &registry)
            .with_options(options)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.timed_out);
        assert!(!result.cancelled);
        assert_eq!(result.counts.created, 1);
        assert_eq!(result.counts.cancelled, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(RecordingProvider::default());
        provider.fail("create", "test:net", 2, ProviderError::transient("throttled"));
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();
        let (events, mut receiver) = mpsc::unbounded_channel();

        let result = Reconciler::new(&config, &store, &registry)
            .with_events(events)
            .apply(false)
            .await
            .expect("apply");

        assert!(result.success);
        assert_eq!(result_for(&result, &net_id()).attempts, 3);
        assert_eq!(
            provider
                .calls()
                .iter()
                .filter(|c| *c == "create test:net")
                .count(),
            3
        );

        let mut retries = 0;
        let mut finished = 0;
        while let Ok(event) = receiver.try_recv() {
            match event {
                ProgressEvent::Retrying { .. } => retries += 1,
                ProgressEvent::Finished { .. } => finished += 1,
                _ => {}
            }
        }
        assert_eq!(retries, 2);
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_operation() {
        let provider = Arc::new(RecordingProvider::default());
        provider.fail("create", "test:net", 10, ProviderError::transient("throttled"));
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();

        let result = Reconciler::new(&config, &store, &registry)
            .apply(false)
            .await
            .expect("apply");

        let net = result_for(&result, &net_id());
        assert_eq!(net.status, NodeStatus::Failed);
        assert_eq!(net.attempts, 3);
        assert!(
            net.error
                .as_deref()
                .unwrap_or_default()
                .contains("Maximum retry attempts (3)")
        );
        assert_eq!(result.counts.skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_aborts_run() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();
        store.fail_saves_after(1).await;

        let err = Reconciler::new(&config, &store, &registry)
            .apply(false)
            .await
            .expect_err("save failure is fatal");

        assert!(matches!(err, ConvergeError::State(StateError::Io { .. })));
        assert_eq!(store.save_count(), 1);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_lock_held_by_another_run() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();
        store.acquire_lock("other-run").await.expect("lock");

        let err = Reconciler::new(&config, &store, &registry)
            .apply(false)
            .await
            .expect_err("locked");

        match err {
            ConvergeError::State(StateError::LockedByOther { holder, .. }) => {
                assert_eq!(holder, "other-run");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_drift_and_refresh() {
        let provider = Arc::new(RecordingProvider::default());
        let registry = registry(&provider);
        let config = stack(STACK);
        let store = MemoryStateStore::new();
        let reconciler = Reconciler::new(&config, &store, &registry);

        reconciler.apply(false).await.expect("apply");
        assert!(reconciler.check_drift().await.expect("drift").is_converged());

        provider.tamper("net-1", "cidr", json!("10.9.0.0/16"));
        provider.forget("subnet-2");

        let drift = reconciler.check_drift().await.expect("drift");
        assert!(drift.has_drift);
        assert_eq!(drift.checked, 2);
        let net = drift.drifted.iter().find(|d| d.id == net_id()).expect("net drifted");
        assert_eq!(net.changed_outputs, vec![String::from("cidr")]);
        let sub = drift.drifted.iter().find(|d| d.id == sub_id()).expect("sub drifted");
        assert!(sub.missing);

        let report = reconciler.refresh().await.expect("refresh");
        assert_eq!(report.updated, vec![net_id()]);
        assert_eq!(report.removed, vec![sub_id()]);

        let snapshot = saved(&store).await;
        assert_eq!(
            snapshot.history.last().map(|h| h.operation),
            Some(RunOperation::Refresh)
        );

        let plan = reconciler.plan(false).await.expect("plan");
        assert_eq!(plan.count(OperationKind::Create), 1);
        assert_eq!(plan.count(OperationKind::NoOp), 1);
    }
}
