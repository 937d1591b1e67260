//! Execution engine - applies a plan through providers with bounded concurrency
//!
//! Work is scheduled from the calling thread onto a rayon pool of
//! `parallelism` threads. A resource starts only once every dependency in
//! the run has succeeded. State is updated after each success, so an
//! interrupted run leaves state matching what was actually applied.
//!
//! A replace runs as two provider calls: delete through the provider of the
//! kind recorded in state, drop the state entry, then create through the
//! provider of the desired kind. A failed create leaves no entry behind, so
//! the next plan creates the resource.
//!
//! Nothing is rolled back remotely. Resources that failed or never started
//! are listed in [`ExecutionResult::manual_followup`].

use crate::config::ParsedConfig;
use crate::context::ProgressCallback;
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::plan::{ExecutionPlan, config_hash};
use crate::rate_limit::TokenBucket;
use crate::retry::RetryConfig;
use crate::state::{AppliedResource, LockOperation, OperationResult, StateStore};
use crate::types::{ChangeType, ResourceChange, ResourceConfig, ResourceKind};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Remote operations for one resource kind
///
/// Calls are blocking and run on worker threads. Timeouts and transport
/// retries belong to the implementation.
pub trait Provider: Send + Sync {
    fn create(&self, resource: &ResourceConfig) -> anyhow::Result<ProviderOutcome>;

    fn update(
        &self,
        remote_id: &str,
        resource: &ResourceConfig,
    ) -> anyhow::Result<ProviderOutcome>;

    fn delete(&self, kind: ResourceKind, name: &str, remote_id: &str) -> anyhow::Result<()>;
}

/// What the remote side reported after a create or update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutcome {
    pub remote_id: String,
    /// Hash of the remote representation, when the provider computes one
    pub remote_hash: Option<String>,
}

impl ProviderOutcome {
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            remote_hash: None,
        }
    }

    pub fn with_remote_hash(mut self, hash: impl Into<String>) -> Self {
        self.remote_hash = Some(hash.into());
        self
    }
}

/// Providers by resource kind
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ResourceKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One provider for every kind.
    pub fn all(provider: Arc<dyn Provider>) -> Self {
        let mut registry = Self::new();
        for kind in ResourceKind::ALL {
            registry.register(kind, Arc::clone(&provider));
        }
        registry
    }

    pub fn register(&mut self, kind: ResourceKind, provider: Arc<dyn Provider>) -> &mut Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Option<Arc<dyn Provider>> {
        self.providers.get(&kind).cloned()
    }
}

/// Options for [`Executor::execute`]
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Keep applying independent resources after a failure
    pub continue_on_error: bool,
    /// Maximum concurrent provider calls
    pub parallelism: usize,
    /// Push unchanged resources through `update` as well
    pub include_no_change: bool,
    /// Cap on provider calls started per second
    pub max_operations_per_second: Option<f64>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            parallelism: 4,
            include_no_change: false,
            max_operations_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    /// A dependency failed, so this was never started
    DependencyFailed,
    /// Not started because the run stopped or was interrupted
    Skipped,
}

/// Outcome for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceExecutionResult {
    pub name: String,
    pub kind: ResourceKind,
    pub change_type: ChangeType,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ResourceExecutionResult {
    fn new(change: &ResourceChange, status: ExecutionStatus) -> Self {
        Self {
            name: change.name.clone(),
            kind: change.kind,
            change_type: change.change_type,
            status,
            remote_id: None,
            error: None,
            duration_ms: 0,
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dependency_failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// One entry per attempted resource, in plan order
    pub results: Vec<ResourceExecutionResult>,
    pub summary: ExecutionSummary,
    pub plan_id: String,
    /// Always false: failed runs are not reverted remotely
    pub rolled_back: bool,
    /// Resources that need attention after a failed run
    pub manual_followup: Vec<String>,
    pub interrupted: bool,
}

/// Answer from [`Executor::can_execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReadiness {
    pub ready: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Pending,
    Running,
    /// First half of a replace is done; the create has not started
    Deleted,
    Done(ExecutionStatus),
}

/// One provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Create,
    Update,
    Delete,
}

impl Step {
    fn first(change_type: ChangeType) -> Self {
        match change_type {
            ChangeType::Create => Self::Create,
            ChangeType::Update | ChangeType::NoChange => Self::Update,
            ChangeType::Replace | ChangeType::Delete => Self::Delete,
        }
    }
}

enum DependencyState {
    Ready,
    Waiting,
    Failed(String),
}

type WorkerOutcome = std::result::Result<Option<ProviderOutcome>, String>;

/// Applies plans against one state store
pub struct Executor<'a> {
    store: &'a StateStore,
    providers: ProviderRegistry,
    lock_retry: RetryConfig,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a StateStore, providers: ProviderRegistry) -> Self {
        Self {
            store,
            providers,
            lock_retry: RetryConfig::default(),
        }
    }

    /// Backoff used while waiting for the apply lock.
    pub fn with_lock_retry(mut self, retry: RetryConfig) -> Self {
        self.lock_retry = retry;
        self
    }

    /// Check that nothing would stop a run from starting.
    pub fn can_execute(&self) -> ExecutionReadiness {
        if let Ok(Some(status)) = self.store.read_lock()
            && !status.is_stale
        {
            return ExecutionReadiness {
                ready: false,
                reason: Some(format!(
                    "Another {} operation is in progress (PID {}, started {}); \
                     wait for it to finish or remove the lock if that process is gone",
                    status.lock.operation,
                    status.lock.pid,
                    status.lock.created_at.to_rfc3339()
                )),
            };
        }
        if let Err(e) = self.store.load_state() {
            return ExecutionReadiness {
                ready: false,
                reason: Some(format!("{e}. {}", e.category().advice())),
            };
        }
        ExecutionReadiness {
            ready: true,
            reason: None,
        }
    }

    /// Apply `plan`, which must have been generated from `config`.
    pub fn execute(
        &self,
        plan: &ExecutionPlan,
        config: &ParsedConfig,
        options: &ExecuteOptions,
        progress: &mut dyn ProgressCallback,
    ) -> Result<ExecutionResult> {
        let current = config_hash(config);
        if current != plan.metadata.config_hash {
            return Err(Error::PlanConfigMismatch {
                planned: plan.metadata.config_hash.clone(),
                current,
            });
        }
        if let Some(rate) = options.max_operations_per_second
            && !(rate.is_finite() && rate > 0.0)
        {
            return Err(Error::validation(format!(
                "max_operations_per_second must be a positive number, got {rate}"
            )));
        }
        if plan.compute_content_hash() != plan.metadata.content_hash {
            return Err(Error::validation(format!(
                "plan {} was modified after it was generated",
                plan.metadata.plan_id
            )));
        }

        let _lock = self.store.lock(LockOperation::Apply, &self.lock_retry)?;

        let state = self.store.load_state()?;
        for change in &plan.changes {
            let recorded = state.get(&change.name).map(|e| &e.last_applied_hash);
            if recorded != change.current_hash.as_ref() {
                return Err(Error::validation(format!(
                    "state for {} changed since plan {} was generated; plan again",
                    change.name, plan.metadata.plan_id
                )));
            }
        }

        let work: Vec<&ResourceChange> = plan
            .changes
            .iter()
            .filter(|c| c.change_type.is_change() || options.include_no_change)
            .collect();

        log::info!(
            "Applying plan {}: {} resources, parallelism {}",
            plan.metadata.plan_id,
            work.len(),
            options.parallelism.max(1)
        );

        let started = Instant::now();
        let results = self.run(&work, plan, config, options, progress)?;
        Ok(self.finish(plan, results, started.elapsed()))
    }

    fn run(
        &self,
        work: &[&ResourceChange],
        plan: &ExecutionPlan,
        config: &ParsedConfig,
        options: &ExecuteOptions,
        progress: &mut dyn ProgressCallback,
    ) -> Result<Vec<ResourceExecutionResult>> {
        let parallelism = options.parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("converge-apply-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("Failed to create thread pool: {e}")))?;

        let index_of: HashMap<&str, usize> = work
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();
        let mut slots = vec![Slot::Pending; work.len()];
        let mut results: Vec<Option<ResourceExecutionResult>> = vec![None; work.len()];
        let mut limiter = options.max_operations_per_second.map(TokenBucket::per_second);
        let cancel = &self.store.context().cancel;
        let config_file = match plan.metadata.config_files.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        };

        progress.on_start(work.len());

        let (tx, rx) = mpsc::channel::<(usize, Step, WorkerOutcome, Duration)>();
        let mut spent = vec![Duration::ZERO; work.len()];
        let mut running = 0usize;
        let mut halted = false;

        pool.in_place_scope(|scope| {
            loop {
                for i in 0..work.len() {
                    if running >= parallelism || cancel.is_cancelled() {
                        break;
                    }
                    let change = work[i];
                    let step = match slots[i] {
                        // A started replace is finished even after a failure elsewhere
                        Slot::Deleted => Step::Create,
                        Slot::Pending if !halted => Step::first(change.change_type),
                        _ => continue,
                    };

                    if matches!(slots[i], Slot::Pending) {
                        match dependency_state(change, &index_of, &slots) {
                            DependencyState::Waiting => continue,
                            DependencyState::Failed(dep) => {
                                log::debug!(
                                    "Not starting {}: dependency {dep} failed",
                                    change.name
                                );
                                let result = ResourceExecutionResult::new(
                                    change,
                                    ExecutionStatus::DependencyFailed,
                                )
                                .with_error(format!("dependency {dep} did not apply"));
                                slots[i] = Slot::Done(ExecutionStatus::DependencyFailed);
                                progress.on_resource_complete(&result);
                                results[i] = Some(result);
                                continue;
                            }
                            DependencyState::Ready => {}
                        }
                    }

                    let (Some(remover), Some(creator)) = (
                        self.providers.get(change.existing_kind()),
                        self.providers.get(change.kind),
                    ) else {
                        let missing = if self.providers.get(change.kind).is_none() {
                            change.kind
                        } else {
                            change.existing_kind()
                        };
                        let result = ResourceExecutionResult::new(change, ExecutionStatus::Failed)
                            .with_error(format!("no provider registered for {missing}"));
                        slots[i] = Slot::Done(ExecutionStatus::Failed);
                        progress.on_resource_complete(&result);
                        results[i] = Some(result);
                        halted = !options.continue_on_error;
                        if halted {
                            break;
                        }
                        continue;
                    };

                    if let Some(limiter) = limiter.as_mut() {
                        limiter.acquire();
                    }
                    if cancel.is_cancelled() {
                        break;
                    }

                    let owned = change.clone();
                    let resource = config.get(&change.name);
                    let tx = tx.clone();
                    log::debug!("Starting {step:?} for {} {}", change.change_type, change.name);
                    if matches!(slots[i], Slot::Pending) {
                        progress.on_resource_start(change);
                    }
                    slots[i] = Slot::Running;
                    running += 1;
                    scope.spawn(move |_| {
                        let start = Instant::now();
                        let provider = if step == Step::Delete { remover } else { creator };
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            apply_step(step, provider.as_ref(), &owned, resource.as_ref())
                        }))
                        .unwrap_or_else(|payload| Err(anyhow!(panic_message(&*payload))))
                        .map_err(|e| format!("{e:#}"));
                        // Receiver outlives the scope
                        let _ = tx.send((i, step, outcome, start.elapsed()));
                    });
                }

                if running == 0 {
                    break;
                }
                let Ok((i, step, mut outcome, elapsed)) = rx.recv() else {
                    break;
                };
                running -= 1;
                spent[i] += elapsed;

                let change = work[i];
                if change.change_type == ChangeType::Replace {
                    match step {
                        Step::Delete if outcome.is_ok() => {
                            let removed = self.store.remove_resource(&change.name);
                            if removed.success {
                                log::debug!("Deleted {}, recreating it", change.name);
                                slots[i] = Slot::Deleted;
                                continue;
                            }
                            outcome = Err(format!(
                                "deleted remotely but state was not updated: {}",
                                removed.error.unwrap_or(removed.message)
                            ));
                        }
                        Step::Create => {
                            outcome =
                                outcome.map_err(|e| format!("deleted, but recreating failed: {e}"));
                        }
                        _ => {}
                    }
                }

                let mut result = ResourceExecutionResult::new(change, ExecutionStatus::Succeeded);
                result.duration_ms = millis(spent[i]);

                let recorded = outcome.and_then(|outcome| {
                    result.remote_id = outcome
                        .as_ref()
                        .map(|o| o.remote_id.clone())
                        .or_else(|| change.remote_id.clone());
                    let saved = self.record(change, config, outcome, config_file.as_ref());
                    if saved.success {
                        Ok(())
                    } else {
                        Err(format!(
                            "applied remotely but state was not updated: {}",
                            saved.error.unwrap_or(saved.message)
                        ))
                    }
                });

                if let Err(error) = recorded {
                    log::warn!("{} {} failed: {error}", change.change_type, change.name);
                    result.status = ExecutionStatus::Failed;
                    result.error = Some(error);
                    if !options.continue_on_error {
                        halted = true;
                    }
                } else {
                    log::debug!("{} {} succeeded", change.change_type, change.name);
                }
                slots[i] = Slot::Done(result.status);
                progress.on_resource_complete(&result);
                results[i] = Some(result);
            }
        });

        // Anything still pending never started
        let interrupted = cancel.is_cancelled();
        let mut finished = Vec::with_capacity(work.len());
        for (i, result) in results.into_iter().enumerate() {
            let result = result.unwrap_or_else(|| {
                let change = work[i];
                let (status, reason) = match dependency_state(change, &index_of, &slots) {
                    _ if matches!(slots[i], Slot::Deleted) => (
                        ExecutionStatus::Skipped,
                        "deleted but not recreated before the run was interrupted".to_string(),
                    ),
                    DependencyState::Failed(dep) => (
                        ExecutionStatus::DependencyFailed,
                        format!("dependency {dep} did not apply"),
                    ),
                    _ if interrupted => (ExecutionStatus::Skipped, "interrupted".to_string()),
                    _ if halted => (
                        ExecutionStatus::Skipped,
                        "not started after an earlier failure".to_string(),
                    ),
                    _ => (
                        ExecutionStatus::Skipped,
                        "dependencies never completed".to_string(),
                    ),
                };
                let mut result = ResourceExecutionResult::new(change, status).with_error(reason);
                result.duration_ms = millis(spent[i]);
                progress.on_resource_complete(&result);
                result
            });
            finished.push(result);
        }
        Ok(finished)
    }

    /// Write the successful outcome to state.
    fn record(
        &self,
        change: &ResourceChange,
        config: &ParsedConfig,
        outcome: Option<ProviderOutcome>,
        config_file: Option<&String>,
    ) -> OperationResult {
        if change.change_type == ChangeType::Delete {
            return self.store.remove_resource(&change.name);
        }
        let (Some(outcome), Some(resource)) = (outcome, config.get(&change.name)) else {
            return OperationResult::failed(
                format!("Nothing to record for {}", change.name),
                "provider returned no remote id",
            );
        };

        let mut applied = AppliedResource::new(
            change.kind,
            &change.name,
            outcome.remote_id,
            fingerprint(&resource.config),
        );
        applied.remote_hash = outcome.remote_hash;
        applied.config_file = config_file.cloned();
        applied.resource_type = config.discriminator(&change.name).map(String::from);
        applied.depends_on.clone_from(&change.dependencies);
        applied.config = Some(resource.config);
        self.store.update_resource(applied)
    }

    fn finish(
        &self,
        plan: &ExecutionPlan,
        results: Vec<ResourceExecutionResult>,
        elapsed: Duration,
    ) -> ExecutionResult {
        let mut summary = ExecutionSummary {
            total: results.len(),
            duration_ms: millis(elapsed),
            ..Default::default()
        };
        for result in &results {
            match result.status {
                ExecutionStatus::Succeeded => summary.succeeded += 1,
                ExecutionStatus::Failed => summary.failed += 1,
                ExecutionStatus::DependencyFailed => summary.dependency_failed += 1,
                ExecutionStatus::Skipped => summary.skipped += 1,
            }
        }

        let interrupted = self.store.context().cancel.is_cancelled();
        let manual_followup: Vec<String> = results
            .iter()
            .filter(|r| r.status != ExecutionStatus::Succeeded)
            .map(|r| r.name.clone())
            .collect();
        let success = manual_followup.is_empty() && !interrupted;

        if success {
            log::info!(
                "Applied plan {}: {} resources in {}ms",
                plan.metadata.plan_id,
                summary.succeeded,
                summary.duration_ms
            );
        } else {
            log::warn!(
                "Plan {} incomplete: {} succeeded, {} failed, {} blocked by dependencies, {} skipped",
                plan.metadata.plan_id,
                summary.succeeded,
                summary.failed,
                summary.dependency_failed,
                summary.skipped
            );
        }

        ExecutionResult {
            success,
            results,
            summary,
            plan_id: plan.metadata.plan_id.clone(),
            rolled_back: false,
            manual_followup,
            interrupted,
        }
    }
}

fn dependency_state(
    change: &ResourceChange,
    index_of: &HashMap<&str, usize>,
    slots: &[Slot],
) -> DependencyState {
    let mut waiting = false;
    for dep in &change.dependencies {
        // Dependencies outside this run are already converged
        let Some(&j) = index_of.get(dep.as_str()) else {
            continue;
        };
        match slots[j] {
            Slot::Done(ExecutionStatus::Succeeded) => {}
            Slot::Done(_) => return DependencyState::Failed(dep.clone()),
            Slot::Pending | Slot::Running | Slot::Deleted => waiting = true,
        }
    }
    if waiting {
        DependencyState::Waiting
    } else {
        DependencyState::Ready
    }
}

fn apply_step(
    step: Step,
    provider: &dyn Provider,
    change: &ResourceChange,
    resource: Option<&ResourceConfig>,
) -> anyhow::Result<Option<ProviderOutcome>> {
    let remote_id = || {
        change
            .remote_id
            .as_deref()
            .ok_or_else(|| anyhow!("no remote id recorded for {}", change.name))
    };
    let resource = || {
        resource.ok_or_else(|| anyhow!("{} is not in the desired configuration", change.name))
    };

    match step {
        Step::Create => provider.create(resource()?).map(Some),
        Step::Update => provider.update(remote_id()?, resource()?).map(Some),
        Step::Delete => provider
            .delete(change.existing_kind(), &change.name, remote_id()?)
            .map(|()| None),
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map_or_else(
            || "provider panicked".to_string(),
            |msg| format!("provider panicked: {msg}"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::context::{NoProgress, RunContext};
    use crate::planner::{PlanOptions, generate_plan};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockProvider {
        /// Names, or `"<op> <name>"` to fail a single operation
        fail: Vec<String>,
        panic_on: Vec<String>,
        delay: Duration,
        events: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockProvider {
        fn call(&self, op: &str, name: &str) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.events.lock().unwrap().push(format!("start {op} {name}"));
            thread::sleep(self.delay);
            self.events.lock().unwrap().push(format!("end {op} {name}"));
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on.iter().any(|n| n == name) {
                panic!("bug while handling {name}");
            }
            if self.fail.iter().any(|f| f == name || *f == format!("{op} {name}")) {
                anyhow::bail!("remote rejected {name}");
            }
            Ok(())
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.events.lock().unwrap().clear();
        }

        fn position(&self, event: &str) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("missing event {event}"))
        }
    }

    impl Provider for MockProvider {
        fn create(&self, resource: &ResourceConfig) -> anyhow::Result<ProviderOutcome> {
            self.call("create", &resource.name)?;
            Ok(ProviderOutcome::new(format!("id-{}", resource.name)))
        }

        fn update(
            &self,
            remote_id: &str,
            resource: &ResourceConfig,
        ) -> anyhow::Result<ProviderOutcome> {
            self.call("update", &resource.name)?;
            Ok(ProviderOutcome::new(remote_id))
        }

        fn delete(&self, _kind: ResourceKind, name: &str, _remote_id: &str) -> anyhow::Result<()> {
            self.call("delete", name)
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: StateStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(&RunContext::new(dir.path()));
        Fixture { _dir: dir, store }
    }

    fn run(
        store: &StateStore,
        provider: &Arc<MockProvider>,
        config: &ParsedConfig,
        options: &ExecuteOptions,
    ) -> ExecutionResult {
        let plan = generate_plan(store, config, &PlanOptions::default()).unwrap();
        let registry = ProviderRegistry::all(Arc::clone(provider) as Arc<dyn Provider>);
        Executor::new(store, registry)
            .with_lock_retry(RetryConfig::no_retry())
            .execute(&plan, config, options, &mut NoProgress)
            .unwrap()
    }

    fn sequential() -> ExecuteOptions {
        ExecuteOptions {
            parallelism: 1,
            ..Default::default()
        }
    }

    fn status(result: &ExecutionResult, name: &str) -> ExecutionStatus {
        result
            .results
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.status)
            .unwrap()
    }

    #[test]
    fn test_applies_in_dependency_order_and_records_state() {
        let fx = fixture();
        let provider = Arc::new(MockProvider::default());
        let config = sample_config();

        let result = run(&fx.store, &provider, &config, &sequential());
        assert!(result.success, "{result:?}");
        assert!(!result.rolled_back);
        assert_eq!(result.summary.succeeded, 4);
        assert_eq!(
            provider.events(),
            vec![
                "start create test-email",
                "end create test-email",
                "start create test-slack",
                "end create test-slack",
                "start create disk-agent",
                "end create disk-agent",
                "start create prod-hosts",
                "end create prod-hosts",
            ]
        );

        let state = fx.store.load_state().unwrap();
        assert_eq!(state.resources.len(), 4);
        let watch = state.get("prod-hosts").unwrap();
        assert_eq!(watch.remote_id, "id-prod-hosts");
        assert_eq!(watch.depends_on, vec!["test-slack"]);
        assert_eq!(state.get("disk-agent").unwrap().resource_type.as_deref(), Some("script"));
        assert!(!fx.store.lock_path().exists());
    }

    #[test]
    fn test_second_apply_is_a_no_op() {
        let fx = fixture();
        let provider = Arc::new(MockProvider::default());
        let config = sample_config();
        run(&fx.store, &provider, &config, &sequential());

        let plan = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        assert!(!plan.has_changes());
        assert_eq!(plan.summary.counts.no_change, 4);
        assert!(fx.store.is_no_op(&config).unwrap());

        let again = run(&fx.store, &provider, &config, &sequential());
        assert!(again.success);
        assert!(again.results.is_empty());
    }

    #[test]
    fn test_stop_on_first_failure() {
        let fx = fixture();
        let provider = Arc::new(MockProvider {
            fail: vec!["test-slack".into()],
            ..Default::default()
        });
        let result = run(&fx.store, &provider, &sample_config(), &sequential());

        assert!(!result.success);
        assert_eq!(status(&result, "test-email"), ExecutionStatus::Succeeded);
        assert_eq!(status(&result, "test-slack"), ExecutionStatus::Failed);
        assert_eq!(status(&result, "disk-agent"), ExecutionStatus::Skipped);
        assert_eq!(status(&result, "prod-hosts"), ExecutionStatus::DependencyFailed);
        assert_eq!(
            result.manual_followup,
            vec!["test-slack", "disk-agent", "prod-hosts"]
        );

        let failed = result.results.iter().find(|r| r.name == "test-slack").unwrap();
        assert!(failed.error.as_deref().unwrap().contains("remote rejected"));

        let state = fx.store.load_state().unwrap();
        assert_eq!(state.resources.keys().collect::<Vec<_>>(), vec!["test-email"]);
    }

    #[test]
    fn test_continue_on_error_runs_independent_branches() {
        let fx = fixture();
        let provider = Arc::new(MockProvider {
            fail: vec!["test-slack".into()],
            ..Default::default()
        });
        let options = ExecuteOptions {
            continue_on_error: true,
            ..sequential()
        };
        let result = run(&fx.store, &provider, &sample_config(), &options);

        assert!(!result.success);
        assert_eq!(status(&result, "disk-agent"), ExecutionStatus::Succeeded);
        assert_eq!(status(&result, "prod-hosts"), ExecutionStatus::DependencyFailed);
        assert_eq!(result.summary.succeeded, 2);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.dependency_failed, 1);
        assert!(!provider.events().iter().any(|e| e.contains("prod-hosts")));
    }

    #[test]
    fn test_parallelism_is_bounded_and_dependencies_wait() {
        let fx = fixture();
        let provider = Arc::new(MockProvider {
            delay: Duration::from_millis(30),
            ..Default::default()
        });
        let mut config = sample_config();
        for name in ["c1", "c2", "c3"] {
            config
                .notification_channels
                .insert(name.into(), crate::config::ChannelSpec {
                    channel_type: "email".into(),
                    rest: serde_json::Map::new(),
                });
        }
        let options = ExecuteOptions {
            parallelism: 2,
            ..Default::default()
        };
        let result = run(&fx.store, &provider, &config, &options);

        assert!(result.success, "{result:?}");
        assert_eq!(provider.peak.load(Ordering::SeqCst), 2);
        assert!(
            provider.position("end create test-slack")
                < provider.position("start create prod-hosts")
        );
        assert!(
            provider.position("end create test-email")
                < provider.position("start create disk-agent")
        );
    }

    #[test]
    fn test_delete_removes_state_entry() {
        let fx = fixture();
        let provider = Arc::new(MockProvider::default());
        let config = sample_config();
        run(&fx.store, &provider, &config, &sequential());

        let mut reduced = config;
        reduced.custom_agents.clear();
        let result = run(&fx.store, &provider, &reduced, &sequential());
        assert!(result.success);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].change_type, ChangeType::Delete);
        assert_eq!(result.results[0].remote_id.as_deref(), Some("id-disk-agent"));
        assert!(fx.store.load_state().unwrap().get("disk-agent").is_none());
        assert!(provider.events().contains(&"start delete disk-agent".to_string()));
    }

    #[test]
    fn test_replace_deletes_then_creates() {
        let fx = fixture();
        let provider = Arc::new(MockProvider::default());
        let mut config = sample_config();
        run(&fx.store, &provider, &config, &sequential());
        provider.clear();

        config.custom_agents.get_mut("disk-agent").unwrap().agent_type = "http".into();
        let result = run(&fx.store, &provider, &config, &sequential());
        assert!(result.success, "{result:?}");
        assert_eq!(
            provider.events(),
            vec![
                "start delete disk-agent",
                "end delete disk-agent",
                "start create disk-agent",
                "end create disk-agent",
            ]
        );
        assert_eq!(result.results[0].status, ExecutionStatus::Succeeded);
        assert_eq!(result.results[0].remote_id.as_deref(), Some("id-disk-agent"));
        let entry = fx.store.load_state().unwrap().get("disk-agent").cloned().unwrap();
        assert_eq!(entry.resource_type.as_deref(), Some("http"));
    }

    #[test]
    fn test_failed_recreate_leaves_no_state_entry() {
        let fx = fixture();
        let mut config = sample_config();
        run(&fx.store, &Arc::new(MockProvider::default()), &config, &sequential());

        let provider = Arc::new(MockProvider {
            fail: vec!["create disk-agent".into()],
            ..Default::default()
        });
        config.custom_agents.get_mut("disk-agent").unwrap().agent_type = "http".into();
        let result = run(&fx.store, &provider, &config, &sequential());

        assert!(!result.success);
        assert_eq!(status(&result, "disk-agent"), ExecutionStatus::Failed);
        let error = result.results[0].error.as_deref().unwrap();
        assert!(error.contains("recreating failed"), "{error}");
        assert!(error.contains("remote rejected"), "{error}");
        assert_eq!(result.manual_followup, vec!["disk-agent"]);
        assert!(fx.store.load_state().unwrap().get("disk-agent").is_none());

        let next = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        let change = next.get("disk-agent").unwrap();
        assert_eq!(change.change_type, ChangeType::Create);
        assert!(change.remote_id.is_none());
    }

    #[test]
    fn test_failed_delete_keeps_replaced_entry() {
        let fx = fixture();
        let mut config = sample_config();
        run(&fx.store, &Arc::new(MockProvider::default()), &config, &sequential());

        let provider = Arc::new(MockProvider {
            fail: vec!["delete disk-agent".into()],
            ..Default::default()
        });
        config.custom_agents.get_mut("disk-agent").unwrap().agent_type = "http".into();
        let result = run(&fx.store, &provider, &config, &sequential());

        assert_eq!(status(&result, "disk-agent"), ExecutionStatus::Failed);
        assert!(!provider.events().iter().any(|e| e.contains("create")));
        let entry = fx.store.load_state().unwrap().get("disk-agent").cloned().unwrap();
        assert_eq!(entry.remote_id, "id-disk-agent");
        assert_eq!(entry.resource_type.as_deref(), Some("script"));
    }

    #[test]
    fn test_kind_move_deletes_through_old_provider() {
        let fx = fixture();
        let config = sample_config();
        let resource = config.get("disk-agent").unwrap();
        // disk-agent was last applied as a watchlist
        let mut applied = AppliedResource::new(
            ResourceKind::Watchlist,
            "disk-agent",
            "watch-disk-agent",
            fingerprint(&resource.config),
        );
        applied.config = Some(resource.config);
        assert!(fx.store.update_resource(applied).success);

        let channels = Arc::new(MockProvider::default());
        let watchlists = Arc::new(MockProvider::default());
        let agents = Arc::new(MockProvider::default());
        let mut registry = ProviderRegistry::new();
        registry
            .register(ResourceKind::NotificationChannel, channels)
            .register(ResourceKind::Watchlist, Arc::clone(&watchlists) as Arc<dyn Provider>)
            .register(ResourceKind::CustomAgent, Arc::clone(&agents) as Arc<dyn Provider>);

        let plan = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        assert_eq!(plan.get("disk-agent").unwrap().change_type, ChangeType::Replace);
        let result = Executor::new(&fx.store, registry)
            .execute(&plan, &config, &sequential(), &mut NoProgress)
            .unwrap();
        assert!(result.success, "{result:?}");

        assert!(watchlists.events().contains(&"start delete disk-agent".to_string()));
        assert!(!agents.events().iter().any(|e| e.contains("delete")));
        assert!(agents.events().contains(&"start create disk-agent".to_string()));
        assert!(!agents.events().iter().any(|e| e.contains("update")));

        let entry = fx.store.load_state().unwrap().get("disk-agent").cloned().unwrap();
        assert_eq!(entry.kind, ResourceKind::CustomAgent);
        assert_eq!(entry.remote_id, "id-disk-agent");
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let fx = fixture();
        let config = sample_config();
        let plan = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        let provider = Arc::new(MockProvider::default());
        let registry = ProviderRegistry::all(Arc::clone(&provider) as Arc<dyn Provider>);
        let executor = Executor::new(&fx.store, registry);

        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let options = ExecuteOptions {
                max_operations_per_second: Some(rate),
                ..sequential()
            };
            let err = executor
                .execute(&plan, &config, &options, &mut NoProgress)
                .unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{err}");
        }
        assert!(provider.events().is_empty());
        assert!(!fx.store.lock_path().exists());
    }

    #[test]
    fn test_rate_limited_run_completes() {
        let fx = fixture();
        let provider = Arc::new(MockProvider::default());
        let options = ExecuteOptions {
            max_operations_per_second: Some(200.0),
            ..sequential()
        };
        let result = run(&fx.store, &provider, &sample_config(), &options);
        assert!(result.success);
        assert_eq!(result.summary.succeeded, 4);
    }

    #[test]
    fn test_include_no_change_updates_everything() {
        let fx = fixture();
        let provider = Arc::new(MockProvider::default());
        let config = sample_config();
        run(&fx.store, &provider, &config, &sequential());

        let options = ExecuteOptions {
            include_no_change: true,
            ..sequential()
        };
        let result = run(&fx.store, &provider, &config, &options);
        assert_eq!(result.summary.succeeded, 4);
        assert_eq!(
            provider.events().iter().filter(|e| e.starts_with("start update")).count(),
            4
        );
    }

    #[test]
    fn test_held_lock_blocks_execution() {
        let fx = fixture();
        let config = sample_config();
        let plan = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        assert!(fx.store.create_lock(LockOperation::Plan).success);

        let registry = ProviderRegistry::all(Arc::new(MockProvider::default()));
        let executor = Executor::new(&fx.store, registry).with_lock_retry(RetryConfig::no_retry());

        let readiness = executor.can_execute();
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains(&std::process::id().to_string()));

        let err = executor
            .execute(&plan, &config, &sequential(), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }), "{err}");

        fx.store.remove_lock();
        assert!(executor.can_execute().ready);
    }

    #[test]
    fn test_plan_for_other_config_rejected() {
        let fx = fixture();
        let config = sample_config();
        let plan = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        let mut other = config;
        other.watchlists.clear();

        let executor = Executor::new(&fx.store, ProviderRegistry::new());
        let err = executor
            .execute(&plan, &other, &sequential(), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::PlanConfigMismatch { .. }), "{err}");
    }

    #[test]
    fn test_stale_plan_rejected() {
        let fx = fixture();
        let provider = Arc::new(MockProvider::default());
        let config = sample_config();
        let plan = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        run(&fx.store, &provider, &config, &sequential());

        let executor = Executor::new(&fx.store, ProviderRegistry::all(provider));
        let err = executor
            .execute(&plan, &config, &sequential(), &mut NoProgress)
            .unwrap_err();
        assert!(err.to_string().contains("changed since plan"), "{err}");
    }

    #[test]
    fn test_cancelled_run_starts_nothing() {
        let fx = fixture();
        let provider = Arc::new(MockProvider::default());
        fx.store.context().cancel.cancel();

        let result = run(&fx.store, &provider, &sample_config(), &sequential());
        assert!(result.interrupted);
        assert!(!result.success);
        assert_eq!(result.summary.skipped, 4);
        assert!(provider.events().is_empty());
    }

    #[test]
    fn test_missing_provider_fails_resource() {
        let fx = fixture();
        let config = sample_config();
        let plan = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(
            ResourceKind::NotificationChannel,
            Arc::new(MockProvider::default()),
        );

        let options = ExecuteOptions {
            continue_on_error: true,
            ..sequential()
        };
        let result = Executor::new(&fx.store, registry)
            .execute(&plan, &config, &options, &mut NoProgress)
            .unwrap();
        assert_eq!(result.summary.succeeded, 2);
        assert_eq!(result.summary.failed, 2);
        let agent = result.results.iter().find(|r| r.name == "disk-agent").unwrap();
        assert!(agent.error.as_deref().unwrap().contains("no provider"));
    }

    #[test]
    fn test_panicking_provider_is_a_failure() {
        let fx = fixture();
        let provider = Arc::new(MockProvider {
            panic_on: vec!["test-email".into()],
            ..Default::default()
        });
        let result = run(&fx.store, &provider, &sample_config(), &sequential());
        assert_eq!(status(&result, "test-email"), ExecutionStatus::Failed);
        let failed = result.results.iter().find(|r| r.name == "test-email").unwrap();
        assert!(failed.error.as_deref().unwrap().contains("panicked"));
    }

    #[test]
    fn test_progress_callbacks() {
        #[derive(Default)]
        struct Recorder {
            total: usize,
            started: Vec<String>,
            completed: Vec<(String, ExecutionStatus)>,
        }

        impl ProgressCallback for Recorder {
            fn on_start(&mut self, total: usize) {
                self.total = total;
            }
            fn on_resource_start(&mut self, change: &ResourceChange) {
                self.started.push(change.name.clone());
            }
            fn on_resource_complete(&mut self, result: &ResourceExecutionResult) {
                self.completed.push((result.name.clone(), result.status));
            }
        }

        let fx = fixture();
        let config = sample_config();
        let plan = generate_plan(&fx.store, &config, &PlanOptions::default()).unwrap();
        let mut recorder = Recorder::default();
        Executor::new(&fx.store, ProviderRegistry::all(Arc::new(MockProvider::default())))
            .execute(&plan, &config, &sequential(), &mut recorder)
            .unwrap();

        assert_eq!(recorder.total, 4);
        assert_eq!(recorder.started.len(), 4);
        assert!(
            recorder
                .completed
                .iter()
                .all(|(_, s)| *s == ExecutionStatus::Succeeded)
        );
    }
}
