//! Execution orchestrator.
//!
//! Drives plan executions from start to a terminal status. All progress is
//! expressed as [`Work`] items: the driver loop pulls them off the queue and
//! runs each in its own task, bounded by `worker_count`. Every handler reads
//! its inputs from the store and writes through [`Persistence`], so a handler
//! can be re-run after a crash or a duplicate push without side effects.
//!
//! Node lifecycle:
//! - `Start`: conditions, parameters, facilitation, QUEUED to RUNNING
//! - `Execute`: act on the execution mode (sync call, task, children)
//! - `Advance`: run the adviser chain on a terminal node and apply its advice
//! - `ResumeParent`: release throttled children, complete the parent, or
//!   finalize the plan execution

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::advisers::{AdviserRegistry, AdviserResponse, AdvisingEvent};
use crate::engine::ambiance::Ambiance;
use crate::engine::dispatch::{OutstandingTask, TaskGateway, TaskProgress, TaskResponse, TaskTransport};
use crate::engine::evaluator::ConditionEvaluator;
use crate::engine::events::{EventSink, EventSinks, LogSink};
use crate::engine::execution::{InterruptEffect, NodeExecution, PlanExecution, TriggerMetadata};
use crate::engine::facilitator::{ExecutableResponse, ExecutionMode, FacilitatorRegistry};
use crate::engine::failure::{FailureInfo, FailureType};
use crate::engine::interrupts::{
    Interrupt, InterruptConsumer, InterruptRequest, InterruptState, InterruptType, IssuedBy,
};
use crate::engine::locks::KeyedLocks;
use crate::engine::outputs::SweepingOutputService;
use crate::engine::status::Status;
use crate::engine::steps::{aggregate_children, StepContext, StepHandler, StepRegistry, StepResponse};
use crate::engine::strategy::StrategyExpander;
use crate::engine::transition::{Persistence, RetryPolicy};
use crate::engine::work::{Work, WorkQueue, WorkReceiver};
use crate::error::{EngineError, EngineResult};
use crate::plan::{validate_plan, Plan, PlanNode};
use crate::store::ExecutionStore;

/// Lock key serializing advising and interrupt handling of one node.
pub(crate) fn node_lock_key(id: Uuid) -> String {
    format!("node:{}", id)
}

/// Lock key serializing plan-scoped work of one execution.
pub(crate) fn plan_lock_key(id: Uuid) -> String {
    format!("plan:{}", id)
}

/// Gate consulted before a terminal node is advanced.
///
/// A denied execution is re-checked after `admission_retry`.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    async fn admit(&self, execution: &PlanExecution) -> bool;
}

/// Admits everything.
pub struct AllowAll;

#[async_trait]
impl AdmissionControl for AllowAll {
    async fn admit(&self, _execution: &PlanExecution) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub worker_count: usize,
    pub default_task_timeout: Duration,
    pub admission_retry: Duration,
    pub interrupt_poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            worker_count: 16,
            default_task_timeout: Duration::from_secs(3600),
            admission_retry: Duration::from_secs(30),
            interrupt_poll_interval: Duration::from_millis(500),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            default_task_timeout: config.default_task_timeout(),
            admission_retry: config.admission_retry(),
            interrupt_poll_interval: config.interrupt_poll_interval(),
        }
    }
}

/// Snapshot of one plan execution for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetail {
    pub execution: PlanExecution,
    pub nodes: Vec<NodeExecution>,
    pub interrupts: Vec<Interrupt>,
}

pub struct OrchestratorBuilder {
    store: Arc<dyn ExecutionStore>,
    transport: Arc<dyn TaskTransport>,
    sinks: EventSinks,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    admission: Arc<dyn AdmissionControl>,
    retry: RetryPolicy,
    settings: OrchestratorSettings,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<dyn ExecutionStore>, transport: Arc<dyn TaskTransport>) -> Self {
        Self {
            store,
            transport,
            sinks: EventSinks::new().with(Arc::new(LogSink)),
            steps: StepRegistry::with_builtins(),
            facilitators: FacilitatorRegistry::with_builtins(),
            admission: Arc::new(AllowAll),
            retry: RetryPolicy::default(),
            settings: OrchestratorSettings::default(),
        }
    }

    /// Apply retry policy and settings from the engine configuration.
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.retry = config.retry_policy();
        self.settings = OrchestratorSettings::from_config(config);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks = self.sinks.with(sink);
        self
    }

    pub fn step<H: StepHandler + 'static>(mut self, handler: H) -> Self {
        self.steps.register(handler);
        self
    }

    pub fn admission(mut self, admission: Arc<dyn AdmissionControl>) -> Self {
        self.admission = admission;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the orchestrator and the receiving end of its work queue.
    ///
    /// Nothing runs until the receiver is handed to
    /// [`Orchestrator::spawn_background`].
    pub fn build(self) -> (Orchestrator, WorkReceiver) {
        let (work, rx) = WorkQueue::new();
        let events: Arc<dyn EventSink> = Arc::new(self.sinks);
        let persistence = Persistence::new(self.store.clone(), self.retry.clone(), events);
        let gateway = TaskGateway::new(
            self.store.clone(),
            self.transport,
            self.retry,
            work.clone(),
        );
        let outputs = SweepingOutputService::new(self.store.clone());

        let inner = Inner {
            store: self.store,
            persistence,
            gateway,
            steps: self.steps,
            facilitators: self.facilitators,
            advisers: AdviserRegistry::with_builtins(outputs.clone()),
            expander: StrategyExpander::new(),
            evaluator: ConditionEvaluator::new(),
            outputs,
            admission: self.admission,
            work,
            locks: KeyedLocks::new(),
            interrupts: Arc::new(Notify::new()),
            node_timers: Mutex::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            settings: self.settings,
        };
        (Orchestrator { inner: Arc::new(inner) }, rx)
    }
}

struct Inner {
    store: Arc<dyn ExecutionStore>,
    persistence: Persistence,
    gateway: TaskGateway,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    expander: StrategyExpander,
    evaluator: ConditionEvaluator,
    outputs: SweepingOutputService,
    admission: Arc<dyn AdmissionControl>,
    work: WorkQueue,
    locks: KeyedLocks,
    interrupts: Arc<Notify>,
    node_timers: Mutex<HashMap<Uuid, AbortHandle>>,
    plans: RwLock<HashMap<String, Arc<Plan>>>,
    settings: OrchestratorSettings,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(
        store: Arc<dyn ExecutionStore>,
        transport: Arc<dyn TaskTransport>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, transport)
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub(crate) fn persistence(&self) -> &Persistence {
        &self.inner.persistence
    }

    pub(crate) fn gateway(&self) -> &TaskGateway {
        &self.inner.gateway
    }

    pub(crate) fn locks(&self) -> &KeyedLocks {
        &self.inner.locks
    }

    pub(crate) fn interrupt_signal(&self) -> Arc<Notify> {
        self.inner.interrupts.clone()
    }

    pub(crate) fn push(&self, work: Work) {
        self.inner.work.push(work);
    }

    pub(crate) fn push_after(&self, work: Work, delay: Duration) {
        self.inner.work.push_after(work, delay);
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Persist `plan` and start a new execution of it.
    pub async fn start_execution(
        &self,
        plan: Plan,
        metadata: TriggerMetadata,
    ) -> EngineResult<PlanExecution> {
        validate_plan(&plan)?;
        let start = plan
            .start_node()
            .ok_or_else(|| EngineError::InvalidPlan(format!("plan {} has no start node", plan.uuid)))?
            .clone();
        let retry = self.persistence().retry_policy();

        retry.retry("insert plan", || self.store().insert_plan(&plan)).await?;
        let plan_id = plan.uuid.clone();
        self.inner
            .plans
            .write()
            .await
            .insert(plan_id.clone(), Arc::new(plan));

        let execution = PlanExecution::new(&plan_id, metadata);
        retry
            .retry("insert plan execution", || self.store().insert_plan_execution(&execution))
            .await?;

        let mut ambiance = Ambiance::root(execution.uuid, &plan_id, &execution.metadata.trigger_type);
        ambiance.correlation_id = execution.metadata.correlation_id.clone();
        let root = NodeExecution::queued(&start, &ambiance, start.identifier.clone(), None);
        self.insert_node(&root).await?;

        tracing::info!(
            plan_execution_id = %execution.uuid,
            plan_id = %plan_id,
            triggered_by = %execution.metadata.triggered_by,
            "Plan execution started"
        );
        self.push(Work::Start {
            node_execution_id: root.uuid,
        });
        Ok(execution)
    }

    /// Deliver an executor response. Returns `false` for unknown, resolved or
    /// stale task ids, which are dropped.
    ///
    /// The task stays outstanding, expiry timer included, until the node
    /// completion is committed. A delivery that fails before that point can
    /// be redelivered by the executor.
    pub async fn on_task_response(&self, task_id: Uuid, response: TaskResponse) -> EngineResult<bool> {
        let Some(task) = self.gateway().outstanding(task_id).await? else {
            tracing::warn!(task_id = %task_id, "Dropping response for unknown or resolved task");
            return Ok(false);
        };
        let Some(node) = self.task_node(&task).await? else {
            tracing::warn!(
                task_id = %task_id,
                node_execution_id = %task.node_execution_id,
                "Dropping stale task response"
            );
            self.gateway().resolve(task_id).await?;
            return Ok(false);
        };

        let execution = self.plan_execution(node.plan_execution_id).await?;
        let plan = self.plan(&execution.plan_id).await?;
        let plan_node = lookup_node(&plan, &node.plan_node_id)?;
        let handler = self.handler(plan_node)?;
        let step_response = handler.handle_task_response(&response);
        let completed = self.complete_task_node(node.uuid, step_response).await?;

        if let Err(e) = self.gateway().resolve(task_id).await {
            // The completion is committed; expiry or recovery clears the row.
            tracing::warn!(task_id = %task_id, error = %e, "Failed to resolve answered task");
        }
        Ok(completed)
    }

    /// Record a progress update on the node waiting for `task_id`.
    pub async fn on_task_progress(&self, task_id: Uuid, progress: TaskProgress) -> EngineResult<()> {
        let data = progress.decode()?;
        let task = self
            .store()
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))?;
        let updated = self
            .persistence()
            .update_node(task.node_execution_id, |node| {
                if node.status.is_terminal() || node.attempt() != task.attempt {
                    return false;
                }
                node.progress = Some(data.clone());
                true
            })
            .await?;
        if updated.is_none() {
            tracing::debug!(task_id = %task_id, "Ignoring progress for a finished attempt");
        }
        Ok(())
    }

    /// Validate and queue an interrupt for the interrupt consumer.
    pub async fn register_interrupt(
        &self,
        plan_execution_id: Uuid,
        request: InterruptRequest,
    ) -> EngineResult<Interrupt> {
        request.validate()?;
        let execution = self.plan_execution(plan_execution_id).await?;
        if let Some(node_id) = request.node_execution_id {
            let node = self
                .store()
                .get_node_execution(node_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("node execution {}", node_id)))?;
            if node.plan_execution_id != execution.uuid {
                return Err(EngineError::InvalidRequest(format!(
                    "node execution {} does not belong to plan execution {}",
                    node_id, execution.uuid
                )));
            }
        }

        let interrupt = request.into_interrupt(plan_execution_id);
        self.persistence()
            .retry_policy()
            .retry("insert interrupt", || self.store().insert_interrupt(&interrupt))
            .await?;
        tracing::info!(
            plan_execution_id = %plan_execution_id,
            interrupt_id = %interrupt.uuid,
            interrupt_type = %interrupt.interrupt_type,
            node_execution_id = ?interrupt.node_execution_id,
            "Interrupt registered"
        );
        self.inner.interrupts.notify_one();
        Ok(interrupt)
    }

    pub async fn get_execution_detail(&self, plan_execution_id: Uuid) -> EngineResult<ExecutionDetail> {
        let execution = self.plan_execution(plan_execution_id).await?;
        let nodes = self.store().node_executions(plan_execution_id).await?;
        let interrupts = self.store().interrupts_for_plan(plan_execution_id).await?;
        Ok(ExecutionDetail {
            execution,
            nodes,
            interrupts,
        })
    }

    /// Push whatever work is missing for an execution to make progress.
    pub async fn reconcile(&self, plan_execution_id: Uuid) -> EngineResult<()> {
        self.reconcile_execution(plan_execution_id, false).await
    }

    /// Resume every non-terminal execution after a restart.
    pub async fn recover(&self) -> EngineResult<()> {
        let requeued = InterruptConsumer::requeue_processing(self.store().as_ref()).await?;
        let tasks = self.gateway().recover().await?;
        let executions = self.store().active_plan_executions().await?;
        for execution in &executions {
            self.reconcile_execution(execution.uuid, true).await?;
        }
        self.inner.interrupts.notify_one();
        tracing::info!(
            plan_executions = executions.len(),
            outstanding_tasks = tasks,
            requeued_interrupts = requeued,
            "Recovery complete"
        );
        Ok(())
    }

    /// Spawn the work driver and the interrupt consumer.
    pub fn spawn_background(&self, rx: WorkReceiver) -> Vec<JoinHandle<()>> {
        let driver = tokio::spawn(self.clone().run(rx));
        let consumer = tokio::spawn(InterruptConsumer::new(self.clone()).run());
        vec![driver, consumer]
    }

    /// Driver loop. Returns when the work queue closes.
    pub async fn run(self, mut rx: WorkReceiver) {
        let semaphore = Arc::new(Semaphore::new(self.inner.settings.worker_count.max(1)));
        tracing::info!(
            worker_count = self.inner.settings.worker_count,
            "Orchestrator driver started"
        );

        while let Some(work) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match this.handle(work.clone()).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => {
                        let delay = this.persistence().retry_policy().max_backoff;
                        tracing::warn!(work = ?work, error = %e, "Transient failure, re-queueing work item");
                        this.push_after(work, delay);
                    }
                    Err(e) => tracing::error!(work = ?work, error = %e, "Work item failed"),
                }
            });
        }
        tracing::info!("Orchestrator driver stopped");
    }

    // ------------------------------------------------------------------
    // Work handlers
    // ------------------------------------------------------------------

    pub(crate) async fn handle(&self, work: Work) -> EngineResult<()> {
        tracing::trace!(work = ?work, "Handling work item");
        let node_id = match &work {
            Work::Start { node_execution_id }
            | Work::Execute { node_execution_id }
            | Work::Advance { node_execution_id }
            | Work::NodeExpired {
                node_execution_id, ..
            } => Some(*node_execution_id),
            Work::ResumeParent { .. } | Work::TaskExpired { .. } => None,
        };

        let result = match work {
            Work::Start { node_execution_id } => self.handle_start(node_execution_id).await,
            Work::Execute { node_execution_id } => self.handle_execute(node_execution_id).await,
            Work::Advance { node_execution_id } => self.handle_advance(node_execution_id).await,
            Work::ResumeParent {
                plan_execution_id,
                parent_id,
            } => self.handle_resume_parent(plan_execution_id, parent_id).await,
            Work::TaskExpired { task_id } => self.handle_task_expired(task_id).await,
            Work::NodeExpired {
                node_execution_id,
                attempt,
            } => self.handle_node_expired(node_execution_id, attempt).await,
        };

        if let (Err(EngineError::PersistenceExhausted(reason)), Some(id)) = (&result, node_id) {
            self.error_node_best_effort(id, reason).await;
        }
        result
    }

    async fn handle_start(&self, id: Uuid) -> EngineResult<()> {
        let Some(node) = self.store().get_node_execution(id).await? else {
            tracing::warn!(node_execution_id = %id, "Start for unknown node");
            return Ok(());
        };
        if node.status != Status::Queued || !node.ready {
            return Ok(());
        }

        let execution = self.plan_execution(node.plan_execution_id).await?;
        if execution.status.is_terminal() {
            // Created after the execution ended; nothing may run under it.
            self.abort_node(id, None).await?;
            return Ok(());
        }
        if execution.status == Status::Suspended || self.is_paused(&node).await? {
            tracing::debug!(node_execution_id = %id, "Start deferred while paused");
            return Ok(());
        }
        if let Some(not_before) = node.not_before {
            let now = Utc::now();
            if not_before > now {
                let delay = (not_before - now).to_std().unwrap_or_default();
                self.push_after(Work::Start { node_execution_id: id }, delay);
                return Ok(());
            }
        }

        let plan = self.plan(&execution.plan_id).await?;
        let plan_node = lookup_node(&plan, &node.plan_node_id)?;
        let context = ConditionEvaluator::context(&execution.metadata, &node);

        match self.inner.evaluator.should_skip(plan_node, &context) {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!(node_execution_id = %id, identifier = %node.identifier, "Node skipped");
                if self
                    .persistence()
                    .transition_node(id, Status::Skipped, |_| {})
                    .await?
                    .is_some()
                {
                    self.push(Work::Advance { node_execution_id: id });
                }
                return Ok(());
            }
            Err(e) => {
                return self
                    .error_node(id, FailureInfo::new(format!("condition failed to evaluate: {}", e), FailureType::UnknownFailure))
                    .await
            }
        }

        let parameters = match self.inner.evaluator.render_parameters(plan_node, &context) {
            Ok(parameters) => parameters,
            Err(e) => {
                return self
                    .error_node(id, FailureInfo::new(format!("parameters failed to render: {}", e), FailureType::UnknownFailure))
                    .await
            }
        };
        let handler = match self.handler(plan_node) {
            Ok(handler) => handler,
            Err(e) => return self.error_node(id, FailureInfo::new(e.to_string(), FailureType::UnknownFailure)).await,
        };
        let mode = match self.inner.facilitators.facilitate(plan_node, handler.as_ref()) {
            Ok(mode) => mode,
            Err(e) => return self.error_node(id, FailureInfo::new(e.to_string(), FailureType::UnknownFailure)).await,
        };

        let timeout = plan_node.timeout();
        let expires_at = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| Utc::now() + t);
        let Some(started) = self
            .persistence()
            .transition_node(id, Status::Running, |n| {
                n.mode = Some(mode);
                n.resolved_parameters = parameters.clone();
                n.expires_at = expires_at;
            })
            .await?
        else {
            return Ok(());
        };

        // Task modes expire through the gateway.
        if let (Some(timeout), ExecutionMode::Child | ExecutionMode::Children) = (timeout, mode) {
            self.arm_node_timer(id, started.attempt(), timeout);
        }
        tracing::info!(
            plan_execution_id = %started.plan_execution_id,
            node_execution_id = %id,
            identifier = %started.identifier,
            mode = %mode,
            "Node started"
        );
        self.push(Work::Execute { node_execution_id: id });
        Ok(())
    }

    async fn handle_execute(&self, id: Uuid) -> EngineResult<()> {
        let Some(node) = self.store().get_node_execution(id).await? else {
            return Ok(());
        };
        if node.status != Status::Running || node.executable_response.is_some() {
            return Ok(());
        }
        let Some(mode) = node.mode else {
            return self
                .error_node(id, FailureInfo::new("running node has no execution mode", FailureType::UnknownFailure))
                .await;
        };

        let execution = self.plan_execution(node.plan_execution_id).await?;
        let plan = self.plan(&execution.plan_id).await?;
        let plan_node = lookup_node(&plan, &node.plan_node_id)?;
        let handler = self.handler(plan_node)?;

        match mode {
            ExecutionMode::Sync => {
                let ctx = StepContext {
                    node: &node,
                    plan_node,
                    parameters: &node.resolved_parameters,
                };
                let response = match handler.execute_sync(&ctx).await {
                    Ok(response) => response,
                    Err(e) => StepResponse::failed(
                        Status::Errored,
                        FailureInfo::new(e.to_string(), FailureType::UnknownFailure),
                    ),
                };
                self.complete_node(id, response).await
            }
            ExecutionMode::Task | ExecutionMode::Async => {
                self.execute_task(&node, plan_node, handler.as_ref(), mode).await
            }
            ExecutionMode::Child => self.execute_child(&node, &plan, plan_node).await,
            ExecutionMode::Children => {
                self.execute_children(&node, &execution, &plan, plan_node).await
            }
        }
    }

    async fn execute_task(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
        handler: &dyn StepHandler,
        mode: ExecutionMode,
    ) -> EngineResult<()> {
        let ctx = StepContext {
            node,
            plan_node,
            parameters: &node.resolved_parameters,
        };
        let spec = match handler.task_request(&ctx) {
            Ok(spec) => spec,
            Err(e) => {
                return self
                    .error_node(node.uuid, FailureInfo::new(e.to_string(), FailureType::UnknownFailure))
                    .await
            }
        };

        let timeout = plan_node
            .timeout()
            .unwrap_or(self.inner.settings.default_task_timeout);
        let task_id = match self.gateway().dispatch(node, spec, timeout).await {
            Ok(task_id) => task_id,
            Err(e @ EngineError::Dispatch(_)) => {
                return self
                    .error_node(node.uuid, FailureInfo::new(e.to_string(), FailureType::ConnectivityFailure))
                    .await
            }
            Err(e) => return Err(e),
        };

        let response = match mode {
            ExecutionMode::Async => ExecutableResponse::Async { task_id },
            _ => ExecutableResponse::Task { task_id },
        };
        self.record_response(node.uuid, response).await
    }

    async fn execute_child(&self, node: &NodeExecution, plan: &Plan, plan_node: &PlanNode) -> EngineResult<()> {
        let child_plan_node_id = plan_node.children.first().ok_or_else(|| {
            EngineError::InvalidPlan(format!("node {} has no child", plan_node.uuid))
        })?;
        let child_plan_node = lookup_node(plan, child_plan_node_id)?;

        let existing = self.current_children(node).await?;
        let child = match existing.into_iter().next() {
            Some(child) => child,
            None => {
                let child = new_child(node, child_plan_node, None, true);
                self.insert_node(&child).await?;
                child
            }
        };

        self.record_response(node.uuid, ExecutableResponse::Child { child_id: child.uuid })
            .await?;
        if child.status == Status::Queued {
            self.push(Work::Start {
                node_execution_id: child.uuid,
            });
        }
        Ok(())
    }

    async fn execute_children(
        &self,
        node: &NodeExecution,
        execution: &PlanExecution,
        plan: &Plan,
        plan_node: &PlanNode,
    ) -> EngineResult<()> {
        let existing = self.current_children(node).await?;
        let max_concurrency = plan_node
            .strategy
            .as_ref()
            .map(|s| s.max_concurrency())
            .unwrap_or(0);

        let children = if !existing.is_empty() {
            existing
        } else if let Some(strategy) = &plan_node.strategy {
            let context = ConditionEvaluator::context(&execution.metadata, node);
            let expansion = match self.inner.expander.expand(plan_node, strategy, &context) {
                Ok(expansion) => expansion,
                Err(e) => {
                    return self
                        .error_node(node.uuid, FailureInfo::new(e.to_string(), FailureType::UnknownFailure))
                        .await
                }
            };
            let mut created = Vec::with_capacity(expansion.children.len());
            for (index, spec) in expansion.children.into_iter().enumerate() {
                let child_plan_node = lookup_node(plan, &spec.plan_node_id)?;
                let ready = expansion.max_concurrency == 0 || index < expansion.max_concurrency;
                let child = new_child(node, child_plan_node, spec.strategy, ready);
                self.insert_node(&child).await?;
                created.push(child);
            }
            tracing::info!(
                node_execution_id = %node.uuid,
                strategy = strategy.kind(),
                instances = created.len(),
                max_concurrency = expansion.max_concurrency,
                "Strategy expanded"
            );
            created
        } else {
            let mut created = Vec::with_capacity(plan_node.children.len());
            for child_id in &plan_node.children {
                let child = new_child(node, lookup_node(plan, child_id)?, None, true);
                self.insert_node(&child).await?;
                created.push(child);
            }
            created
        };

        if children.is_empty() {
            tracing::info!(node_execution_id = %node.uuid, "No children to run");
            return self
                .complete_node(
                    node.uuid,
                    StepResponse {
                        status: Status::Skipped,
                        failure_info: None,
                        outputs: None,
                        rolled_back: false,
                    },
                )
                .await;
        }

        let response = ExecutableResponse::Children {
            children: children.iter().map(|c| c.uuid).collect(),
            max_concurrency,
            cursor: children.iter().filter(|c| c.ready).count(),
        };
        self.record_response(node.uuid, response).await?;
        for child in children.iter().filter(|c| c.ready && c.status == Status::Queued) {
            self.push(Work::Start {
                node_execution_id: child.uuid,
            });
        }
        Ok(())
    }

    async fn handle_advance(&self, id: Uuid) -> EngineResult<()> {
        let _guard = self.locks().lock(node_lock_key(id)).await;

        let Some(node) = self.store().get_node_execution(id).await? else {
            return Ok(());
        };
        if !node.status.is_terminal() || node.advised {
            return Ok(());
        }

        let execution = self.plan_execution(node.plan_execution_id).await?;
        if execution.status.is_terminal() {
            self.mark_advised(&node, &AdviserResponse::end_chain()).await?;
            return Ok(());
        }
        if execution.status == Status::Suspended || self.is_paused(&node).await? {
            tracing::debug!(node_execution_id = %id, "Advance deferred while paused");
            return Ok(());
        }
        if !self.inner.admission.admit(&execution).await {
            tracing::info!(
                plan_execution_id = %execution.uuid,
                node_execution_id = %id,
                "Admission denied, re-checking later"
            );
            self.push_after(
                Work::Advance { node_execution_id: id },
                self.inner.settings.admission_retry,
            );
            return Ok(());
        }

        let plan = self.plan(&execution.plan_id).await?;
        let plan_node = lookup_node(&plan, &node.plan_node_id)?;
        let event = AdvisingEvent::new(&node, plan_node);
        let response = match self.inner.advisers.advise(&event).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(node_execution_id = %id, error = %e, "Adviser failed, ending chain");
                AdviserResponse::end_chain()
            }
        };
        tracing::debug!(node_execution_id = %id, response = ?response, "Node advised");
        self.apply_advice(&node, &plan, response).await
    }

    async fn apply_advice(&self, node: &NodeExecution, plan: &Plan, response: AdviserResponse) -> EngineResult<()> {
        let response = match response {
            AdviserResponse::NextStep {
                ref next_node_id,
                ignore_failure,
                ..
            } if plan.node(next_node_id).is_none() => {
                tracing::error!(
                    node_execution_id = %node.uuid,
                    next_node_id = %next_node_id,
                    "Next step is not part of the plan, ending chain"
                );
                AdviserResponse::EndChain { ignore_failure }
            }
            other => other,
        };

        match &response {
            AdviserResponse::NextStep {
                next_node_id,
                rollback,
                ..
            } => {
                let next_plan_node = lookup_node(plan, next_node_id)?;
                // Created before the node is marked advised; a re-run finds it.
                let next = match self.successor(node).await? {
                    Some(existing) => existing,
                    None => {
                        let mut next = node.next_sibling(next_plan_node);
                        next.rollback = *rollback;
                        self.insert_node(&next).await?;
                        next
                    }
                };
                if self.mark_advised(node, &response).await? {
                    self.push(Work::Start {
                        node_execution_id: next.uuid,
                    });
                }
            }
            AdviserResponse::EndChain { .. } => {
                if self.mark_advised(node, &response).await? {
                    self.push(Work::ResumeParent {
                        plan_execution_id: node.plan_execution_id,
                        parent_id: node.parent_id,
                    });
                }
            }
            AdviserResponse::Retry { wait_secs } => {
                let request = InterruptRequest::new(InterruptType::Retry, Some(node.uuid))
                    .issued_by(IssuedBy::Adviser)
                    .wait_secs(*wait_secs);
                self.register_adviser_interrupt(node, request).await?;
                self.mark_advised(node, &response).await?;
            }
            AdviserResponse::EndPlan => {
                let request =
                    InterruptRequest::new(InterruptType::AbortAll, None).issued_by(IssuedBy::Adviser);
                self.register_adviser_interrupt(node, request).await?;
                self.mark_advised(node, &response).await?;
            }
        }
        Ok(())
    }

    /// Register an adviser interrupt unless an advising pass that did not
    /// finish already left the same one pending.
    async fn register_adviser_interrupt(
        &self,
        node: &NodeExecution,
        request: InterruptRequest,
    ) -> EngineResult<()> {
        let pending = self
            .store()
            .interrupts_for_plan(node.plan_execution_id)
            .await?
            .into_iter()
            .any(|i| {
                i.config.issued_by == IssuedBy::Adviser
                    && i.interrupt_type == request.interrupt_type
                    && i.node_execution_id == request.node_execution_id
                    && matches!(i.state, InterruptState::Registered | InterruptState::Processing)
            });
        if pending {
            tracing::debug!(
                node_execution_id = %node.uuid,
                interrupt_type = %request.interrupt_type,
                "Adviser interrupt already pending"
            );
            return Ok(());
        }
        self.register_interrupt(node.plan_execution_id, request).await?;
        Ok(())
    }

    /// The sibling created by the advice of `node`'s current attempt.
    pub(crate) async fn successor(&self, node: &NodeExecution) -> EngineResult<Option<NodeExecution>> {
        Ok(self
            .store()
            .children_of(node.plan_execution_id, node.parent_id)
            .await?
            .into_iter()
            .find(|s| node.is_followed_by(s)))
    }

    async fn handle_resume_parent(&self, plan_execution_id: Uuid, parent_id: Option<Uuid>) -> EngineResult<()> {
        let Some(parent_id) = parent_id else {
            return self.finalize(plan_execution_id).await;
        };
        let _guard = self.locks().lock(node_lock_key(parent_id)).await;

        let Some(parent) = self.store().get_node_execution(parent_id).await? else {
            return Ok(());
        };
        if parent.status != Status::Running {
            return Ok(());
        }
        let execution = self.plan_execution(plan_execution_id).await?;
        if execution.status != Status::Running {
            return Ok(());
        }

        let children = self.current_children(&parent).await?;
        if let Some(ExecutableResponse::Children {
            max_concurrency, ..
        }) = &parent.executable_response
        {
            if *max_concurrency > 0 {
                let released = self.release_children(&parent, &children, *max_concurrency).await?;
                if released > 0 {
                    return Ok(());
                }
            }
        }

        if children.is_empty() || !children.iter().all(|c| c.ready && c.is_concluded()) {
            return Ok(());
        }

        let plan = self.plan(&execution.plan_id).await?;
        let plan_node = lookup_node(&plan, &parent.plan_node_id)?;
        let handler = self.handler(plan_node)?;
        let response = handler.handle_children_response(&children);
        tracing::debug!(
            node_execution_id = %parent_id,
            children = children.len(),
            status = %response.status,
            "Children concluded"
        );
        self.complete_node(parent_id, response).await
    }

    /// Release held-back children up to `max_concurrency` running at once.
    async fn release_children(
        &self,
        parent: &NodeExecution,
        children: &[NodeExecution],
        max_concurrency: usize,
    ) -> EngineResult<usize> {
        let active = children.iter().filter(|c| c.ready && !c.is_concluded()).count();
        let free = max_concurrency.saturating_sub(active);
        let mut released = 0;

        for child in children.iter().filter(|c| !c.ready).take(free) {
            let updated = self
                .persistence()
                .update_node(child.uuid, |n| {
                    if n.ready {
                        return false;
                    }
                    n.ready = true;
                    true
                })
                .await?;
            if updated.is_some() {
                released += 1;
                self.push(Work::Start {
                    node_execution_id: child.uuid,
                });
            }
        }

        if released > 0 {
            self.persistence()
                .update_node(parent.uuid, |n| match &mut n.executable_response {
                    Some(ExecutableResponse::Children { cursor, .. }) => {
                        *cursor += released;
                        true
                    }
                    _ => false,
                })
                .await?;
            tracing::debug!(node_execution_id = %parent.uuid, released, "Released children");
        }
        Ok(released)
    }

    /// Settle the plan execution once every top-level chain concluded.
    async fn finalize(&self, plan_execution_id: Uuid) -> EngineResult<()> {
        let _guard = self.locks().lock(plan_lock_key(plan_execution_id)).await;

        let execution = self.plan_execution(plan_execution_id).await?;
        if execution.status != Status::Running {
            return Ok(());
        }
        let roots = self.store().children_of(plan_execution_id, None).await?;
        if roots.is_empty() || !roots.iter().all(|r| r.is_concluded()) {
            return Ok(());
        }

        let outcome = aggregate_children(&roots);
        let status = match outcome.status {
            Status::Expired => Status::Failed,
            other => other,
        };
        let finished = self
            .persistence()
            .transition_plan(plan_execution_id, status, |e| e.rolled_back = outcome.rolled_back)
            .await?;
        if let Some(finished) = finished {
            tracing::info!(
                plan_execution_id = %plan_execution_id,
                status = %finished.status,
                rolled_back = finished.rolled_back,
                "Plan execution finished"
            );
        }
        Ok(())
    }

    async fn handle_task_expired(&self, task_id: Uuid) -> EngineResult<()> {
        let Some(task) = self.gateway().outstanding(task_id).await? else {
            return Ok(());
        };
        let Some(node) = self.task_node(&task).await? else {
            self.gateway().resolve(task_id).await?;
            return Ok(());
        };
        let response = TaskResponse::expired(task_id);
        self.complete_task_node(
            node.uuid,
            StepResponse {
                status: response.status,
                failure_info: response.failure,
                outputs: None,
                rolled_back: false,
            },
        )
        .await?;
        self.gateway().expire(task_id).await?;
        Ok(())
    }

    /// The node still waiting on `task`: same attempt and RUNNING.
    async fn task_node(&self, task: &OutstandingTask) -> EngineResult<Option<NodeExecution>> {
        Ok(self
            .store()
            .get_node_execution(task.node_execution_id)
            .await?
            .filter(|n| n.attempt() == task.attempt && n.status == Status::Running))
    }

    /// Commit a task outcome. The node goes ERRORED best-effort when
    /// persistence gives up.
    async fn complete_task_node(&self, id: Uuid, response: StepResponse) -> EngineResult<bool> {
        match self.finish_node(id, response).await {
            Err(EngineError::PersistenceExhausted(reason)) => {
                self.error_node_best_effort(id, &reason).await;
                Err(EngineError::PersistenceExhausted(reason))
            }
            other => other,
        }
    }

    async fn handle_node_expired(&self, id: Uuid, attempt: u32) -> EngineResult<()> {
        let Some(node) = self.store().get_node_execution(id).await? else {
            return Ok(());
        };
        if node.attempt() != attempt || node.status.is_terminal() {
            return Ok(());
        }
        tracing::warn!(node_execution_id = %id, identifier = %node.identifier, "Node deadline passed");
        self.force_terminal(
            &node,
            Status::Expired,
            FailureInfo::expired(format!("node {} exceeded its timeout", node.identifier)),
            None,
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared transitions
    // ------------------------------------------------------------------

    /// Move a node to the terminal status reported by its handler, publish its
    /// outputs and queue advising.
    pub(crate) async fn complete_node(&self, id: Uuid, response: StepResponse) -> EngineResult<()> {
        self.finish_node(id, response).await.map(|_| ())
    }

    /// [`Orchestrator::complete_node`], returning whether this call made the transition.
    async fn finish_node(&self, id: Uuid, response: StepResponse) -> EngineResult<bool> {
        let response = if response.status.is_terminal() {
            response
        } else {
            StepResponse::failed(
                Status::Errored,
                FailureInfo::new(
                    format!("handler reported non-terminal status {}", response.status),
                    FailureType::UnknownFailure,
                ),
            )
        };

        let completed = self
            .persistence()
            .transition_node(id, response.status, |n| {
                n.failure_info = response.failure_info.clone();
                n.outputs = response.outputs.clone();
                n.rolled_back = response.rolled_back;
            })
            .await?;
        let Some(node) = completed else {
            tracing::debug!(node_execution_id = %id, status = %response.status, "Completion retracted");
            return Ok(false);
        };

        self.disarm_node_timer(id);
        if let Some(outputs) = &node.outputs {
            if let Err(e) = self
                .inner
                .outputs
                .consume_overridable(&node.ambiance, &node.identifier, outputs.clone(), None)
                .await
            {
                tracing::warn!(node_execution_id = %id, error = %e, "Failed to publish node outputs");
            }
        }
        tracing::info!(
            plan_execution_id = %node.plan_execution_id,
            node_execution_id = %id,
            identifier = %node.identifier,
            status = %node.status,
            "Node finished"
        );
        self.push(Work::Advance { node_execution_id: id });
        Ok(true)
    }

    async fn error_node(&self, id: Uuid, failure: FailureInfo) -> EngineResult<()> {
        tracing::error!(node_execution_id = %id, error = %failure.error_message, "Node errored");
        self.complete_node(id, StepResponse::failed(Status::Errored, failure)).await
    }

    /// Last resort after persistence gave up: a single ERRORED write.
    async fn error_node_best_effort(&self, id: Uuid, reason: &str) {
        let failure = FailureInfo::new(
            format!("persistence failed: {}", reason),
            FailureType::UnknownFailure,
        );
        let Ok(Some(mut node)) = self.store().get_node_execution(id).await else {
            return;
        };
        if !node.status.can_transition_to(Status::Errored) {
            return;
        }
        let (status, version) = (node.status, node.version);
        node.status = Status::Errored;
        node.end_ts = Some(Utc::now());
        node.failure_info = Some(failure);
        node.version = version + 1;
        match self.store().update_node_execution(&node, status, version).await {
            Ok(true) => self.push(Work::Advance { node_execution_id: id }),
            Ok(false) => {}
            Err(e) => tracing::error!(node_execution_id = %id, error = %e, "Could not mark node errored"),
        }
    }

    /// Abort descendants, cancel any task, then force `to` on `node`.
    pub(crate) async fn force_terminal(
        &self,
        node: &NodeExecution,
        to: Status,
        failure: FailureInfo,
        effect: Option<InterruptEffect>,
    ) -> EngineResult<bool> {
        self.abort_descendants(node).await?;
        self.gateway().cancel_for_node(node.uuid).await?;
        self.disarm_node_timer(node.uuid);

        let updated = self
            .persistence()
            .transition_node(node.uuid, to, |n| {
                n.failure_info = Some(failure.clone());
                if let Some(effect) = &effect {
                    n.interrupt_history.push(effect.clone());
                }
            })
            .await?;
        if updated.is_some() {
            self.push(Work::Advance {
                node_execution_id: node.uuid,
            });
        }
        Ok(updated.is_some())
    }

    /// Abort every descendant of `root`, deepest first.
    pub(crate) async fn abort_descendants(&self, root: &NodeExecution) -> EngineResult<()> {
        let mut frontier = vec![root.uuid];
        let mut descendants = Vec::new();
        while let Some(parent) = frontier.pop() {
            for child in self
                .store()
                .children_of(root.plan_execution_id, Some(parent))
                .await?
            {
                frontier.push(child.uuid);
                descendants.push(child.uuid);
            }
        }
        for id in descendants.into_iter().rev() {
            self.abort_node(id, None).await?;
        }
        Ok(())
    }

    /// Force a node ABORTED and concluded. Terminal nodes are only concluded.
    ///
    /// Returns whether the node moved to ABORTED.
    pub(crate) async fn abort_node(&self, id: Uuid, effect: Option<InterruptEffect>) -> EngineResult<bool> {
        self.gateway().cancel_for_node(id).await?;
        self.disarm_node_timer(id);

        let mut aborted = false;
        self.persistence()
            .update_node(id, |n| {
                aborted = false;
                if n.status.is_terminal() {
                    if n.advised && !n.awaiting_retry {
                        return false;
                    }
                } else {
                    n.status = Status::Aborted;
                    n.end_ts = Some(Utc::now());
                    aborted = true;
                }
                n.ready = true;
                n.advised = true;
                n.awaiting_retry = false;
                n.adviser_response = Some(AdviserResponse::end_chain());
                if let Some(effect) = &effect {
                    n.interrupt_history.push(effect.clone());
                }
                true
            })
            .await?;
        if aborted {
            tracing::info!(node_execution_id = %id, "Node aborted");
        }
        Ok(aborted)
    }

    /// Conclude the current attempt of `node` with `response`.
    ///
    /// Returns `false` if the node moved on in the meantime.
    async fn mark_advised(&self, node: &NodeExecution, response: &AdviserResponse) -> EngineResult<bool> {
        let attempt = node.attempt();
        let ignore = response.ignores_failure();
        let awaiting_retry = matches!(response, AdviserResponse::Retry { .. });
        let updated = self
            .persistence()
            .update_node(node.uuid, |n| {
                if n.advised || n.attempt() != attempt || !n.status.is_terminal() {
                    return false;
                }
                n.advised = true;
                n.adviser_response = Some(response.clone());
                n.failure_ignored = ignore && n.status.is_broke();
                n.awaiting_retry = awaiting_retry;
                true
            })
            .await?;
        Ok(updated.is_some())
    }

    async fn record_response(&self, id: Uuid, response: ExecutableResponse) -> EngineResult<()> {
        self.persistence()
            .update_node(id, |n| {
                if n.status != Status::Running || n.executable_response.is_some() {
                    return false;
                }
                n.executable_response = Some(response.clone());
                true
            })
            .await?;
        Ok(())
    }

    async fn reconcile_execution(&self, plan_execution_id: Uuid, recovering: bool) -> EngineResult<()> {
        let execution = self.plan_execution(plan_execution_id).await?;
        if execution.status != Status::Running {
            return Ok(());
        }

        let nodes = self.store().node_executions(plan_execution_id).await?;
        let now = Utc::now();
        for node in &nodes {
            let id = node.uuid;
            match node.status {
                Status::Queued if node.ready => self.push(Work::Start { node_execution_id: id }),
                Status::Running => match &node.executable_response {
                    None => self.push(Work::Execute { node_execution_id: id }),
                    Some(ExecutableResponse::Task { .. } | ExecutableResponse::Async { .. }) => {
                        if recovering && !self.gateway().has_outstanding(id).await? {
                            self.error_node(
                                id,
                                FailureInfo::new("task response lost", FailureType::ConnectivityFailure),
                            )
                            .await?;
                        }
                    }
                    Some(_) => {
                        if recovering {
                            if let Some(expires_at) = node.expires_at {
                                let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
                                self.arm_node_timer(id, node.attempt(), remaining);
                            }
                        }
                        self.push(Work::ResumeParent {
                            plan_execution_id,
                            parent_id: Some(id),
                        });
                    }
                },
                status if status.is_terminal() && !node.advised => {
                    self.push(Work::Advance { node_execution_id: id })
                }
                _ => {}
            }
        }
        self.push(Work::ResumeParent {
            plan_execution_id,
            parent_id: None,
        });
        tracing::debug!(plan_execution_id = %plan_execution_id, nodes = nodes.len(), "Execution reconciled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub(crate) async fn plan_execution(&self, id: Uuid) -> EngineResult<PlanExecution> {
        self.store()
            .get_plan_execution(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan execution {}", id)))
    }

    async fn plan(&self, plan_id: &str) -> EngineResult<Arc<Plan>> {
        if let Some(plan) = self.inner.plans.read().await.get(plan_id) {
            return Ok(plan.clone());
        }
        let plan = self
            .store()
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan {}", plan_id)))?;
        let plan = Arc::new(plan);
        self.inner
            .plans
            .write()
            .await
            .insert(plan_id.to_string(), plan.clone());
        Ok(plan)
    }

    fn handler(&self, plan_node: &PlanNode) -> EngineResult<Arc<dyn StepHandler>> {
        self.inner.steps.get(&plan_node.step_type).ok_or_else(|| {
            EngineError::InvalidPlan(format!("no step handler for type {}", plan_node.step_type))
        })
    }

    /// Children of `parent` created for its current attempt.
    async fn current_children(&self, parent: &NodeExecution) -> EngineResult<Vec<NodeExecution>> {
        let attempt = parent.attempt();
        Ok(self
            .store()
            .children_of(parent.plan_execution_id, Some(parent.uuid))
            .await?
            .into_iter()
            .filter(|c| c.parent_attempt == attempt)
            .collect())
    }

    /// The node itself or one of its ancestors is paused.
    async fn is_paused(&self, node: &NodeExecution) -> EngineResult<bool> {
        if node.paused {
            return Ok(true);
        }
        let ancestors = node.ambiance.levels.len().saturating_sub(1);
        for level in node.ambiance.levels.iter().take(ancestors) {
            if let Some(ancestor) = self.store().get_node_execution(level.runtime_id).await? {
                if ancestor.paused {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn insert_node(&self, node: &NodeExecution) -> EngineResult<()> {
        self.persistence()
            .retry_policy()
            .retry("insert node execution", || self.store().insert_node_execution(node))
            .await
    }

    fn arm_node_timer(&self, id: Uuid, attempt: u32, after: Duration) {
        let handle = self.inner.work.push_after(
            Work::NodeExpired {
                node_execution_id: id,
                attempt,
            },
            after,
        );
        let mut timers = self.inner.node_timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = timers.insert(id, handle) {
            previous.abort();
        }
    }

    fn disarm_node_timer(&self, id: Uuid) {
        let mut timers = self.inner.node_timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = timers.remove(&id) {
            handle.abort();
        }
    }
}

fn lookup_node<'p>(plan: &'p Plan, id: &str) -> EngineResult<&'p PlanNode> {
    plan.node(id)
        .ok_or_else(|| EngineError::InvalidPlan(format!("plan {} has no node {}", plan.uuid, id)))
}

fn new_child(
    parent: &NodeExecution,
    plan_node: &PlanNode,
    strategy: Option<crate::engine::strategy::StrategyMetadata>,
    ready: bool,
) -> NodeExecution {
    let postfix = strategy
        .as_ref()
        .map(|s| s.identifier_postfix.clone())
        .unwrap_or_default();
    let mut child = NodeExecution::queued(
        plan_node,
        &parent.ambiance,
        format!("{}{}", plan_node.identifier, postfix),
        strategy,
    );
    child.parent_id = Some(parent.uuid);
    child.parent_attempt = parent.attempt();
    child.ready = ready;
    child
}
