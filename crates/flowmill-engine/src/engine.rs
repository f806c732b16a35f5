//! The engine orchestrator: instance lifecycle, task operations, and the
//! worker pool that runs walk continuations.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowmill_core::config::EngineConfig;
use flowmill_core::error::{FlowError, Result};
use flowmill_core::event::EventBus;
use flowmill_core::traits::{
    DefinitionStore, GroupDirectory, InstanceRepository, NodeHandler, NotificationPort,
    TaskRepository,
};
use flowmill_core::types::{
    EngineEvent, Instance, InstanceStatus, PathEntry, Principal, Task, Variables,
};

use crate::context::EngineContext;
use crate::dispatcher;
use crate::handlers::HandlerRegistry;
use crate::lifecycle::{
    self, accepts_work, cancel_open_tasks, mark_retried, mark_terminated, resume_tasks,
    suspend_tasks, InstanceAction,
};
use crate::locks::InstanceLocks;
use crate::notify::Notifier;
use crate::overdue::OverdueMonitor;
use crate::queue::{WorkItem, WorkQueue, WorkReceiver};
use crate::tasks;

/// Parameters of `Engine::start_instance`.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub definition_id: String,
    pub variables: Variables,
    pub started_by: String,
    pub business_key: Option<String>,
    pub priority: Option<u8>,
    pub start_params: Variables,
}

impl StartRequest {
    pub fn new(definition_id: impl Into<String>, started_by: impl Into<String>) -> Self {
        Self {
            definition_id: definition_id.into(),
            variables: Variables::new(),
            started_by: started_by.into(),
            business_key: None,
            priority: None,
            start_params: Variables::new(),
        }
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn start_params(mut self, params: Variables) -> Self {
        self.start_params = params;
        self
    }
}

/// Directory used when none is configured: every group is empty.
struct NoGroups;

impl GroupDirectory for NoGroups {
    fn members_of(&self, _group_id: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    definitions: Option<Arc<dyn DefinitionStore>>,
    instances: Option<Arc<dyn InstanceRepository>>,
    tasks: Option<Arc<dyn TaskRepository>>,
    directory: Option<Arc<dyn GroupDirectory>>,
    handlers: Option<HandlerRegistry>,
    extra_handlers: Vec<Arc<dyn NodeHandler>>,
    notifiers: Vec<Arc<dyn NotificationPort>>,
    event_bus: Option<Arc<EventBus>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            definitions: None,
            instances: None,
            tasks: None,
            directory: None,
            handlers: None,
            extra_handlers: Vec::new(),
            notifiers: Vec::new(),
            event_bus: None,
        }
    }

    /// Use one backend for definitions, instances, and tasks.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: DefinitionStore + InstanceRepository + TaskRepository,
    {
        self.definitions(store.clone())
            .instances(store.clone())
            .tasks(store)
    }

    pub fn definitions(mut self, store: Arc<dyn DefinitionStore>) -> Self {
        self.definitions = Some(store);
        self
    }

    pub fn instances(mut self, repo: Arc<dyn InstanceRepository>) -> Self {
        self.instances = Some(repo);
        self
    }

    pub fn tasks(mut self, repo: Arc<dyn TaskRepository>) -> Self {
        self.tasks = Some(repo);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn GroupDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Replace the whole handler registry (built-ins are used otherwise).
    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.handlers = Some(registry);
        self
    }

    /// Register one handler on top of the registry.
    pub fn handler(mut self, handler: impl NodeHandler) -> Self {
        self.extra_handlers.push(Arc::new(handler));
        self
    }

    pub fn notifier(mut self, port: Arc<dyn NotificationPort>) -> Self {
        self.notifiers.push(port);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Build the engine and spawn its workers. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Engine> {
        let definitions = self
            .definitions
            .ok_or_else(|| FlowError::Config("a definition store is required".into()))?;
        let instances = self
            .instances
            .ok_or_else(|| FlowError::Config("an instance repository is required".into()))?;
        let tasks = self
            .tasks
            .ok_or_else(|| FlowError::Config("a task repository is required".into()))?;

        let mut handlers = self
            .handlers
            .unwrap_or_else(|| HandlerRegistry::with_builtins(self.config.engine.handler_timeout_secs));
        for handler in self.extra_handlers {
            handlers.register_arc(handler);
        }

        let bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.engine.event_capacity)));

        let ctx = Arc::new(EngineContext {
            definitions,
            instances,
            tasks,
            directory: self.directory.unwrap_or_else(|| Arc::new(NoGroups)),
            handlers,
            notifier: Notifier::new(bus, self.notifiers),
            locks: InstanceLocks::new(),
            config: self.config,
        });

        Ok(Engine::spawn(ctx))
    }
}

struct Inner {
    ctx: Arc<EngineContext>,
    queue: WorkQueue,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn spawn(ctx: Arc<EngineContext>) -> Self {
        let (queue, rx) = WorkQueue::new(ctx.config.engine.queue_capacity);
        let cancel = CancellationToken::new();
        let workers = (0..ctx.config.engine.workers.max(1))
            .map(|id| tokio::spawn(worker_loop(id, ctx.clone(), rx.clone(), cancel.clone())))
            .collect();
        info!(
            workers = ctx.config.engine.workers.max(1),
            queue_capacity = ctx.config.engine.queue_capacity,
            "Engine started"
        );
        Self {
            inner: Arc::new(Inner {
                ctx,
                queue,
                cancel,
                workers: Mutex::new(workers),
            }),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.inner.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.ctx.notifier.bus().subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Overdue scanner sharing this engine's stores and shutdown token.
    pub fn overdue_monitor(&self) -> OverdueMonitor {
        OverdueMonitor::new(self.inner.ctx.clone(), self.inner.cancel.clone())
    }

    /// Spawn the overdue scan if it is enabled in the config.
    pub fn spawn_overdue_monitor(&self) -> Option<JoinHandle<()>> {
        if !self.inner.ctx.config.overdue.enabled {
            return None;
        }
        let monitor = self.overdue_monitor();
        Some(tokio::spawn(async move { monitor.run().await }))
    }

    /// Queue a step. Awaits when the queue is full.
    pub async fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.inner.ctx.locks.track(&item.instance_id);
        self.submit(item).await
    }

    /// Send an item whose work unit is already tracked.
    async fn submit(&self, item: WorkItem) -> Result<()> {
        let instance_id = item.instance_id.clone();
        if let Err(e) = self.inner.queue.enqueue(item).await {
            drop(self.inner.ctx.locks.adopt(&instance_id));
            return Err(e);
        }
        Ok(())
    }

    /// Resolve once nothing is queued or being walked.
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await;
    }

    /// Drain the queue, then stop the workers.
    pub async fn shutdown(&self) {
        self.wait_idle().await;
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Engine stopped");
    }

    // ── Instances ───────────────────────────────────────────────

    /// Create a RUNNING instance of a published definition and hand the walk
    /// from its start node to the workers.
    pub async fn start_instance(&self, request: StartRequest) -> Result<Instance> {
        let ctx = &self.inner.ctx;
        let definition = ctx
            .definitions
            .get_definition(&request.definition_id)
            .await?
            .ok_or_else(|| FlowError::not_found("definition", &request.definition_id))?;
        if !definition.is_published() {
            return Err(FlowError::InvalidState(format!(
                "definition {} v{} is {}, not published",
                definition.id,
                definition.version,
                definition.status.as_str()
            )));
        }
        let start = definition.graph.start_node()?;

        let mut instance = Instance::new(
            &definition.id,
            definition.version,
            &request.started_by,
            request.variables,
        );
        instance.business_key = request.business_key;
        instance.start_params = request.start_params;
        if let Some(priority) = request.priority {
            instance.priority = priority.min(100);
        }
        instance.execution_path.push(PathEntry {
            node_id: start.id.clone(),
            node_name: start.name.clone(),
            node_type: start.kind.type_name().to_string(),
            timestamp: Utc::now(),
            variables_snapshot: instance.variables.clone(),
            result: None,
            warnings: Vec::new(),
        });
        instance.current_node_id = Some(start.id.clone());

        ctx.instances.insert_instance(&instance).await?;
        info!(
            instance_id = %instance.id,
            definition_id = %definition.id,
            version = definition.version,
            started_by = %instance.started_by,
            "Instance started"
        );
        ctx.notifier.emit(EngineEvent::InstanceStarted {
            instance_id: instance.id.clone(),
            definition_id: definition.id.clone(),
            started_by: instance.started_by.clone(),
        });

        self.enqueue(WorkItem::after(&instance.id, &start.id)).await?;
        Ok(instance)
    }

    /// Walk the successors of `node_id` on the caller's task. No-op unless
    /// the instance is running.
    pub async fn execute_from_node(&self, instance_id: &str, node_id: &str) -> Result<()> {
        self.process(WorkItem::after(instance_id, node_id)).await
    }

    /// Run one work item inline, as a worker would.
    pub async fn process(&self, item: WorkItem) -> Result<()> {
        let ctx = &self.inner.ctx;
        ctx.locks.track(&item.instance_id);
        let work = ctx.locks.adopt(&item.instance_id);
        dispatcher::run(ctx, &item, work).await
    }

    pub async fn suspend_instance(&self, instance_id: &str) -> Result<Instance> {
        let ctx = &self.inner.ctx;
        let guard = ctx.locks.lock(instance_id).await;
        let mut instance = ctx.load_instance(instance_id).await?;
        instance.status = lifecycle::transition(instance.status, InstanceAction::Suspend)?;
        instance.touch();

        let mut tasks = ctx.tasks.tasks_for_instance(instance_id).await?;
        ctx.instances.save_instance(&instance).await?;
        for task in suspend_tasks(&mut tasks) {
            ctx.tasks.save_task(task).await?;
        }
        drop(guard);

        info!(instance_id, "Instance suspended");
        ctx.notifier.emit(EngineEvent::InstanceSuspended {
            instance_id: instance_id.to_string(),
        });
        Ok(instance)
    }

    /// Resume a suspended instance: reopen its tasks and re-enter every node
    /// a walk parked while it was suspended.
    pub async fn resume_instance(&self, instance_id: &str) -> Result<Instance> {
        let ctx = &self.inner.ctx;
        let guard = ctx.locks.lock(instance_id).await;
        let mut instance = ctx.load_instance(instance_id).await?;
        instance.status = lifecycle::transition(instance.status, InstanceAction::Resume)?;

        let mut tasks = ctx.tasks.tasks_for_instance(instance_id).await?;
        for task in resume_tasks(&mut tasks) {
            ctx.tasks.save_task(task).await?;
        }
        let open = tasks.iter().any(|t| t.status.is_open());

        let mut items: Vec<WorkItem> = std::mem::take(&mut instance.parked_nodes)
            .into_iter()
            .map(|node_id| WorkItem::enter(instance_id, node_id))
            .collect();
        if items.is_empty() && !open {
            if let Some(current) = &instance.current_node_id {
                items.push(WorkItem::enter(instance_id, current));
            }
        }
        instance.touch();
        ctx.instances.save_instance(&instance).await?;
        for _ in &items {
            ctx.locks.track(instance_id);
        }
        drop(guard);

        info!(instance_id, resumed_steps = items.len(), "Instance resumed");
        ctx.notifier.emit(EngineEvent::InstanceResumed {
            instance_id: instance_id.to_string(),
        });
        for item in items {
            self.submit(item).await?;
        }
        Ok(instance)
    }

    /// ERROR -> RUNNING, re-entering the node that failed.
    pub async fn retry_instance(&self, instance_id: &str) -> Result<Instance> {
        let ctx = &self.inner.ctx;
        let guard = ctx.locks.lock(instance_id).await;
        let mut instance = ctx.load_instance(instance_id).await?;
        mark_retried(&mut instance)?;

        let node_id = match &instance.current_node_id {
            Some(node_id) => node_id.clone(),
            None => ctx.pinned_definition(&instance).await?.graph.start_node()?.id.clone(),
        };
        ctx.instances.save_instance(&instance).await?;
        ctx.locks.track(instance_id);
        drop(guard);

        info!(instance_id, node_id = %node_id, "Instance retried");
        ctx.notifier.emit(EngineEvent::InstanceResumed {
            instance_id: instance_id.to_string(),
        });
        self.submit(WorkItem::enter(instance_id, node_id)).await?;
        Ok(instance)
    }

    /// Any non-terminal status -> TERMINATED; every open task is cancelled
    /// in the same critical section.
    pub async fn terminate_instance(&self, instance_id: &str, reason: Option<&str>) -> Result<Instance> {
        let ctx = &self.inner.ctx;
        let guard = ctx.locks.lock(instance_id).await;
        let mut instance = ctx.load_instance(instance_id).await?;
        mark_terminated(&mut instance)?;
        instance.parked_nodes.clear();
        if let Some(reason) = reason {
            instance.error_detail = Some(format!("terminated: {}", reason));
        }

        let mut tasks = ctx.tasks.tasks_for_instance(instance_id).await?;
        ctx.instances.save_instance(&instance).await?;
        let mut cancelled = Vec::new();
        for task in cancel_open_tasks(&mut tasks) {
            ctx.tasks.save_task(task).await?;
            cancelled.push(task.id.clone());
        }
        drop(guard);
        ctx.locks.forget(instance_id);

        info!(instance_id, cancelled_tasks = cancelled.len(), "Instance terminated");
        for task_id in cancelled {
            ctx.notifier.emit(EngineEvent::TaskCancelled {
                task_id,
                reason: reason.map(String::from),
            });
        }
        ctx.notifier.emit(EngineEvent::InstanceTerminated {
            instance_id: instance_id.to_string(),
            reason: reason.map(String::from),
        });
        Ok(instance)
    }

    // ── Tasks ───────────────────────────────────────────────────

    /// Lock the owning instance and reload the task inside the section.
    async fn lock_task(&self, task_id: &str) -> Result<(OwnedMutexGuard<()>, Task)> {
        let ctx = &self.inner.ctx;
        let instance_id = ctx.load_task(task_id).await?.instance_id;
        let guard = ctx.locks.lock(&instance_id).await;
        let task = ctx.load_task(task_id).await?;
        Ok((guard, task))
    }

    /// Candidate groups of `task` that `user_id` belongs to.
    async fn member_groups(&self, task: &Task, user_id: &str) -> Result<BTreeSet<String>> {
        let mut groups = BTreeSet::new();
        for group in &task.candidate_group_ids {
            let members = self.inner.ctx.directory.members_of(group).await?;
            if members.iter().any(|m| m == user_id) {
                groups.insert(group.clone());
            }
        }
        Ok(groups)
    }

    async fn is_eligible(&self, task: &Task, user_id: &str) -> Result<bool> {
        let groups = self.member_groups(task, user_id).await?;
        Ok(tasks::eligible(task, user_id, &groups))
    }

    pub async fn claim_task(&self, task_id: &str, principal: &Principal) -> Result<Task> {
        let ctx = &self.inner.ctx;
        let (guard, mut task) = self.lock_task(task_id).await?;
        let changed = tasks::claim(&mut task, principal)?;
        if changed {
            ctx.tasks.save_task(&task).await?;
        }
        drop(guard);

        if changed {
            info!(task_id, user = %principal, "Task claimed");
            ctx.notifier.emit(EngineEvent::TaskClaimed {
                task_id: task.id.clone(),
                user_id: principal.id.clone(),
            });
        } else {
            debug!(task_id, user = %principal, "Task already claimed by this user");
        }
        Ok(task)
    }

    pub async fn unclaim_task(&self, task_id: &str, principal: &Principal) -> Result<Task> {
        let ctx = &self.inner.ctx;
        let (guard, mut task) = self.lock_task(task_id).await?;
        tasks::unclaim(&mut task, principal)?;
        ctx.tasks.save_task(&task).await?;
        drop(guard);
        info!(task_id, user = %principal, "Task released");
        Ok(task)
    }

    pub async fn assign_task(&self, task_id: &str, actor: &Principal, assignee: &str) -> Result<Task> {
        let ctx = &self.inner.ctx;
        let (guard, mut task) = self.lock_task(task_id).await?;
        let eligible = self.is_eligible(&task, assignee).await?;
        tasks::assign(&mut task, actor, assignee, eligible)?;
        ctx.tasks.save_task(&task).await?;
        drop(guard);

        info!(task_id, assignee, actor = %actor, "Task assigned");
        ctx.notifier.emit(EngineEvent::TaskAssigned {
            task_id: task.id.clone(),
            assignee_id: assignee.to_string(),
            actor: actor.id.clone(),
        });
        Ok(task)
    }

    pub async fn delegate_task(
        &self,
        task_id: &str,
        actor: &Principal,
        delegatee: &str,
        reason: Option<&str>,
    ) -> Result<Task> {
        let ctx = &self.inner.ctx;
        let (guard, mut task) = self.lock_task(task_id).await?;
        let from = task.assignee_id.clone();
        let eligible = self.is_eligible(&task, delegatee).await?;
        tasks::delegate(&mut task, actor, delegatee, eligible, reason)?;
        ctx.tasks.save_task(&task).await?;
        drop(guard);

        info!(task_id, from = ?from, to = delegatee, "Task delegated");
        ctx.notifier.emit(EngineEvent::TaskDelegated {
            task_id: task.id.clone(),
            from,
            to: delegatee.to_string(),
        });
        Ok(task)
    }

    pub async fn reassign_task(
        &self,
        task_id: &str,
        actor: &Principal,
        assignee: &str,
        reason: Option<&str>,
    ) -> Result<Task> {
        let ctx = &self.inner.ctx;
        let (guard, mut task) = self.lock_task(task_id).await?;
        let from = task.assignee_id.clone();
        let eligible = self.is_eligible(&task, assignee).await?;
        tasks::reassign(&mut task, actor, assignee, eligible, reason)?;
        ctx.tasks.save_task(&task).await?;
        drop(guard);

        info!(task_id, from = ?from, to = assignee, "Task reassigned");
        ctx.notifier.emit(EngineEvent::TaskReassigned {
            task_id: task.id.clone(),
            from,
            to: assignee.to_string(),
        });
        Ok(task)
    }

    pub async fn transfer_task(
        &self,
        task_id: &str,
        actor: &Principal,
        new_owner: &str,
        reason: Option<&str>,
    ) -> Result<Task> {
        let ctx = &self.inner.ctx;
        let (guard, mut task) = self.lock_task(task_id).await?;
        let from = task.assignee_id.clone();
        let eligible = self.is_eligible(&task, new_owner).await?;
        tasks::transfer(&mut task, actor, new_owner, eligible, reason)?;
        ctx.tasks.save_task(&task).await?;
        drop(guard);

        info!(task_id, from = ?from, to = new_owner, "Task transferred");
        ctx.notifier.emit(EngineEvent::TaskTransferred {
            task_id: task.id.clone(),
            from,
            to: new_owner.to_string(),
        });
        Ok(task)
    }

    pub async fn cancel_task(&self, task_id: &str, actor: &Principal, reason: Option<&str>) -> Result<Task> {
        let ctx = &self.inner.ctx;
        let (guard, mut task) = self.lock_task(task_id).await?;
        tasks::cancel(&mut task, actor, reason)?;
        ctx.tasks.save_task(&task).await?;
        drop(guard);

        info!(task_id, actor = %actor, "Task cancelled");
        ctx.notifier.emit(EngineEvent::TaskCancelled {
            task_id: task.id.clone(),
            reason: reason.map(String::from),
        });
        Ok(task)
    }

    /// Complete a task, merge its variables into the instance, and queue the
    /// walk of the node's successors.
    pub async fn complete_task(
        &self,
        task_id: &str,
        principal: &Principal,
        variables: Variables,
    ) -> Result<Task> {
        let ctx = &self.inner.ctx;
        let (guard, mut task) = self.lock_task(task_id).await?;
        let mut instance = ctx.load_instance(&task.instance_id).await?;
        if !accepts_work(instance.status) {
            return Err(FlowError::InvalidState(format!(
                "instance {} is {}; task {} cannot be completed",
                instance.id, instance.status, task.id
            )));
        }

        tasks::complete(&mut task, principal, variables)?;
        tasks::merge_variables(&mut instance.variables, &task.completion_variables);
        instance.touch();
        ctx.tasks.save_task(&task).await?;
        ctx.instances.save_instance(&instance).await?;
        ctx.locks.track(&instance.id);
        drop(guard);

        info!(task_id, instance_id = %instance.id, user = %principal, "Task completed");
        ctx.notifier.emit(EngineEvent::TaskCompleted {
            task_id: task.id.clone(),
            instance_id: instance.id.clone(),
            user_id: principal.id.clone(),
        });
        self.submit(WorkItem::after(&instance.id, &task.node_id)).await?;
        Ok(task)
    }

    // ── Queries ─────────────────────────────────────────────────

    pub async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        self.inner.ctx.load_instance(instance_id).await
    }

    pub async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<Instance>> {
        self.inner.ctx.instances.list_instances(status).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.inner.ctx.load_task(task_id).await
    }

    pub async fn tasks_for_instance(&self, instance_id: &str) -> Result<Vec<Task>> {
        self.inner.ctx.tasks.tasks_for_instance(instance_id).await
    }

    /// Open tasks this principal may act on.
    pub async fn open_tasks_for(&self, principal: &Principal) -> Result<Vec<Task>> {
        let open = self.inner.ctx.tasks.open_tasks().await?;
        Ok(open
            .into_iter()
            .filter(|t| tasks::can_act(t, principal))
            .collect())
    }
}

async fn worker_loop(
    id: usize,
    ctx: Arc<EngineContext>,
    rx: WorkReceiver,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Worker started");
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let _done = rx.done_on_drop();
        let work = ctx.locks.adopt(&item.instance_id);
        let result = AssertUnwindSafe(dispatcher::run(&ctx, &item, work))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(FlowError::EngineFault(format!(
                    "step panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        if let Err(e) = result {
            error!(
                worker = id,
                instance_id = %item.instance_id,
                node_id = item.node_id(),
                error = %e,
                "Work item failed"
            );
            dispatcher::fail(&ctx, &item.instance_id, Some(item.node_id()), &e).await;
        }
    }
    debug!(worker = id, "Worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
