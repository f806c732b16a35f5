//! Node dispatch and the graph walk.
//!
//! A walk enters nodes recursively until every branch reaches a suspension
//! point: an end node, a freshly created user task, a failure, or an
//! instance that is no longer running. Each node entry is appended to the
//! execution path under the instance lock. Parallel and inclusive fan-outs
//! run their branches concurrently, each on its own copy of the variables;
//! a branch's writes reach the instance when it next records an entry.

use std::collections::BTreeSet;

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use flowmill_core::definition::{
    Edge, ErrorHandling, HandlerPolicy, Node, NodeKind, ProcessDefinition, UserTaskConfig,
};
use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::HandlerContext;
use flowmill_core::types::{EngineEvent, InstanceStatus, PathEntry, Task, Variables};

use crate::context::EngineContext;
use crate::gateway::{self, GatewayKind};
use crate::lifecycle::{accepts_work, mark_completed, mark_error};
use crate::locks::WorkGuard;
use crate::queue::{WorkItem, WorkStep};
use crate::retry::with_retries;
use crate::tasks::{build_task, explicit_assignee, merge_variables, pick_least_loaded, record_change};
use crate::template::render_map;

/// How one branch of a walk stopped.
#[derive(Debug)]
pub enum WalkOutcome {
    /// Reached this end node.
    Ended(String),
    /// Waiting on a user task, or halted because the instance left RUNNING.
    Parked,
    Failed { node_id: String, error: FlowError },
}

/// Branch-local variables plus the keys this branch has written since its
/// last recorded entry.
#[derive(Debug, Clone, Default)]
pub struct Branch {
    vars: Variables,
    written: Variables,
}

impl Branch {
    pub fn new(vars: Variables) -> Self {
        Self {
            vars,
            written: Variables::new(),
        }
    }

    pub fn vars(&self) -> &Variables {
        &self.vars
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.vars.insert(key.clone(), value.clone());
        self.written.insert(key, value);
    }

    fn take_written(&mut self) -> Variables {
        std::mem::take(&mut self.written)
    }
}

enum Entry {
    Entered,
    Halted,
}

/// Service or script invocation, normalized from the node config.
struct Invocation<'n> {
    service_type: &'n str,
    params: Variables,
    result_variable: Option<&'n str>,
    policy: &'n HandlerPolicy,
}

pub struct Walker<'a> {
    ctx: &'a EngineContext,
    definition: &'a ProcessDefinition,
    instance_id: &'a str,
}

impl<'a> Walker<'a> {
    pub fn new(ctx: &'a EngineContext, definition: &'a ProcessDefinition, instance_id: &'a str) -> Self {
        Self {
            ctx,
            definition,
            instance_id,
        }
    }

    /// Execute a node and everything reachable from it.
    pub fn enter(&self, node_id: String, branch: Branch) -> BoxFuture<'_, Vec<WalkOutcome>> {
        async move {
            let Some(node) = self.definition.graph.node(&node_id) else {
                return vec![WalkOutcome::Failed {
                    error: FlowError::not_found("node", &node_id),
                    node_id,
                }];
            };
            debug!(
                instance_id = %self.instance_id,
                node_id = %node.id,
                node_type = node.kind.type_name(),
                "Entering node"
            );

            let result = match &node.kind {
                NodeKind::Start => self.pass_through(node, branch, Vec::new()).await,
                NodeKind::End => self.end(node, branch).await,
                NodeKind::UserTask(config) => self.user_task(node, config, branch).await,
                NodeKind::ServiceTask(config) => {
                    let invocation = Invocation {
                        service_type: &config.service_type,
                        params: config.params.clone(),
                        result_variable: config.result_variable.as_deref(),
                        policy: &config.policy,
                    };
                    self.invoke(node, invocation, branch).await
                }
                NodeKind::ScriptTask(config) => {
                    let mut params = Variables::new();
                    params.insert("script".into(), Value::String(config.script.clone()));
                    let invocation = Invocation {
                        service_type: &config.service_type,
                        params,
                        result_variable: config.result_variable.as_deref(),
                        policy: &config.policy,
                    };
                    self.invoke(node, invocation, branch).await
                }
                NodeKind::ExclusiveGateway => self.gateway(node, GatewayKind::Exclusive, branch).await,
                NodeKind::ParallelGateway => self.gateway(node, GatewayKind::Parallel, branch).await,
                NodeKind::InclusiveGateway => self.gateway(node, GatewayKind::Inclusive, branch).await,
                NodeKind::Unknown { type_name, .. } => {
                    warn!(
                        instance_id = %self.instance_id,
                        node_id = %node.id,
                        node_type = %type_name,
                        "Unknown node type, passing through"
                    );
                    let warning = format!("unknown node type '{}' skipped", type_name);
                    self.pass_through(node, branch, vec![warning]).await
                }
            };

            result.unwrap_or_else(|error| {
                vec![WalkOutcome::Failed {
                    node_id: node.id.clone(),
                    error,
                }]
            })
        }
        .boxed()
    }

    /// Walk every successor of a node that has already run.
    pub async fn advance(&self, node_id: &str, branch: Branch) -> Vec<WalkOutcome> {
        let targets: Vec<String> = self
            .definition
            .graph
            .targets_of(node_id)
            .into_iter()
            .map(|n| n.id.clone())
            .collect();
        if targets.is_empty() {
            return vec![WalkOutcome::Failed {
                node_id: node_id.to_string(),
                error: FlowError::EngineFault(format!("node '{}' has no outgoing edges", node_id)),
            }];
        }
        self.fan_out(targets, branch).await
    }

    async fn fan_out(&self, mut targets: Vec<String>, branch: Branch) -> Vec<WalkOutcome> {
        if targets.len() == 1 {
            return self.enter(targets.remove(0), branch).await;
        }
        join_all(
            targets
                .into_iter()
                .map(|target| self.enter(target, branch.clone())),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn pass_through(
        &self,
        node: &Node,
        mut branch: Branch,
        warnings: Vec<String>,
    ) -> Result<Vec<WalkOutcome>> {
        if let Entry::Halted = self.record(node, &mut branch, None, warnings, None).await? {
            return Ok(vec![WalkOutcome::Parked]);
        }
        Ok(self.advance(&node.id, branch).await)
    }

    async fn end(&self, node: &Node, mut branch: Branch) -> Result<Vec<WalkOutcome>> {
        Ok(match self.record(node, &mut branch, None, Vec::new(), None).await? {
            Entry::Entered => vec![WalkOutcome::Ended(node.id.clone())],
            Entry::Halted => vec![WalkOutcome::Parked],
        })
    }

    async fn user_task(
        &self,
        node: &Node,
        config: &UserTaskConfig,
        mut branch: Branch,
    ) -> Result<Vec<WalkOutcome>> {
        let mut task = build_task(self.instance_id, node, config, branch.vars());
        self.auto_assign(&mut task, config, branch.vars()).await;

        let result = json!({ "taskId": task.id, "assignee": task.assignee_id });
        if let Entry::Halted = self
            .record(node, &mut branch, Some(result), Vec::new(), Some(&task))
            .await?
        {
            return Ok(vec![WalkOutcome::Parked]);
        }

        info!(
            instance_id = %self.instance_id,
            node_id = %node.id,
            task_id = %task.id,
            assignee = ?task.assignee_id,
            "Task created"
        );
        self.ctx.notifier.emit(EngineEvent::TaskCreated {
            task_id: task.id.clone(),
            instance_id: self.instance_id.to_string(),
            node_id: node.id.clone(),
            assignee_id: task.assignee_id.clone(),
        });
        if let Some(assignee) = &task.assignee_id {
            self.ctx.notifier.emit(EngineEvent::TaskAssigned {
                task_id: task.id.clone(),
                assignee_id: assignee.clone(),
                actor: "engine".into(),
            });
        }
        Ok(vec![WalkOutcome::Parked])
    }

    /// Explicit assignee, else a sole candidate user, else the least loaded
    /// member of the candidate groups. Directory failures leave the task
    /// unassigned.
    async fn auto_assign(&self, task: &mut Task, config: &UserTaskConfig, vars: &Variables) {
        let chosen = if let Some(assignee) = explicit_assignee(config, vars) {
            Some(assignee)
        } else if task.candidate_user_ids.len() == 1 {
            task.candidate_user_ids.iter().next().cloned()
        } else if !task.candidate_group_ids.is_empty() {
            match self.least_loaded_member(&task.candidate_group_ids).await {
                Ok(choice) => choice,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Auto-assignment skipped");
                    None
                }
            }
        } else {
            None
        };

        if let Some(assignee) = chosen {
            record_change(task, "auto-assign", "engine", Some(assignee.clone()), None);
            task.assignee_id = Some(assignee);
        }
    }

    async fn least_loaded_member(&self, groups: &BTreeSet<String>) -> Result<Option<String>> {
        let mut members = BTreeSet::new();
        for group in groups {
            members.extend(self.ctx.directory.members_of(group).await?);
        }
        let mut loads = Vec::with_capacity(members.len());
        for member in members {
            let open = self.ctx.tasks.count_open_for_assignee(&member).await?;
            loads.push((member, open));
        }
        Ok(pick_least_loaded(&loads))
    }

    async fn invoke(
        &self,
        node: &Node,
        invocation: Invocation<'_>,
        mut branch: Branch,
    ) -> Result<Vec<WalkOutcome>> {
        if !self.admit(node).await? {
            return Ok(vec![WalkOutcome::Parked]);
        }

        let policy = invocation.policy;
        let service_type = invocation.service_type;
        let params = render_map(&invocation.params, branch.vars());
        let handler_ctx = HandlerContext {
            instance_id: self.instance_id.to_string(),
            node_id: node.id.clone(),
            variables: branch.vars().clone(),
        };
        let retries = match policy.error_handling {
            ErrorHandling::Retry => policy
                .retry_count
                .unwrap_or(self.ctx.config.retry.max_retries),
            _ => 0,
        };

        let handlers = &self.ctx.handlers;
        let timeout = policy.timeout_secs;
        let outcome = with_retries(service_type, retries, &self.ctx.config.retry, move |_| {
            handlers.execute(service_type, handler_ctx.clone(), params.clone(), timeout)
        })
        .await;

        match outcome {
            Ok(value) => {
                if service_type == "script" {
                    if let Value::Object(assigned) = &value {
                        for (k, v) in assigned {
                            branch.set(k.clone(), v.clone());
                        }
                    }
                }
                if let Some(var) = invocation.result_variable {
                    branch.set(var, value.clone());
                }
                if let Entry::Halted = self
                    .record(node, &mut branch, Some(value), Vec::new(), None)
                    .await?
                {
                    return Ok(vec![WalkOutcome::Parked]);
                }
                Ok(self.advance(&node.id, branch).await)
            }
            Err(e) if e.is_handler_failure() && policy.error_handling == ErrorHandling::Ignore => {
                warn!(
                    instance_id = %self.instance_id,
                    node_id = %node.id,
                    service_type,
                    error = %e,
                    "Handler failed, continuing"
                );
                let result = json!({ "error": e.to_string(), "ignored": true });
                let warning = format!("handler failure ignored: {}", e);
                if let Entry::Halted = self
                    .record(node, &mut branch, Some(result), vec![warning], None)
                    .await?
                {
                    return Ok(vec![WalkOutcome::Parked]);
                }
                Ok(self.advance(&node.id, branch).await)
            }
            Err(e) => {
                let result = json!({ "error": e.to_string() });
                self.record(node, &mut branch, Some(result), Vec::new(), None)
                    .await?;
                Ok(vec![WalkOutcome::Failed {
                    node_id: node.id.clone(),
                    error: e,
                }])
            }
        }
    }

    async fn gateway(
        &self,
        node: &Node,
        kind: GatewayKind,
        mut branch: Branch,
    ) -> Result<Vec<WalkOutcome>> {
        let graph = &self.definition.graph;
        let edges: Vec<&Edge> = graph
            .out_edges(&node.id)
            .into_iter()
            .filter(|e| graph.node(&e.target).is_some())
            .collect();

        match gateway::select(kind, &node.id, &edges, branch.vars()) {
            Ok(selection) => {
                let targets: Vec<String> =
                    selection.edges.iter().map(|e| e.target.clone()).collect();
                let result = json!({ "fired": targets });
                if let Entry::Halted = self
                    .record(node, &mut branch, Some(result), selection.warnings.clone(), None)
                    .await?
                {
                    return Ok(vec![WalkOutcome::Parked]);
                }
                for message in selection.warnings {
                    self.ctx.notifier.emit(EngineEvent::EvaluationWarning {
                        instance_id: self.instance_id.to_string(),
                        node_id: node.id.clone(),
                        message,
                    });
                }
                debug!(
                    instance_id = %self.instance_id,
                    node_id = %node.id,
                    gateway = kind.as_str(),
                    branches = targets.len(),
                    "Gateway fired"
                );
                Ok(self.fan_out(targets, branch).await)
            }
            Err(error) => {
                let result = json!({ "error": error.to_string() });
                self.record(node, &mut branch, Some(result), Vec::new(), None)
                    .await?;
                Ok(vec![WalkOutcome::Failed {
                    node_id: node.id.clone(),
                    error,
                }])
            }
        }
    }

    /// Check, under the lock, that the instance still accepts work; a
    /// suspended instance parks the node for resume.
    async fn admit(&self, node: &Node) -> Result<bool> {
        let _guard = self.ctx.locks.lock(self.instance_id).await;
        let mut instance = self.ctx.load_instance(self.instance_id).await?;
        if accepts_work(instance.status) {
            return Ok(true);
        }
        if instance.status == InstanceStatus::Suspended {
            park(&mut instance.parked_nodes, &node.id);
            instance.touch();
            self.ctx.instances.save_instance(&instance).await?;
            debug!(instance_id = %self.instance_id, node_id = %node.id, "Node parked");
        }
        Ok(false)
    }

    /// Append the path entry for `node`, merging the branch's pending writes.
    /// A task, when given, is inserted in the same critical section.
    async fn record(
        &self,
        node: &Node,
        branch: &mut Branch,
        result: Option<Value>,
        warnings: Vec<String>,
        task: Option<&Task>,
    ) -> Result<Entry> {
        let _guard = self.ctx.locks.lock(self.instance_id).await;
        let mut instance = self.ctx.load_instance(self.instance_id).await?;

        match instance.status {
            s if accepts_work(s) => {}
            InstanceStatus::Suspended => {
                merge_variables(&mut instance.variables, &branch.take_written());
                park(&mut instance.parked_nodes, &node.id);
                instance.touch();
                self.ctx.instances.save_instance(&instance).await?;
                debug!(instance_id = %self.instance_id, node_id = %node.id, "Node parked");
                return Ok(Entry::Halted);
            }
            status => {
                debug!(
                    instance_id = %self.instance_id,
                    node_id = %node.id,
                    %status,
                    "Walk halted"
                );
                return Ok(Entry::Halted);
            }
        }

        merge_variables(&mut instance.variables, &branch.take_written());
        instance.execution_path.push(PathEntry {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            node_type: node.kind.type_name().to_string(),
            timestamp: Utc::now(),
            variables_snapshot: branch.vars().clone(),
            result,
            warnings,
        });
        instance.current_node_id = Some(node.id.clone());
        instance.touch();

        if let Some(task) = task {
            self.ctx.tasks.insert_task(task).await?;
        }
        self.ctx.instances.save_instance(&instance).await?;
        Ok(Entry::Entered)
    }
}

fn park(parked: &mut Vec<String>, node_id: &str) {
    if !parked.iter().any(|n| n == node_id) {
        parked.push(node_id.to_string());
    }
}

/// Run one queued step for its instance, then settle the instance status.
///
/// A step arriving while the instance is suspended is parked instead: an
/// `Enter` parks its node, an `After` parks every successor.
pub async fn run(ctx: &EngineContext, item: &WorkItem, work: WorkGuard) -> Result<()> {
    let instance = {
        let _guard = ctx.locks.lock(&item.instance_id).await;
        let mut instance = ctx.load_instance(&item.instance_id).await?;
        match instance.status {
            s if accepts_work(s) => instance,
            InstanceStatus::Suspended => {
                let nodes = match &item.step {
                    WorkStep::Enter(node_id) => vec![node_id.clone()],
                    WorkStep::After(node_id) => ctx
                        .pinned_definition(&instance)
                        .await?
                        .graph
                        .targets_of(node_id)
                        .iter()
                        .map(|n| n.id.clone())
                        .collect(),
                };
                for node_id in &nodes {
                    park(&mut instance.parked_nodes, node_id);
                }
                instance.touch();
                ctx.instances.save_instance(&instance).await?;
                debug!(instance_id = %instance.id, parked = ?nodes, "Step parked while suspended");
                return Ok(());
            }
            status => {
                debug!(
                    instance_id = %instance.id,
                    %status,
                    node_id = item.node_id(),
                    "Skipping step for inactive instance"
                );
                return Ok(());
            }
        }
    };

    let definition = ctx.pinned_definition(&instance).await?;
    let walker = Walker::new(ctx, &definition, &instance.id);
    let branch = Branch::new(instance.variables.clone());

    let outcomes = match &item.step {
        WorkStep::Enter(node_id) => walker.enter(node_id.clone(), branch).await,
        WorkStep::After(node_id) => walker.advance(node_id, branch).await,
    };
    conclude(ctx, &instance.id, outcomes, work).await
}

/// Move an instance to ERROR after a step failed outside any node.
pub async fn fail(ctx: &EngineContext, instance_id: &str, node_id: Option<&str>, error: &FlowError) {
    let result: Result<bool> = async {
        let _guard = ctx.locks.lock(instance_id).await;
        let mut instance = ctx.load_instance(instance_id).await?;
        if !accepts_work(instance.status) {
            return Ok(false);
        }
        mark_error(&mut instance, node_id, error)?;
        ctx.instances.save_instance(&instance).await?;
        Ok(true)
    }
    .await;

    match result {
        Ok(true) => {
            error!(instance_id, node_id = ?node_id, error = %error, "Instance failed");
            ctx.notifier.emit(EngineEvent::InstanceError {
                instance_id: instance_id.to_string(),
                node_id: node_id.map(String::from),
                message: error.to_string(),
            });
        }
        Ok(false) => {}
        Err(e) => {
            error!(instance_id, error = %e, original = %error, "Could not record instance failure");
        }
    }
}

/// Apply the walk's outcomes to the instance: any failure moves it to
/// ERROR; an end reached with no open tasks and no other outstanding work
/// completes it.
pub async fn conclude(
    ctx: &EngineContext,
    instance_id: &str,
    outcomes: Vec<WalkOutcome>,
    work: WorkGuard,
) -> Result<()> {
    let guard = ctx.locks.lock(instance_id).await;
    drop(work);

    let mut ended = false;
    let mut failure = None;
    for outcome in outcomes {
        match outcome {
            WalkOutcome::Ended(_) => ended = true,
            WalkOutcome::Failed { node_id, error } if failure.is_none() => {
                failure = Some((node_id, error))
            }
            _ => {}
        }
    }
    if failure.is_none() && !ended {
        return Ok(());
    }

    let mut instance = ctx.load_instance(instance_id).await?;
    if !accepts_work(instance.status) {
        return Ok(());
    }

    if let Some((node_id, error)) = failure {
        mark_error(&mut instance, Some(&node_id), &error)?;
        ctx.instances.save_instance(&instance).await?;
        error!(
            instance_id,
            node_id = %node_id,
            kind = error.kind(),
            error = %error,
            "Instance failed"
        );
        ctx.notifier.emit(EngineEvent::InstanceError {
            instance_id: instance_id.to_string(),
            node_id: Some(node_id),
            message: error.to_string(),
        });
        return Ok(());
    }

    if ctx.locks.outstanding(instance_id) > 0 {
        debug!(instance_id, "End reached, sibling work outstanding");
        return Ok(());
    }
    let open = ctx
        .tasks
        .tasks_for_instance(instance_id)
        .await?
        .iter()
        .filter(|t| t.status.is_open())
        .count();
    if open > 0 {
        debug!(instance_id, open_tasks = open, "End reached, tasks still open");
        return Ok(());
    }

    mark_completed(&mut instance)?;
    ctx.instances.save_instance(&instance).await?;
    drop(guard);
    ctx.locks.forget(instance_id);

    let duration_ms = instance.duration_ms.unwrap_or_default();
    info!(instance_id, duration_ms, "Instance completed");
    ctx.notifier.emit(EngineEvent::InstanceCompleted {
        instance_id: instance_id.to_string(),
        duration_ms,
    });
    Ok(())
}
