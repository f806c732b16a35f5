use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};

use flowmill_core::config::EngineConfig;
use flowmill_core::definition::{ProcessDefinition, ProcessGraph};
use flowmill_core::traits::{DefinitionStore, HandlerContext, InstanceRepository, NodeHandler, TaskRepository};
use flowmill_core::types::{Instance, InstanceStatus, TaskStatus, Variables};
use flowmill_core::{FlowError, Result};
use flowmill_engine::engine::StartRequest;
use flowmill_engine::Engine;
use flowmill_store::SqliteStore;
use flowmill_test_utils::fixtures::{
    amount_router, inclusive_split, linear_approval, parallel_fanout, service_chain,
};
use flowmill_test_utils::{directory, principal, vars, wait_until, FailingNotifier, TestEngine};

/// Fails a fixed number of times, then echoes its params.
struct Flaky {
    failures: AtomicU32,
    calls: Arc<AtomicU32>,
}

impl Flaky {
    fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                failures: AtomicU32::new(failures),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl NodeHandler for Flaky {
    fn service_type(&self) -> &str {
        "flaky"
    }

    fn execute(&self, _ctx: HandlerContext, params: Variables) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(FlowError::handler("flaky", "upstream unavailable"));
            }
            Ok(json!({ "echo": params }))
        })
    }
}

fn definition(id: &str, graph: Value) -> ProcessDefinition {
    let graph: ProcessGraph = serde_json::from_value(graph).unwrap();
    ProcessDefinition::new(id, graph).with_name(id).published()
}

/// start -> review (open to anyone) -> decide -> accepted | rejected
fn decision_flow() -> ProcessDefinition {
    definition(
        "decision",
        json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "review", "type": "userTask"},
                {"id": "decide", "type": "exclusiveGateway"},
                {"id": "accepted", "type": "end"},
                {"id": "rejected", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "review"},
                {"source": "review", "target": "decide"},
                {"source": "decide", "target": "accepted", "condition": "approved == true"},
                {"source": "decide", "target": "rejected"}
            ]
        }),
    )
}

/// Exclusive gateway with no default edge.
fn two_ends() -> ProcessDefinition {
    definition(
        "two-ends",
        json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "g", "type": "exclusiveGateway"},
                {"id": "end1", "type": "end"},
                {"id": "end2", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "g"},
                {"source": "g", "target": "end1", "condition": "amount < 100"},
                {"source": "g", "target": "end2", "condition": "amount >= 100"}
            ]
        }),
    )
}

fn last_node(instance: &Instance) -> &str {
    instance
        .execution_path
        .last()
        .map(|e| e.node_id.as_str())
        .unwrap_or_default()
}

// ── Start ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_requires_published_definition() {
    let t = TestEngine::new();
    let draft = ProcessDefinition::new("draft", linear_approval().graph);
    t.deploy(draft).await;

    let err = t
        .engine
        .start_instance(StartRequest::new("draft", "tester"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));

    let err = t
        .engine
        .start_instance(StartRequest::new("missing", "tester"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(t.engine.list_instances(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_records_start_entry_and_request_fields() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let started = t
        .engine
        .start_instance(
            StartRequest::new("linear-approval", "requester-1")
                .variables(vars(json!({"item": "laptop", "requester": "zoe"})))
                .business_key("PO-7")
                .priority(250),
        )
        .await
        .unwrap();
    assert_eq!(started.status, InstanceStatus::Running);
    assert_eq!(started.execution_path.len(), 1);
    assert_eq!(started.execution_path[0].node_id, "start");
    assert_eq!(started.business_key.as_deref(), Some("PO-7"));
    assert_eq!(started.priority, 100);

    t.settle().await;
    assert_eq!(t.engine.list_instances(None).await.unwrap().len(), 1);
    let task = t.open_task_at(&started.id, "review").await;
    assert_eq!(task.name, "Review laptop");
    assert_eq!(task.form_key.as_deref(), Some("approval-form"));
    assert_eq!(task.form_data["requester"], json!("zoe"));
    assert_eq!(task.priority, 70);
    assert!(task.due_date.is_some());
}

// ── Scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn test_linear_approval_scenario() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", vars(json!({"item": "desk"}))).await;
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.current_node_id.as_deref(), Some("review"));

    let task = t.open_task_at(&instance.id, "review").await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assignee_id.as_deref(), Some("alice"));

    t.complete(&task.id, "alice", vars(json!({"approved": true})))
        .await;

    let done = t.instance(&instance.id).await;
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.variables["approved"], json!(true));
    assert_eq!(done.path_node_ids(), vec!["start", "review", "end"]);
    assert!(done.current_node_id.is_none());
    assert!(done.end_time.is_some());
    assert!(done.duration_ms.is_some());

    let task = t.engine.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_by.as_deref(), Some("alice"));

    let events = t.events.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let events = events.clone();
            async move { events.count("instance_completed") == 1 }
        })
        .await
    );
    assert_eq!(t.events.count("instance_started"), 1);
    assert_eq!(t.events.count("task_created"), 1);
    assert_eq!(t.events.count("task_completed"), 1);
}

#[tokio::test]
async fn test_exclusive_gateway_routes_by_amount() {
    let t = TestEngine::new();
    t.deploy(two_ends()).await;

    let small = t.start("two-ends", vars(json!({"amount": 50}))).await;
    assert_eq!(small.status, InstanceStatus::Completed);
    assert_eq!(last_node(&small), "end1");

    let large = t.start("two-ends", vars(json!({"amount": 500}))).await;
    assert_eq!(large.status, InstanceStatus::Completed);
    assert_eq!(last_node(&large), "end2");
}

#[tokio::test]
async fn test_exclusive_gateway_is_deterministic() {
    let t = TestEngine::new();
    t.deploy(two_ends()).await;

    for _ in 0..5 {
        let instance = t.start("two-ends", vars(json!({"amount": 99}))).await;
        assert_eq!(instance.path_node_ids(), vec!["start", "g", "end1"]);
    }
}

#[tokio::test]
async fn test_exclusive_gateway_without_match_errors() {
    let t = TestEngine::new();
    t.deploy(two_ends()).await;

    let instance = t.start("two-ends", vars(json!({"amount": "lots"}))).await;
    assert_eq!(instance.status, InstanceStatus::Error);
    assert_eq!(instance.current_node_id.as_deref(), Some("g"));
    assert!(instance
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("no outgoing condition matched"));
}

#[tokio::test]
async fn test_amount_router_branches() {
    let t = TestEngine::new();
    t.deploy(amount_router()).await;

    let auto = t.start("amount-router", vars(json!({"amount": 20}))).await;
    assert_eq!(auto.status, InstanceStatus::Completed);
    assert_eq!(auto.variables["approved"], json!(true));
    assert_eq!(auto.variables["approver"], json!("system"));
    assert_eq!(auto.path_node_ids(), vec!["start", "route", "auto", "end"]);

    let mid = t.start("amount-router", vars(json!({"amount": 500}))).await;
    let finance = t.open_task_at(&mid.id, "finance").await;
    assert!(finance.candidate_group_ids.contains("finance"));

    let big = t.start("amount-router", vars(json!({"amount": 5000}))).await;
    let legal = t.open_task_at(&big.id, "legal").await;
    assert_eq!(legal.assignee_id.as_deref(), Some("carol"));
    t.complete(&legal.id, "carol", Variables::new()).await;
    assert_eq!(t.instance(&big.id).await.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_completion_variables_drive_later_gateway() {
    let t = TestEngine::new();
    t.deploy(decision_flow()).await;

    let yes = t.start("decision", Variables::new()).await;
    let task = t.open_task_at(&yes.id, "review").await;
    t.complete(&task.id, "anyone", vars(json!({"approved": true})))
        .await;
    assert_eq!(last_node(&t.instance(&yes.id).await), "accepted");

    let no = t.start("decision", Variables::new()).await;
    let task = t.open_task_at(&no.id, "review").await;
    t.complete(&task.id, "anyone", vars(json!({"approved": false})))
        .await;
    assert_eq!(last_node(&t.instance(&no.id).await), "rejected");
}

#[tokio::test]
async fn test_second_completion_is_rejected() {
    let t = TestEngine::new();
    t.deploy(decision_flow()).await;

    let instance = t.start("decision", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;
    t.complete(&task.id, "anyone", Variables::new()).await;

    let err = t
        .engine
        .complete_task(&task.id, &principal("anyone"), Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));
}

// ── Fan-out ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_parallel_fanout_launches_each_branch_once() {
    let t = TestEngine::new();
    t.deploy(parallel_fanout()).await;

    let instance = t.start("parallel-fanout", Variables::new()).await;
    let path = instance.path_node_ids();
    assert_eq!(path.iter().filter(|n| **n == "legal").count(), 1);
    assert_eq!(path.iter().filter(|n| **n == "ops").count(), 1);
    assert_eq!(t.tasks(&instance.id).await.len(), 2);

    let legal = t.open_task_at(&instance.id, "legal").await;
    assert_eq!(legal.assignee_id.as_deref(), Some("carol"));
    t.complete(&legal.id, "carol", vars(json!({"legalOk": true})))
        .await;
    let partial = t.instance(&instance.id).await;
    assert_eq!(partial.status, InstanceStatus::Running);

    let ops = t.open_task_at(&instance.id, "ops").await;
    let assignee = ops.assignee_id.clone().unwrap();
    t.complete(&ops.id, &assignee, vars(json!({"opsOk": true})))
        .await;

    let done = t.instance(&instance.id).await;
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.variables["legalOk"], json!(true));
    assert_eq!(done.variables["opsOk"], json!(true));
    let ends = done.path_node_ids().iter().filter(|n| **n == "end").count();
    assert_eq!(ends, 2);
}

#[tokio::test]
async fn test_inclusive_split_fires_matching_branches() {
    let t = TestEngine::new();
    t.deploy(inclusive_split()).await;

    let instance = t
        .start(
            "inclusive-split",
            vars(json!({"risk": 9, "region": "eu", "amount": 10})),
        )
        .await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.variables["riskChecked"], json!(true));
    assert_eq!(instance.variables["euChecked"], json!(true));
    assert!(instance.variables.get("bigChecked").is_none());

    let split = instance
        .execution_path
        .iter()
        .find(|e| e.node_id == "split")
        .unwrap();
    assert_eq!(split.warnings.len(), 1);

    let events = t.events.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let events = events.clone();
            async move { events.count("evaluation_warning") == 1 }
        })
        .await
    );
}

#[tokio::test]
async fn test_concurrent_instances_keep_their_paths() {
    let t = TestEngine::new();
    t.deploy(parallel_fanout()).await;

    let starts = (0..12).map(|_| {
        t.engine
            .start_instance(StartRequest::new("parallel-fanout", "load"))
    });
    let started: Vec<Instance> = join_all(starts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    t.settle().await;

    let mut open = Vec::new();
    for instance in &started {
        for task in t.tasks(&instance.id).await {
            open.push(task);
        }
    }
    assert_eq!(open.len(), 24);

    let completions = open.iter().map(|task| {
        let who = principal(task.assignee_id.as_deref().unwrap());
        let engine = t.engine.clone();
        let task_id = task.id.clone();
        async move { engine.complete_task(&task_id, &who, Variables::new()).await }
    });
    for result in join_all(completions).await {
        result.unwrap();
    }
    t.settle().await;

    for instance in &started {
        let done = t.instance(&instance.id).await;
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.execution_path.len(), 6, "path of {}", done.id);
    }
}

// ── Tasks ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_claim_rules() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;
    assert_eq!(task.assignee_id.as_deref(), Some("alice"));

    let claimed = t
        .engine
        .claim_task(&task.id, &principal("alice"))
        .await
        .unwrap();
    assert_eq!(claimed.status, TaskStatus::InProgress);

    let again = t
        .engine
        .claim_task(&task.id, &principal("alice"))
        .await
        .unwrap();
    assert_eq!(again.status, TaskStatus::InProgress);
    assert_eq!(again.claimed_at, claimed.claimed_at);

    let err = t
        .engine
        .claim_task(&task.id, &principal("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));

    let err = t
        .engine
        .complete_task(&task.id, &principal("dave"), Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Unauthorized { .. }));
}

#[tokio::test]
async fn test_unclaim_then_claim_by_group_member() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;
    t.engine
        .claim_task(&task.id, &principal("alice"))
        .await
        .unwrap();
    let released = t
        .engine
        .unclaim_task(&task.id, &principal("alice"))
        .await
        .unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert!(released.assignee_id.is_none());

    let claimed = t
        .engine
        .claim_task(&task.id, &principal("bob"))
        .await
        .unwrap();
    assert_eq!(claimed.assignee_id.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_reassign_requires_eligible_target() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;

    let err = t
        .engine
        .reassign_task(&task.id, &principal("alice"), "dave", None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Unauthorized { .. }));

    let moved = t
        .engine
        .reassign_task(&task.id, &principal("alice"), "bob", Some("vacation"))
        .await
        .unwrap();
    assert_eq!(moved.assignee_id.as_deref(), Some("bob"));
    let last = moved.history.last().unwrap();
    assert_eq!(last.action, "reassign");
    assert_eq!(last.reason.as_deref(), Some("vacation"));
}

#[tokio::test]
async fn test_delegated_task_completes_the_walk() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;
    let delegated = t
        .engine
        .delegate_task(&task.id, &principal("alice"), "bob", None)
        .await
        .unwrap();
    assert_eq!(delegated.assignee_id.as_deref(), Some("bob"));
    assert_eq!(delegated.owner_id.as_deref(), Some("alice"));

    let err = t
        .engine
        .complete_task(&task.id, &principal("alice"), Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Unauthorized { .. }));

    t.complete(&task.id, "bob", Variables::new()).await;
    assert_eq!(
        t.instance(&instance.id).await.status,
        InstanceStatus::Completed
    );
}

#[tokio::test]
async fn test_delegate_and_transfer_to_outsider_rejected() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;
    t.engine
        .claim_task(&task.id, &principal("alice"))
        .await
        .unwrap();

    let err = t
        .engine
        .delegate_task(&task.id, &principal("alice"), "mallory", None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Unauthorized { ref principal, .. } if principal == "mallory"));

    let err = t
        .engine
        .transfer_task(&task.id, &principal("alice"), "mallory", Some("leaving"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Unauthorized { .. }));

    let stored = t.engine.get_task(&task.id).await.unwrap();
    assert_eq!(stored.assignee_id.as_deref(), Some("alice"));
    assert!(stored.owner_id.is_none());
    assert!(!stored.candidate_user_ids.contains("mallory"));
    assert!(t
        .engine
        .open_tasks_for(&principal("mallory"))
        .await
        .unwrap()
        .is_empty());

    let err = t
        .engine
        .complete_task(&task.id, &principal("mallory"), Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Unauthorized { .. }));
    assert_eq!(t.instance(&instance.id).await.status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_cancel_task_leaves_instance_running() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;
    let cancelled = t
        .engine
        .cancel_task(&task.id, &principal("alice"), Some("duplicate"))
        .await
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let err = t
        .engine
        .complete_task(&task.id, &principal("alice"), Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));
    assert_eq!(t.instance(&instance.id).await.status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_open_tasks_for_filters_by_candidacy() {
    let t = TestEngine::new();
    t.deploy(parallel_fanout()).await;
    t.deploy(linear_approval()).await;

    t.start("parallel-fanout", Variables::new()).await;
    t.start("linear-approval", Variables::new()).await;

    let carol = t.engine.open_tasks_for(&principal("carol")).await.unwrap();
    assert_eq!(carol.len(), 1);
    assert_eq!(carol[0].node_id, "legal");

    let bob = t.engine.open_tasks_for(&principal("bob")).await.unwrap();
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].node_id, "review");

    assert!(t
        .engine
        .open_tasks_for(&principal("mallory"))
        .await
        .unwrap()
        .is_empty());
}

// ── Instance lifecycle ──────────────────────────────────────────

#[tokio::test]
async fn test_terminate_from_every_live_status() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;
    t.deploy(service_chain("missing", "propagate")).await;

    // RUNNING with an open task
    let running = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&running.id, "review").await;
    let terminated = t
        .engine
        .terminate_instance(&running.id, Some("obsolete"))
        .await
        .unwrap();
    assert_eq!(terminated.status, InstanceStatus::Terminated);
    assert!(terminated.end_time.is_some());
    assert_eq!(
        t.engine.get_task(&task.id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    // SUSPENDED
    let suspended = t.start("linear-approval", Variables::new()).await;
    t.engine.suspend_instance(&suspended.id).await.unwrap();
    let out = t
        .engine
        .terminate_instance(&suspended.id, None)
        .await
        .unwrap();
    assert_eq!(out.status, InstanceStatus::Terminated);
    assert!(t
        .tasks(&suspended.id)
        .await
        .iter()
        .all(|t| t.status == TaskStatus::Cancelled));

    // ERROR
    let failed = t.start("service-chain", Variables::new()).await;
    assert_eq!(failed.status, InstanceStatus::Error);
    let out = t.engine.terminate_instance(&failed.id, None).await.unwrap();
    assert_eq!(out.status, InstanceStatus::Terminated);

    // WAITING
    let mut waiting = Instance::new("linear-approval", 1, "tester", Variables::new());
    waiting.status = InstanceStatus::Waiting;
    t.store.insert_instance(&waiting).await.unwrap();
    let out = t.engine.terminate_instance(&waiting.id, None).await.unwrap();
    assert_eq!(out.status, InstanceStatus::Terminated);

    // already terminal
    let err = t
        .engine
        .terminate_instance(&running.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));
}

#[tokio::test]
async fn test_terminate_completed_instance_fails() {
    let t = TestEngine::new();
    t.deploy(two_ends()).await;

    let done = t.start("two-ends", vars(json!({"amount": 1}))).await;
    assert_eq!(done.status, InstanceStatus::Completed);
    let err = t.engine.terminate_instance(&done.id, None).await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));
}

#[tokio::test]
async fn test_late_resumption_after_terminate_is_ignored() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    t.engine.terminate_instance(&instance.id, None).await.unwrap();
    let before = t.instance(&instance.id).await.execution_path.len();

    t.engine
        .execute_from_node(&instance.id, "review")
        .await
        .unwrap();
    let after = t.instance(&instance.id).await;
    assert_eq!(after.status, InstanceStatus::Terminated);
    assert_eq!(after.execution_path.len(), before);
}

#[tokio::test]
async fn test_suspend_and_resume_around_a_user_task() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;

    let suspended = t.engine.suspend_instance(&instance.id).await.unwrap();
    assert_eq!(suspended.status, InstanceStatus::Suspended);
    assert_eq!(
        t.engine.get_task(&task.id).await.unwrap().status,
        TaskStatus::Waiting
    );

    let err = t
        .engine
        .complete_task(&task.id, &principal("alice"), Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));

    let err = t.engine.suspend_instance(&instance.id).await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));

    t.engine.resume_instance(&instance.id).await.unwrap();
    t.settle().await;
    let task = t.engine.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assignee_id.as_deref(), Some("alice"));

    t.complete(&task.id, "alice", Variables::new()).await;
    assert_eq!(
        t.instance(&instance.id).await.status,
        InstanceStatus::Completed
    );
}

// ── Handlers and error policies ─────────────────────────────────

#[tokio::test]
async fn test_service_chain_with_builtin_handlers() {
    let t = TestEngine::new();
    t.deploy(service_chain("custom", "propagate")).await;

    let instance = t
        .start(
            "service-chain",
            vars(json!({"customer": {"name": "Acme", "email": "ops@acme.test"}})),
        )
        .await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance.path_node_ids(),
        vec!["start", "call", "notify", "end"]
    );
    assert!(instance.variables["callResult"].is_object());

    let notify = instance
        .execution_path
        .iter()
        .find(|e| e.node_id == "notify")
        .unwrap();
    assert_eq!(notify.result.as_ref().unwrap()["to"], json!("ops@acme.test"));
}

#[tokio::test]
async fn test_handler_failure_then_retry_instance() {
    let (flaky, calls) = Flaky::new(1);
    let t = TestEngine::with(|b| b.handler(flaky));
    t.deploy(service_chain("flaky", "propagate")).await;

    let customer = vars(json!({"customer": {"name": "Acme", "email": "a@acme.test"}}));
    let failed = t.start("service-chain", customer).await;
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.current_node_id.as_deref(), Some("call"));
    assert!(failed
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("upstream unavailable"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    t.engine.retry_instance(&failed.id).await.unwrap();
    t.settle().await;
    let recovered = t.instance(&failed.id).await;
    assert_eq!(recovered.status, InstanceStatus::Completed);
    assert!(recovered.error_message.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let err = t.engine.retry_instance(&failed.id).await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidState(_)));
}

#[tokio::test]
async fn test_retry_policy_recovers_within_budget() {
    let (flaky, calls) = Flaky::new(2);
    let t = TestEngine::with(|b| b.handler(flaky));
    t.deploy(service_chain("flaky", "retry")).await;

    let instance = t
        .start(
            "service-chain",
            vars(json!({"customer": {"name": "Acme", "email": "a@acme.test"}})),
        )
        .await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_policy_exhausted_errors() {
    let (flaky, calls) = Flaky::new(10);
    let t = TestEngine::with(|b| b.handler(flaky));
    t.deploy(service_chain("flaky", "retry")).await;

    let instance = t.start("service-chain", Variables::new()).await;
    assert_eq!(instance.status, InstanceStatus::Error);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_ignore_policy_continues_with_warning() {
    let t = TestEngine::new();
    t.deploy(service_chain("missing", "ignore")).await;

    let instance = t
        .start(
            "service-chain",
            vars(json!({"customer": {"email": "a@acme.test"}})),
        )
        .await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    let call = instance
        .execution_path
        .iter()
        .find(|e| e.node_id == "call")
        .unwrap();
    assert_eq!(call.result.as_ref().unwrap()["ignored"], json!(true));
    assert_eq!(call.warnings.len(), 1);
}

// ── Ports ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_failing_notifier_never_fails_operations() {
    let t = TestEngine::with(|b| b.notifier(Arc::new(FailingNotifier)));
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let task = t.open_task_at(&instance.id, "review").await;
    t.complete(&task.id, "alice", Variables::new()).await;
    assert_eq!(
        t.instance(&instance.id).await.status,
        InstanceStatus::Completed
    );

    let events = t.events.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let events = events.clone();
            async move { events.count("instance_completed") == 1 }
        })
        .await
    );
}

#[tokio::test]
async fn test_event_bus_sees_lifecycle() {
    let t = TestEngine::new();
    t.deploy(two_ends()).await;
    let mut rx = t.engine.subscribe();

    t.start("two-ends", vars(json!({"amount": 3}))).await;

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names, vec!["instance_started", "instance_completed"]);
}

#[tokio::test]
async fn test_overdue_scan_flags_without_status_change() {
    let t = TestEngine::new();
    t.deploy(linear_approval()).await;

    let instance = t.start("linear-approval", Variables::new()).await;
    let mut task = t.open_task_at(&instance.id, "review").await;
    task.due_date = Some(chrono::Utc::now() - chrono::Duration::minutes(5));
    t.store.save_task(&task).await.unwrap();

    let monitor = t.engine.overdue_monitor();
    assert_eq!(monitor.scan_once().await.unwrap(), 1);
    assert_eq!(monitor.scan_once().await.unwrap(), 0);

    let task = t.engine.get_task(&task.id).await.unwrap();
    assert!(task.overdue);
    assert_eq!(task.status, TaskStatus::Pending);
}

// ── SQLite ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_sqlite_backed_engine_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("flowmill.db");
    let mut config = EngineConfig::default();
    config.retry.initial_backoff_ms = 1;

    let instance_id = {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        store.save_definition(&linear_approval()).await.unwrap();
        let engine = Engine::builder(config.clone())
            .store(store.clone())
            .directory(Arc::new(directory()))
            .build()
            .unwrap();
        let started = engine
            .start_instance(StartRequest::new("linear-approval", "tester"))
            .await
            .unwrap();
        engine.shutdown().await;
        started.id
    };

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let engine = Engine::builder(config)
        .store(store.clone())
        .directory(Arc::new(directory()))
        .build()
        .unwrap();

    let tasks = engine.tasks_for_instance(&instance_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].node_id, "review");

    engine
        .complete_task(&tasks[0].id, &principal("alice"), vars(json!({"ok": 1})))
        .await
        .unwrap();
    engine.wait_idle().await;

    let done = store.get_instance(&instance_id).await.unwrap().unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.variables["ok"], json!(1));
    assert_eq!(done.path_node_ids(), vec!["start", "review", "end"]);
    engine.shutdown().await;
}
