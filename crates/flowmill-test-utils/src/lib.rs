//! Fixtures and recording ports shared by the workspace integration tests.

pub mod fixtures;
pub mod ports;

use std::sync::Arc;
use std::time::Duration;

use flowmill_core::config::EngineConfig;
use flowmill_core::definition::ProcessDefinition;
use flowmill_core::traits::DefinitionStore;
use flowmill_core::types::{Instance, Principal, Task, Variables};
use flowmill_engine::engine::StartRequest;
use flowmill_engine::{Engine, EngineBuilder};
use flowmill_store::{MemoryStore, StaticGroupDirectory};

pub use ports::{FailingNotifier, RecordingNotifier};

/// Directory used by every fixture: finance = alice, bob; legal = carol;
/// ops = dave, erin.
pub fn directory() -> StaticGroupDirectory {
    StaticGroupDirectory::default()
        .with_group("finance", ["alice", "bob"])
        .with_group("legal", ["carol"])
        .with_group("ops", ["dave", "erin"])
}

/// Principal carrying the fixture directory's groups for `user_id`.
pub fn principal(user_id: &str) -> Principal {
    Principal::new(user_id).with_groups(directory().groups_of(user_id))
}

/// Build a `Variables` map from a JSON object literal.
pub fn vars(value: serde_json::Value) -> Variables {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Engine over an in-memory store with a recording notifier attached.
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingNotifier>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with(|b| b)
    }

    /// Customize the builder (extra handlers, notifiers) before building.
    pub fn with(customize: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Self {
        let mut config = EngineConfig::default();
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 5;
        Self::with_config(config, customize)
    }

    pub fn with_config(
        config: EngineConfig,
        customize: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingNotifier::default());
        let builder = Engine::builder(config)
            .store(store.clone())
            .directory(Arc::new(directory()))
            .notifier(events.clone());
        let engine = customize(builder).build().expect("engine builds");
        Self {
            engine,
            store,
            events,
        }
    }

    pub async fn deploy(&self, definition: ProcessDefinition) {
        self.store
            .save_definition(&definition)
            .await
            .expect("definition saves");
    }

    /// Start an instance and return it once the queue has drained.
    pub async fn start(&self, definition_id: &str, variables: Variables) -> Instance {
        let started = self
            .engine
            .start_instance(StartRequest::new(definition_id, "tester").variables(variables))
            .await
            .expect("instance starts");
        self.settle().await;
        self.instance(&started.id).await
    }

    pub async fn instance(&self, instance_id: &str) -> Instance {
        self.engine
            .get_instance(instance_id)
            .await
            .expect("instance exists")
    }

    pub async fn tasks(&self, instance_id: &str) -> Vec<Task> {
        self.engine
            .tasks_for_instance(instance_id)
            .await
            .expect("tasks load")
    }

    /// Open tasks of an instance at `node_id`.
    pub async fn open_task_at(&self, instance_id: &str, node_id: &str) -> Task {
        self.tasks(instance_id)
            .await
            .into_iter()
            .find(|t| t.node_id == node_id && t.status.is_open())
            .unwrap_or_else(|| panic!("no open task at {}", node_id))
    }

    /// Complete a task as `user_id` and wait for the walk to settle.
    pub async fn complete(&self, task_id: &str, user_id: &str, variables: Variables) -> Task {
        let task = self
            .engine
            .complete_task(task_id, &principal(user_id), variables)
            .await
            .expect("task completes");
        self.settle().await;
        task
    }

    /// Wait until the queue is idle and port notifications have landed.
    pub async fn settle(&self) {
        self.engine.wait_idle().await;
        tokio::task::yield_now().await;
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
