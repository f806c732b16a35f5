use futures::future::BoxFuture;

use crate::definition::ProcessDefinition;
use crate::error::Result;
use crate::types::*;

/// Definition store, read-only to the engine.
pub trait DefinitionStore: Send + Sync + 'static {
    /// Latest version of a definition, whatever its status.
    fn get_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<ProcessDefinition>>>;

    /// A specific pinned version.
    fn get_definition_version(
        &self,
        id: &str,
        version: u32,
    ) -> BoxFuture<'_, Result<Option<ProcessDefinition>>>;

    /// Store a definition version (authoring side; the engine never calls this).
    fn save_definition(&self, def: &ProcessDefinition) -> BoxFuture<'_, Result<()>>;
}

/// Instance persistence. Saves replace the whole snapshot atomically.
pub trait InstanceRepository: Send + Sync + 'static {
    fn get_instance(&self, id: &str) -> BoxFuture<'_, Result<Option<Instance>>>;

    fn insert_instance(&self, instance: &Instance) -> BoxFuture<'_, Result<()>>;

    /// Write status, current node, variables, path and error fields together.
    fn save_instance(&self, instance: &Instance) -> BoxFuture<'_, Result<()>>;

    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> BoxFuture<'_, Result<Vec<Instance>>>;
}

/// Task persistence.
pub trait TaskRepository: Send + Sync + 'static {
    fn get_task(&self, id: &str) -> BoxFuture<'_, Result<Option<Task>>>;

    fn insert_task(&self, task: &Task) -> BoxFuture<'_, Result<()>>;

    fn save_task(&self, task: &Task) -> BoxFuture<'_, Result<()>>;

    /// All tasks of an instance, oldest first.
    fn tasks_for_instance(&self, instance_id: &str) -> BoxFuture<'_, Result<Vec<Task>>>;

    /// All PENDING / IN_PROGRESS / WAITING tasks, oldest first.
    fn open_tasks(&self) -> BoxFuture<'_, Result<Vec<Task>>>;

    /// Number of open tasks currently assigned to a user.
    fn count_open_for_assignee(&self, user_id: &str) -> BoxFuture<'_, Result<usize>>;
}

/// Outbound lifecycle notifications. Fire-and-forget from the engine's view.
pub trait NotificationPort: Send + Sync + 'static {
    fn notify(&self, event: EngineEvent) -> BoxFuture<'_, Result<()>>;
}

/// Resolves group membership for auto-assignment.
pub trait GroupDirectory: Send + Sync + 'static {
    fn members_of(&self, group_id: &str) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// What a service handler sees when invoked.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub instance_id: String,
    pub node_id: String,
    pub variables: Variables,
}

/// Service / script task handler, keyed by `serviceType`.
pub trait NodeHandler: Send + Sync + 'static {
    /// The `serviceType` this handler serves (e.g. "http").
    fn service_type(&self) -> &str;

    /// Run the handler with already-templated params.
    fn execute(
        &self,
        ctx: HandlerContext,
        params: Variables,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout override in seconds; `None` uses the engine default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}
