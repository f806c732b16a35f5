use std::sync::Arc;

use flowmill_core::config::EngineConfig;
use flowmill_core::definition::ProcessDefinition;
use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::{DefinitionStore, GroupDirectory, InstanceRepository, TaskRepository};
use flowmill_core::types::{Instance, Task};

use crate::handlers::HandlerRegistry;
use crate::locks::InstanceLocks;
use crate::notify::Notifier;

/// Everything a walk or an API call needs, shared by all workers.
pub struct EngineContext {
    pub definitions: Arc<dyn DefinitionStore>,
    pub instances: Arc<dyn InstanceRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub directory: Arc<dyn GroupDirectory>,
    pub handlers: HandlerRegistry,
    pub notifier: Notifier,
    pub locks: InstanceLocks,
    pub config: EngineConfig,
}

impl EngineContext {
    pub async fn load_instance(&self, instance_id: &str) -> Result<Instance> {
        self.instances
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| FlowError::not_found("instance", instance_id))
    }

    pub async fn load_task(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| FlowError::not_found("task", task_id))
    }

    /// The definition version an instance is pinned to.
    pub async fn pinned_definition(&self, instance: &Instance) -> Result<ProcessDefinition> {
        self.definitions
            .get_definition_version(&instance.definition_id, instance.definition_version)
            .await?
            .ok_or_else(|| {
                FlowError::not_found(
                    "definition",
                    format!("{}@v{}", instance.definition_id, instance.definition_version),
                )
            })
    }
}
