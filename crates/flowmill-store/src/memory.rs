use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use flowmill_core::definition::ProcessDefinition;
use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::{DefinitionStore, InstanceRepository, TaskRepository};
use flowmill_core::types::{Instance, InstanceStatus, Task};

#[derive(Default)]
struct TaskTable {
    rows: HashMap<String, Task>,
    /// Insertion order, oldest first.
    order: Vec<String>,
}

impl TaskTable {
    fn ordered<'a>(&'a self, keep: impl Fn(&Task) -> bool + 'a) -> impl Iterator<Item = &'a Task> + 'a {
        self.order
            .iter()
            .filter_map(|id| self.rows.get(id))
            .filter(move |t| keep(t))
    }
}

/// Process-local store backed by hash maps. Used by tests and embedders
/// that do not need durability.
#[derive(Default)]
pub struct MemoryStore {
    definitions: RwLock<HashMap<String, BTreeMap<u32, ProcessDefinition>>>,
    instances: RwLock<HashMap<String, Instance>>,
    tasks: RwLock<TaskTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionStore for MemoryStore {
    fn get_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<ProcessDefinition>>> {
        let id = id.to_string();
        Box::pin(async move {
            let defs = self.definitions.read().await;
            Ok(defs
                .get(&id)
                .and_then(|versions| versions.values().next_back())
                .cloned())
        })
    }

    fn get_definition_version(
        &self,
        id: &str,
        version: u32,
    ) -> BoxFuture<'_, Result<Option<ProcessDefinition>>> {
        let id = id.to_string();
        Box::pin(async move {
            let defs = self.definitions.read().await;
            Ok(defs.get(&id).and_then(|v| v.get(&version)).cloned())
        })
    }

    fn save_definition(&self, def: &ProcessDefinition) -> BoxFuture<'_, Result<()>> {
        let def = def.clone();
        Box::pin(async move {
            def.graph.validate()?;
            let mut defs = self.definitions.write().await;
            let versions = defs.entry(def.id.clone()).or_default();
            if let Some(existing) = versions.get(&def.version) {
                if existing.is_published() {
                    return Err(FlowError::InvalidState(format!(
                        "definition {} v{} is published and immutable",
                        def.id, def.version
                    )));
                }
            }
            versions.insert(def.version, def);
            Ok(())
        })
    }
}

impl InstanceRepository for MemoryStore {
    fn get_instance(&self, id: &str) -> BoxFuture<'_, Result<Option<Instance>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.instances.read().await.get(&id).cloned()) })
    }

    fn insert_instance(&self, instance: &Instance) -> BoxFuture<'_, Result<()>> {
        let instance = instance.clone();
        Box::pin(async move {
            let mut instances = self.instances.write().await;
            if instances.contains_key(&instance.id) {
                return Err(FlowError::Database(format!(
                    "instance {} already exists",
                    instance.id
                )));
            }
            instances.insert(instance.id.clone(), instance);
            Ok(())
        })
    }

    fn save_instance(&self, instance: &Instance) -> BoxFuture<'_, Result<()>> {
        let instance = instance.clone();
        Box::pin(async move {
            let mut instances = self.instances.write().await;
            match instances.get_mut(&instance.id) {
                Some(slot) => {
                    *slot = instance;
                    Ok(())
                }
                None => Err(FlowError::not_found("instance", instance.id)),
            }
        })
    }

    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> BoxFuture<'_, Result<Vec<Instance>>> {
        Box::pin(async move {
            let instances = self.instances.read().await;
            let mut out: Vec<Instance> = instances
                .values()
                .filter(|i| status.map_or(true, |s| i.status == s))
                .cloned()
                .collect();
            out.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
            Ok(out)
        })
    }
}

impl TaskRepository for MemoryStore {
    fn get_task(&self, id: &str) -> BoxFuture<'_, Result<Option<Task>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.tasks.read().await.rows.get(&id).cloned()) })
    }

    fn insert_task(&self, task: &Task) -> BoxFuture<'_, Result<()>> {
        let task = task.clone();
        Box::pin(async move {
            let mut table = self.tasks.write().await;
            if table.rows.contains_key(&task.id) {
                return Err(FlowError::Database(format!("task {} already exists", task.id)));
            }
            table.order.push(task.id.clone());
            table.rows.insert(task.id.clone(), task);
            Ok(())
        })
    }

    fn save_task(&self, task: &Task) -> BoxFuture<'_, Result<()>> {
        let task = task.clone();
        Box::pin(async move {
            let mut table = self.tasks.write().await;
            match table.rows.get_mut(&task.id) {
                Some(slot) => {
                    *slot = task;
                    Ok(())
                }
                None => Err(FlowError::not_found("task", task.id)),
            }
        })
    }

    fn tasks_for_instance(&self, instance_id: &str) -> BoxFuture<'_, Result<Vec<Task>>> {
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            let table = self.tasks.read().await;
            Ok(table
                .ordered(|t| t.instance_id == instance_id)
                .cloned()
                .collect())
        })
    }

    fn open_tasks(&self) -> BoxFuture<'_, Result<Vec<Task>>> {
        Box::pin(async move {
            let table = self.tasks.read().await;
            Ok(table.ordered(|t| t.status.is_open()).cloned().collect())
        })
    }

    fn count_open_for_assignee(&self, user_id: &str) -> BoxFuture<'_, Result<usize>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let table = self.tasks.read().await;
            Ok(table
                .ordered(|t| t.status.is_open() && t.assignee_id.as_deref() == Some(user_id.as_str()))
                .count())
        })
    }
}
