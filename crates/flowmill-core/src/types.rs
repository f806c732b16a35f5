use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-scoped variable bindings.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Generate a fresh record identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Waiting,
    Suspended,
    Completed,
    Terminated,
    Error,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
            Self::Terminated => "TERMINATED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "WAITING" => Some(Self::Waiting),
            "SUSPENDED" => Some(Self::Suspended),
            "COMPLETED" => Some(Self::Completed),
            "TERMINATED" => Some(Self::Terminated),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Waiting,
    Completed,
    Skipped,
    Cancelled,
    Timeout,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::Cancelled | Self::Timeout
        )
    }

    /// Still awaiting a human.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress | Self::Waiting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Skipped => "SKIPPED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "WAITING" => Some(Self::Waiting),
            "COMPLETED" => Some(Self::Completed),
            "SKIPPED" => Some(Self::Skipped),
            "CANCELLED" => Some(Self::Cancelled),
            "TIMEOUT" => Some(Self::Timeout),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distinguishes how the current assignee got the task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskSubStatus {
    #[default]
    None,
    Delegated,
    Transferred,
}

/// One entry of the append-only execution ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathEntry {
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub variables_snapshot: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One execution of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub definition_id: String,
    pub definition_version: u32,
    #[serde(default)]
    pub business_key: Option<String>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub execution_path: Vec<PathEntry>,
    /// Nodes a walk could not enter because the instance was suspended.
    #[serde(default)]
    pub parked_nodes: Vec<String>,
    pub started_by: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub start_params: Variables,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

pub fn default_priority() -> u8 {
    50
}

impl Instance {
    pub fn new(
        definition_id: impl Into<String>,
        definition_version: u32,
        started_by: impl Into<String>,
        variables: Variables,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            definition_id: definition_id.into(),
            definition_version,
            business_key: None,
            status: InstanceStatus::Running,
            current_node_id: None,
            variables,
            execution_path: Vec::new(),
            parked_nodes: Vec::new(),
            started_by: started_by.into(),
            priority: default_priority(),
            start_params: Variables::new(),
            error_message: None,
            error_detail: None,
            start_time: now,
            end_time: None,
            duration_ms: None,
            updated_at: now,
        }
    }

    /// Node ids of the execution path, in entry order.
    pub fn path_node_ids(&self) -> Vec<&str> {
        self.execution_path
            .iter()
            .map(|e| e.node_id.as_str())
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One assignee change, appended whenever a task changes hands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentChange {
    pub action: String,
    pub actor: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// A unit of externally completed work bound to a user-task node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub instance_id: String,
    pub node_id: String,
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub sub_status: TaskSubStatus,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub candidate_user_ids: BTreeSet<String>,
    #[serde(default)]
    pub candidate_group_ids: BTreeSet<String>,
    #[serde(default)]
    pub form_key: Option<String>,
    #[serde(default)]
    pub form_data: Variables,
    #[serde(default)]
    pub task_variables: Variables,
    #[serde(default)]
    pub completion_variables: Variables,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub overdue: bool,
    #[serde(default)]
    pub history: Vec<AssignmentChange>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        instance_id: impl Into<String>,
        node_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            instance_id: instance_id.into(),
            node_id: node_id.into(),
            name: name.into(),
            status: TaskStatus::Pending,
            sub_status: TaskSubStatus::None,
            assignee_id: None,
            owner_id: None,
            candidate_user_ids: BTreeSet::new(),
            candidate_group_ids: BTreeSet::new(),
            form_key: None,
            form_data: Variables::new(),
            task_variables: Variables::new(),
            completion_variables: Variables::new(),
            due_date: None,
            priority: default_priority(),
            overdue: false,
            history: Vec::new(),
            created_at: now,
            claimed_at: None,
            completed_at: None,
            completed_by: None,
            updated_at: now,
        }
    }

    /// Both candidate sets empty: anyone may act.
    pub fn is_open_to_all(&self) -> bool {
        self.candidate_user_ids.is_empty() && self.candidate_group_ids.is_empty()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// The acting user, as resolved by the caller's auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub groups: BTreeSet<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            groups: BTreeSet::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Lifecycle event broadcast to subscribers and the notification port.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        instance_id: String,
        definition_id: String,
        started_by: String,
    },
    InstanceCompleted {
        instance_id: String,
        duration_ms: i64,
    },
    InstanceError {
        instance_id: String,
        node_id: Option<String>,
        message: String,
    },
    InstanceSuspended { instance_id: String },
    InstanceResumed { instance_id: String },
    InstanceTerminated {
        instance_id: String,
        reason: Option<String>,
    },
    TaskCreated {
        task_id: String,
        instance_id: String,
        node_id: String,
        assignee_id: Option<String>,
    },
    TaskClaimed { task_id: String, user_id: String },
    TaskAssigned {
        task_id: String,
        assignee_id: String,
        actor: String,
    },
    TaskCompleted {
        task_id: String,
        instance_id: String,
        user_id: String,
    },
    TaskDelegated {
        task_id: String,
        from: Option<String>,
        to: String,
    },
    TaskReassigned {
        task_id: String,
        from: Option<String>,
        to: String,
    },
    TaskTransferred {
        task_id: String,
        from: Option<String>,
        to: String,
    },
    TaskCancelled {
        task_id: String,
        reason: Option<String>,
    },
    TaskOverdue {
        task_id: String,
        assignee_id: Option<String>,
        due_date: DateTime<Utc>,
    },
    EvaluationWarning {
        instance_id: String,
        node_id: String,
        message: String,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InstanceStarted { .. } => "instance_started",
            Self::InstanceCompleted { .. } => "instance_completed",
            Self::InstanceError { .. } => "instance_error",
            Self::InstanceSuspended { .. } => "instance_suspended",
            Self::InstanceResumed { .. } => "instance_resumed",
            Self::InstanceTerminated { .. } => "instance_terminated",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskClaimed { .. } => "task_claimed",
            Self::TaskAssigned { .. } => "task_assigned",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskDelegated { .. } => "task_delegated",
            Self::TaskReassigned { .. } => "task_reassigned",
            Self::TaskTransferred { .. } => "task_transferred",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::TaskOverdue { .. } => "task_overdue",
            Self::EvaluationWarning { .. } => "evaluation_warning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(InstanceStatus::Running.as_str(), "RUNNING");
        assert_eq!(InstanceStatus::parse("ERROR"), Some(InstanceStatus::Error));
        assert_eq!(TaskStatus::parse("IN_PROGRESS"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse("nope"), None);
    }

    #[test]
    fn test_status_serde_matches_as_str() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn test_terminal_and_open() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(!InstanceStatus::Error.is_terminal());
        assert!(TaskStatus::Waiting.is_open());
        assert!(!TaskStatus::Error.is_open());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_instance_is_running() {
        let inst = Instance::new("def", 3, "alice", Variables::new());
        assert_eq!(inst.status, InstanceStatus::Running);
        assert_eq!(inst.definition_version, 3);
        assert!(inst.execution_path.is_empty());
    }

    #[test]
    fn test_task_open_to_all() {
        let mut task = Task::new("i", "n", "Review");
        assert!(task.is_open_to_all());
        task.candidate_group_ids.insert("ops".into());
        assert!(!task.is_open_to_all());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let ev = EngineEvent::TaskClaimed {
            task_id: "t".into(),
            user_id: "u".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "task_claimed");
        assert_eq!(ev.name(), "task_claimed");
    }
}
