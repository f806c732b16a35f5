//! Instance state machine and the task cascades it drives.
//!
//! Every transition goes through [`transition`], so an illegal request is
//! rejected with `InvalidState` instead of being applied.

use chrono::Utc;

use flowmill_core::error::{FlowError, Result};
use flowmill_core::types::{Instance, InstanceStatus, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Suspend,
    Resume,
    Retry,
    Terminate,
    Complete,
    Fail,
}

impl InstanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Retry => "retry",
            Self::Terminate => "terminate",
            Self::Complete => "complete",
            Self::Fail => "fail",
        }
    }
}

/// Target status for `action` from `from`, or `InvalidState`.
pub fn transition(from: InstanceStatus, action: InstanceAction) -> Result<InstanceStatus> {
    use InstanceAction as A;
    use InstanceStatus as S;

    let to = match (from, action) {
        (S::Running | S::Waiting, A::Suspend) => S::Suspended,
        (S::Suspended, A::Resume) => S::Running,
        (S::Error, A::Retry) => S::Running,
        (s, A::Terminate) if !s.is_terminal() => S::Terminated,
        (S::Running | S::Waiting, A::Complete) => S::Completed,
        (S::Running | S::Waiting, A::Fail) => S::Error,
        _ => {
            return Err(FlowError::InvalidState(format!(
                "cannot {} an instance in status {}",
                action.as_str(),
                from
            )))
        }
    };
    Ok(to)
}

/// Whether a walk may enter nodes for this instance.
pub fn accepts_work(status: InstanceStatus) -> bool {
    matches!(status, InstanceStatus::Running | InstanceStatus::Waiting)
}

pub fn mark_completed(instance: &mut Instance) -> Result<()> {
    instance.status = transition(instance.status, InstanceAction::Complete)?;
    let now = Utc::now();
    instance.end_time = Some(now);
    instance.duration_ms = Some((now - instance.start_time).num_milliseconds());
    instance.current_node_id = None;
    instance.touch();
    Ok(())
}

pub fn mark_error(instance: &mut Instance, node_id: Option<&str>, error: &FlowError) -> Result<()> {
    instance.status = transition(instance.status, InstanceAction::Fail)?;
    instance.error_message = Some(error.to_string());
    instance.error_detail = Some(format!("{}: {:?}", error.kind(), error));
    if let Some(node_id) = node_id {
        instance.current_node_id = Some(node_id.to_string());
    }
    instance.touch();
    Ok(())
}

pub fn mark_terminated(instance: &mut Instance) -> Result<()> {
    instance.status = transition(instance.status, InstanceAction::Terminate)?;
    let now = Utc::now();
    instance.end_time = Some(now);
    instance.duration_ms = Some((now - instance.start_time).num_milliseconds());
    instance.touch();
    Ok(())
}

pub fn mark_retried(instance: &mut Instance) -> Result<()> {
    instance.status = transition(instance.status, InstanceAction::Retry)?;
    instance.error_message = None;
    instance.error_detail = None;
    instance.touch();
    Ok(())
}

/// PENDING and IN_PROGRESS tasks move to WAITING. Returns the changed tasks.
pub fn suspend_tasks(tasks: &mut [Task]) -> Vec<&Task> {
    tasks
        .iter_mut()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
        .map(|t| {
            t.status = TaskStatus::Waiting;
            t.touch();
            &*t
        })
        .collect()
}

/// WAITING tasks go back to IN_PROGRESS when claimed, else PENDING.
pub fn resume_tasks(tasks: &mut [Task]) -> Vec<&Task> {
    tasks
        .iter_mut()
        .filter(|t| t.status == TaskStatus::Waiting)
        .map(|t| {
            t.status = if t.assignee_id.is_some() && t.claimed_at.is_some() {
                TaskStatus::InProgress
            } else {
                TaskStatus::Pending
            };
            t.touch();
            &*t
        })
        .collect()
}

/// Every open task becomes CANCELLED.
pub fn cancel_open_tasks(tasks: &mut [Task]) -> Vec<&Task> {
    tasks
        .iter_mut()
        .filter(|t| t.status.is_open())
        .map(|t| {
            t.status = TaskStatus::Cancelled;
            t.touch();
            &*t
        })
        .collect()
}
