//! Task state machine, authorization, and auto-assignment.
//!
//! These are pure rules over a loaded `Task`; the engine wraps each call in
//! the owning instance's lock and persists the result.

use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use flowmill_core::definition::{Node, UserTaskConfig};
use flowmill_core::error::{FlowError, Result};
use flowmill_core::types::{
    AssignmentChange, Principal, Task, TaskStatus, TaskSubStatus, Variables,
};

use crate::template::{render, render_map};

/// May this principal act on the task?
///
/// True for the assignee, a candidate user, a member of a candidate group,
/// or anyone when both candidate sets are empty.
pub fn can_act(task: &Task, principal: &Principal) -> bool {
    task.assignee_id.as_deref() == Some(principal.id.as_str())
        || task.candidate_user_ids.contains(&principal.id)
        || principal
            .groups
            .iter()
            .any(|g| task.candidate_group_ids.contains(g))
        || task.is_open_to_all()
}

pub fn authorize(task: &Task, principal: &Principal) -> Result<()> {
    if can_act(task, principal) {
        Ok(())
    } else {
        Err(FlowError::Unauthorized {
            principal: principal.id.clone(),
            task_id: task.id.clone(),
        })
    }
}

/// Could `user_id` (a member of `member_groups`) hold this task?
pub fn eligible(task: &Task, user_id: &str, member_groups: &BTreeSet<String>) -> bool {
    task.is_open_to_all()
        || task.candidate_user_ids.contains(user_id)
        || member_groups
            .iter()
            .any(|g| task.candidate_group_ids.contains(g))
}

fn require_status(task: &Task, allowed: &[TaskStatus], action: &str) -> Result<()> {
    if allowed.contains(&task.status) {
        Ok(())
    } else {
        Err(FlowError::InvalidState(format!(
            "cannot {} task {} in status {}",
            action, task.id, task.status
        )))
    }
}

/// Append an assignment change; `from` is the current assignee.
pub fn record_change(
    task: &mut Task,
    action: &str,
    actor: &str,
    to: Option<String>,
    reason: Option<&str>,
) {
    task.history.push(AssignmentChange {
        action: action.to_string(),
        actor: actor.to_string(),
        from: task.assignee_id.clone(),
        to,
        reason: reason.map(String::from),
        at: Utc::now(),
    });
}

/// PENDING -> IN_PROGRESS for the principal. Returns `false` when the
/// principal already holds the task (nothing changed).
pub fn claim(task: &mut Task, principal: &Principal) -> Result<bool> {
    match task.assignee_id.as_deref() {
        Some(current) if current == principal.id && task.status == TaskStatus::InProgress => {
            return Ok(false)
        }
        Some(current) if current != principal.id && task.status.is_open() => {
            return Err(FlowError::InvalidState(format!(
                "task {} is already assigned to {}",
                task.id, current
            )))
        }
        _ => {}
    }
    require_status(task, &[TaskStatus::Pending], "claim")?;
    authorize(task, principal)?;

    record_change(task, "claim", &principal.id, Some(principal.id.clone()), None);
    task.assignee_id = Some(principal.id.clone());
    task.status = TaskStatus::InProgress;
    task.claimed_at = Some(Utc::now());
    task.touch();
    Ok(true)
}

/// IN_PROGRESS -> PENDING, only by the current assignee.
pub fn unclaim(task: &mut Task, principal: &Principal) -> Result<()> {
    require_status(task, &[TaskStatus::InProgress], "unclaim")?;
    if task.assignee_id.as_deref() != Some(principal.id.as_str()) {
        return Err(FlowError::Unauthorized {
            principal: principal.id.clone(),
            task_id: task.id.clone(),
        });
    }
    record_change(task, "unclaim", &principal.id, None, None);
    task.assignee_id = None;
    task.claimed_at = None;
    task.status = TaskStatus::Pending;
    task.sub_status = TaskSubStatus::None;
    task.touch();
    Ok(())
}

/// Hand the task to an eligible user on behalf of `actor`.
pub fn assign(task: &mut Task, actor: &Principal, assignee: &str, is_eligible: bool) -> Result<()> {
    require_status(task, &[TaskStatus::Pending, TaskStatus::InProgress], "assign")?;
    authorize(task, actor)?;
    if !is_eligible {
        return Err(FlowError::Unauthorized {
            principal: assignee.to_string(),
            task_id: task.id.clone(),
        });
    }
    record_change(task, "assign", &actor.id, Some(assignee.to_string()), None);
    set_assignee(task, assignee);
    Ok(())
}

/// Like assign, but for a task already in someone's hands.
pub fn reassign(
    task: &mut Task,
    actor: &Principal,
    assignee: &str,
    is_eligible: bool,
    reason: Option<&str>,
) -> Result<()> {
    require_status(task, &[TaskStatus::Pending, TaskStatus::InProgress], "reassign")?;
    authorize(task, actor)?;
    if !is_eligible {
        return Err(FlowError::Unauthorized {
            principal: assignee.to_string(),
            task_id: task.id.clone(),
        });
    }
    record_change(task, "reassign", &actor.id, Some(assignee.to_string()), reason);
    set_assignee(task, assignee);
    task.sub_status = TaskSubStatus::None;
    Ok(())
}

/// Temporarily hand the task to an eligible user. The previous assignee is
/// kept as owner.
pub fn delegate(
    task: &mut Task,
    actor: &Principal,
    delegatee: &str,
    is_eligible: bool,
    reason: Option<&str>,
) -> Result<()> {
    require_status(task, &[TaskStatus::Pending, TaskStatus::InProgress], "delegate")?;
    authorize(task, actor)?;
    require_eligible(task, delegatee, is_eligible)?;
    record_change(task, "delegate", &actor.id, Some(delegatee.to_string()), reason);
    if task.owner_id.is_none() {
        task.owner_id = Some(
            task.assignee_id
                .clone()
                .unwrap_or_else(|| actor.id.clone()),
        );
    }
    set_assignee(task, delegatee);
    task.sub_status = TaskSubStatus::Delegated;
    Ok(())
}

/// Permanently move the task to an eligible user, ownership included.
pub fn transfer(
    task: &mut Task,
    actor: &Principal,
    new_owner: &str,
    is_eligible: bool,
    reason: Option<&str>,
) -> Result<()> {
    require_status(task, &[TaskStatus::Pending, TaskStatus::InProgress], "transfer")?;
    authorize(task, actor)?;
    require_eligible(task, new_owner, is_eligible)?;
    record_change(task, "transfer", &actor.id, Some(new_owner.to_string()), reason);
    task.owner_id = Some(new_owner.to_string());
    set_assignee(task, new_owner);
    task.sub_status = TaskSubStatus::Transferred;
    Ok(())
}

fn require_eligible(task: &Task, user_id: &str, is_eligible: bool) -> Result<()> {
    if is_eligible {
        return Ok(());
    }
    Err(FlowError::Unauthorized {
        principal: user_id.to_string(),
        task_id: task.id.clone(),
    })
}

fn set_assignee(task: &mut Task, assignee: &str) {
    task.assignee_id = Some(assignee.to_string());
    task.status = TaskStatus::InProgress;
    if task.claimed_at.is_none() {
        task.claimed_at = Some(Utc::now());
    }
    task.touch();
}

/// Finish the task. PENDING tasks are claimed implicitly; an IN_PROGRESS
/// task belongs to its assignee.
pub fn complete(task: &mut Task, principal: &Principal, variables: Variables) -> Result<()> {
    require_status(task, &[TaskStatus::Pending, TaskStatus::InProgress], "complete")?;
    authorize(task, principal)?;
    if let Some(assignee) = task.assignee_id.as_deref() {
        if task.status == TaskStatus::InProgress && assignee != principal.id {
            return Err(FlowError::Unauthorized {
                principal: principal.id.clone(),
                task_id: task.id.clone(),
            });
        }
    }
    if task.assignee_id.is_none() {
        task.assignee_id = Some(principal.id.clone());
        task.claimed_at = Some(Utc::now());
    }
    let now = Utc::now();
    task.status = TaskStatus::Completed;
    task.completion_variables = variables;
    task.completed_at = Some(now);
    task.completed_by = Some(principal.id.clone());
    task.touch();
    Ok(())
}

pub fn cancel(task: &mut Task, actor: &Principal, reason: Option<&str>) -> Result<()> {
    require_status(
        task,
        &[TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Waiting],
        "cancel",
    )?;
    authorize(task, actor)?;
    record_change(task, "cancel", &actor.id, None, reason);
    task.status = TaskStatus::Cancelled;
    task.touch();
    Ok(())
}

/// Build the PENDING task for a user-task node, templating its config.
pub fn build_task(instance_id: &str, node: &Node, config: &UserTaskConfig, vars: &Variables) -> Task {
    let name = if node.name.is_empty() {
        node.id.clone()
    } else {
        render(&node.name, vars)
    };
    let mut task = Task::new(instance_id, &node.id, name);

    task.candidate_user_ids = rendered_set(&config.candidate_users, vars);
    task.candidate_group_ids = rendered_set(&config.candidate_groups, vars);
    task.form_key = config.form_key.as_deref().map(|k| render(k, vars));
    task.form_data = render_map(&config.form_data, vars);
    task.task_variables = render_map(&config.task_variables, vars);
    if let Some(priority) = config.priority {
        task.priority = priority.min(100);
    }
    task.due_date = config
        .due_in_minutes
        .and_then(Duration::try_minutes)
        .and_then(|d| task.created_at.checked_add_signed(d));
    task
}

fn rendered_set(values: &[String], vars: &Variables) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| render(v, vars).trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// The explicit `assignee` of a user-task config, templated. Placeholders
/// that did not resolve count as no assignee.
pub fn explicit_assignee(config: &UserTaskConfig, vars: &Variables) -> Option<String> {
    let raw = config.assignee.as_deref()?;
    let rendered = render(raw, vars).trim().to_string();
    if rendered.is_empty() || rendered.contains("${") {
        None
    } else {
        Some(rendered)
    }
}

/// Least-loaded candidate, ties broken by user id.
pub fn pick_least_loaded(loads: &[(String, usize)]) -> Option<String> {
    loads
        .iter()
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(user, _)| user.clone())
}

/// Merge completion variables into instance variables, key by key.
pub fn merge_variables(target: &mut Variables, updates: &Variables) {
    for (k, v) in updates {
        target.insert(k.clone(), v.clone());
    }
}
