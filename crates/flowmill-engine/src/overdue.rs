use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowmill_core::error::Result;
use flowmill_core::types::EngineEvent;

use crate::context::EngineContext;

/// Periodic scan that flags open tasks past their due date.
///
/// A task is flagged once; the `TaskOverdue` event fires on the scan that
/// first sees it late.
pub struct OverdueMonitor {
    ctx: Arc<EngineContext>,
    cancel: CancellationToken,
}

impl OverdueMonitor {
    pub fn new(ctx: Arc<EngineContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Run the scan loop. Blocks until cancelled.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.ctx.config.overdue.interval_secs.max(1));
        info!(
            interval_secs = self.ctx.config.overdue.interval_secs,
            "Overdue monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Overdue monitor shutting down");
                    break;
                }
            }

            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Overdue scan failed");
            }
        }
    }

    /// Flag every open task whose due date has passed. Returns how many
    /// tasks were newly flagged.
    pub async fn scan_once(&self) -> Result<usize> {
        let now = Utc::now();
        let late: Vec<_> = self
            .ctx
            .tasks
            .open_tasks()
            .await?
            .into_iter()
            .filter(|t| !t.overdue && t.due_date.is_some_and(|due| due < now))
            .collect();

        let mut flagged = 0;
        for candidate in late {
            let guard = self.ctx.locks.lock(&candidate.instance_id).await;
            let mut task = self.ctx.load_task(&candidate.id).await?;
            let Some(due_date) = task.due_date else {
                continue;
            };
            if task.overdue || !task.status.is_open() {
                continue;
            }
            task.overdue = true;
            task.touch();
            self.ctx.tasks.save_task(&task).await?;
            drop(guard);

            warn!(
                task_id = %task.id,
                instance_id = %task.instance_id,
                assignee = ?task.assignee_id,
                due = %due_date,
                "Task overdue"
            );
            self.ctx.notifier.emit(EngineEvent::TaskOverdue {
                task_id: task.id.clone(),
                assignee_id: task.assignee_id.clone(),
                due_date,
            });
            flagged += 1;
        }
        Ok(flagged)
    }
}
