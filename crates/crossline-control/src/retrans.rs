//! Retransmission of historical pushes.
//!
//! [`RetransmissionOrchestrator::request_retransmission`] records a task and
//! returns at once; a background worker walks the crosses in order, fetches
//! each one's records for the window and republishes them through the push
//! dispatcher.
//!
//! Cancellation is cooperative: the worker checks the task's token before
//! every cross, so the cross being fetched when `cancel_task` lands still
//! completes and is counted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossline_core::errors::TASK_NOT_CANCELLABLE;
use crossline_core::logging::{MarkerOutcome, marker};
use crossline_core::{CrossId, CrosslineError, ObjectType, Result, TaskId};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::TrafficDataSource;
use crate::push::PushDispatcher;

/// Lifecycle of a retransmission task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Accepted, worker not started yet.
    Pending,
    /// Worker is iterating crosses.
    Running,
    /// Every cross was processed.
    Completed,
    /// The worker died unexpectedly.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of a retransmission task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetransTask {
    /// Task id.
    pub task_id: TaskId,
    /// Window start.
    pub start_time: DateTime<Utc>,
    /// Window end.
    pub end_time: DateTime<Utc>,
    /// Replayed object type.
    pub object_type: ObjectType,
    /// Crosses in processing order.
    pub cross_ids: Vec<CrossId>,
    /// Current status.
    pub status: TaskStatus,
    /// Number of crosses.
    pub total_count: usize,
    /// Crosses processed so far.
    pub completed_count: usize,
    /// Records republished so far.
    pub published_count: usize,
    /// When the task was accepted.
    pub created_at: DateTime<Utc>,
    /// Last status or progress change.
    pub updated_at: DateTime<Utc>,
    /// Failure reason for `FAILED` tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

struct TaskEntry {
    state: Mutex<RetransTask>,
    cancel: CancellationToken,
}

impl TaskEntry {
    fn snapshot(&self) -> RetransTask {
        self.state.lock().clone()
    }

    /// Apply `f` unless the task already reached a terminal state.
    fn update(&self, f: impl FnOnce(&mut RetransTask)) -> bool {
        let mut task = self.state.lock();
        if task.status.is_terminal() {
            return false;
        }
        f(&mut task);
        task.updated_at = Utc::now();
        true
    }
}

/// Owns retransmission tasks and their workers.
pub struct RetransmissionOrchestrator {
    data: Arc<dyn TrafficDataSource>,
    dispatcher: Arc<PushDispatcher>,
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
}

impl RetransmissionOrchestrator {
    /// Create an orchestrator.
    pub fn new(data: Arc<dyn TrafficDataSource>, dispatcher: Arc<PushDispatcher>) -> Self {
        Self {
            data,
            dispatcher,
            tasks: DashMap::new(),
        }
    }

    /// Accept a replay request and start it in the background.
    #[instrument(skip(self, cross_ids), fields(crosses = cross_ids.len()))]
    pub fn request_retransmission(
        self: &Arc<Self>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        object_type: &str,
        cross_ids: Vec<CrossId>,
    ) -> Result<RetransTask> {
        let object_type = ObjectType::parse_pushable(object_type)?;
        if start_time > end_time {
            return Err(CrosslineError::validation(
                "retransmission window start is after its end",
            ));
        }
        if cross_ids.is_empty() {
            return Err(CrosslineError::validation("cross id list is empty"));
        }
        if cross_ids.iter().any(CrossId::is_blank) {
            return Err(CrosslineError::validation("cross id list contains a blank id"));
        }

        let now = Utc::now();
        let task = RetransTask {
            task_id: TaskId::new(),
            start_time,
            end_time,
            object_type,
            total_count: cross_ids.len(),
            cross_ids,
            status: TaskStatus::Pending,
            completed_count: 0,
            published_count: 0,
            created_at: now,
            updated_at: now,
            error_message: None,
        };
        let entry = Arc::new(TaskEntry {
            state: Mutex::new(task.clone()),
            cancel: CancellationToken::new(),
        });
        let _ = self.tasks.insert(task.task_id.clone(), Arc::clone(&entry));
        marker("requestRetransmission", &task.task_id, MarkerOutcome::Started);

        let _ = self.spawn_supervised(entry);
        Ok(task)
    }

    /// Run the worker and turn a panic into a `FAILED` task.
    fn spawn_supervised(self: &Arc<Self>, entry: Arc<TaskEntry>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let worker = std::panic::AssertUnwindSafe(orchestrator.run(Arc::clone(&entry)));
            if let Err(panic) = worker.catch_unwind().await {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "retransmission worker panicked".to_owned());
                let task_id = entry.snapshot().task_id;
                error!(%task_id, %reason, "retransmission task failed");
                let _ = entry.update(|t| {
                    t.status = TaskStatus::Failed;
                    t.error_message = Some(reason);
                });
                marker("requestRetransmission", &task_id, MarkerOutcome::Failed);
            }
        })
    }

    async fn run(&self, entry: Arc<TaskEntry>) {
        let task = entry.snapshot();
        if !entry.update(|t| t.status = TaskStatus::Running) {
            debug!(task_id = %task.task_id, "task ended before its worker started");
            return;
        }
        info!(task_id = %task.task_id, crosses = task.total_count, "retransmission started");

        for cross_id in &task.cross_ids {
            if entry.cancel.is_cancelled() {
                info!(task_id = %task.task_id, %cross_id, "retransmission stopped by cancellation");
                return;
            }
            let published = self.replay_cross(&task, cross_id).await;
            let mut task_state = entry.state.lock();
            task_state.completed_count = (task_state.completed_count + 1).min(task_state.total_count);
            task_state.published_count += published;
            task_state.updated_at = Utc::now();
        }

        if entry.update(|t| t.status = TaskStatus::Completed) {
            info!(task_id = %task.task_id, "retransmission completed");
            marker("requestRetransmission", &task.task_id, MarkerOutcome::Succeeded);
        }
    }

    /// Replay one cross. Failures are logged and reported as zero records.
    async fn replay_cross(&self, task: &RetransTask, cross_id: &CrossId) -> usize {
        let records = match self
            .data
            .fetch_historical(task.object_type, cross_id, task.start_time, task.end_time)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(task_id = %task.task_id, %cross_id, error = %e, "historical fetch failed");
                return 0;
            }
        };
        let mut published = 0;
        for record in records {
            match self.dispatcher.publish(task.object_type, record).await {
                Ok(report) if !report.skipped => published += 1,
                Ok(_) => {}
                Err(e) => warn!(task_id = %task.task_id, %cross_id, error = %e, "replay publish failed"),
            }
        }
        debug!(task_id = %task.task_id, %cross_id, published, "cross replayed");
        published
    }

    /// Current snapshot of a task.
    pub fn get_task_status(&self, task_id: &TaskId) -> Result<RetransTask> {
        self.tasks
            .get(task_id)
            .map(|e| e.value().snapshot())
            .ok_or_else(|| CrosslineError::not_found("RetransTask", task_id.as_str()))
    }

    /// Cancel a pending or running task.
    ///
    /// A task already in a terminal state fails with `TASK_NOT_CANCELLABLE`.
    pub fn cancel_task(&self, task_id: &TaskId) -> Result<RetransTask> {
        let entry = self
            .tasks
            .get(task_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CrosslineError::not_found("RetransTask", task_id.as_str()))?;

        let snapshot = {
            let mut task = entry.state.lock();
            if task.status.is_terminal() {
                return Err(CrosslineError::business(
                    TASK_NOT_CANCELLABLE,
                    format!("task {task_id} is already {:?}", task.status),
                ));
            }
            task.status = TaskStatus::Cancelled;
            task.updated_at = Utc::now();
            task.clone()
        };
        entry.cancel.cancel();
        marker("requestRetransmission", task_id, MarkerOutcome::Cancelled);
        Ok(snapshot)
    }

    /// Every task, oldest first.
    pub fn list_tasks(&self) -> Vec<RetransTask> {
        let mut tasks: Vec<RetransTask> = self.tasks.iter().map(|e| e.value().snapshot()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Drop terminal tasks last updated more than `max_keep_days` ago.
    /// Returns how many were removed.
    pub fn cleanup_completed_tasks(&self, max_keep_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_keep_days));
        self.cleanup_older_than(cutoff)
    }

    /// Drop terminal tasks last updated at or before `cutoff`.
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, entry| {
            let task = entry.state.lock();
            !(task.status.is_terminal() && task.updated_at <= cutoff)
        });
        let removed = before.saturating_sub(self.tasks.len());
        if removed > 0 {
            info!(removed, %cutoff, "purged finished retransmission tasks");
        }
        removed
    }

    /// Count of tasks per status.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.tasks.iter() {
            *counts.entry(entry.value().state.lock().status).or_insert(0) += 1;
        }
        counts
    }

    /// Periodically purge finished tasks until `cancel` fires.
    pub fn spawn_cleanup_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        keep_days: u32,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = orchestrator.cleanup_completed_tasks(keep_days);
                    }
                }
            }
            debug!("retransmission sweeper stopped");
        })
    }
}
