use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::wait::backoff_capped;
use kestrel_types::{TaskId, TaskStatus};
use tokio::time::Instant;

use crate::driver::MasterDriver;

struct KillRecord {
    attempt: usize,
    next: Instant,
}

/// Tracks every requested kill until a terminal status arrives for the
/// task-id, re-issuing outstanding kills on a capped backoff. Kill delivery
/// to the master is best-effort, so silence means retry.
pub struct TaskKiller {
    driver: Arc<dyn MasterDriver>,
    base: Duration,
    cap: Duration,
    outstanding: HashMap<TaskId, KillRecord>,
}

impl TaskKiller {
    pub fn new(driver: Arc<dyn MasterDriver>, base: Duration) -> Self {
        TaskKiller {
            driver,
            base,
            cap: Duration::from_secs(120),
            outstanding: HashMap::new(),
        }
    }

    /// Idempotent: a task already being killed is not re-requested early.
    pub async fn kill(&mut self, task_id: TaskId) {
        if task_id.is_empty() || self.outstanding.contains_key(&task_id) {
            return;
        }
        tracing::info!(%task_id, "killing task");
        self.driver.kill_task(&task_id).await;
        self.outstanding.insert(
            task_id,
            KillRecord {
                attempt: 0,
                next: Instant::now() + self.base,
            },
        );
    }

    /// A terminal status settles the kill.
    pub fn confirm(&mut self, status: &TaskStatus) {
        if status.state.is_terminal() && self.outstanding.remove(&status.task_id).is_some() {
            tracing::debug!(task_id = %status.task_id, "kill confirmed");
        }
    }

    /// Re-issue kills whose retry deadline passed.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let due: Vec<TaskId> = self
            .outstanding
            .iter()
            .filter(|(_, r)| r.next <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            tracing::debug!(task_id = %id, "re-issuing kill");
            self.driver.kill_task(&id).await;
            if let Some(record) = self.outstanding.get_mut(&id) {
                record.attempt += 1;
                record.next = now + backoff_capped(self.base, self.cap, record.attempt);
            }
        }
    }

    pub fn idle(&self) -> bool {
        self.outstanding.is_empty()
    }
}
