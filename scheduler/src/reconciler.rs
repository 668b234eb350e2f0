use std::collections::HashMap;
use std::time::Duration;

use kestrel_common::wait::backoff_capped;
use kestrel_types::{TaskId, TaskStatus};
use tokio::time::Instant;

use crate::driver::MasterDriver;

/// Re-asks the master for the status of every task the scheduler knows
/// about, on an exponential backoff, until each one has been confirmed.
/// Once the explicit set drains, one final implicit pass (empty task list)
/// catches anything the local view never knew about, then reconciliation
/// stops until the next registration.
pub struct ImplicitReconciler {
    base: Duration,
    cap: Duration,
    pending: HashMap<TaskId, TaskStatus>,
    attempt: usize,
    next: Option<Instant>,
    implicit_done: bool,
}

impl ImplicitReconciler {
    pub fn new(base: Duration, cap: Duration) -> Self {
        ImplicitReconciler {
            base,
            cap,
            pending: HashMap::new(),
            attempt: 0,
            next: None,
            implicit_done: false,
        }
    }

    /// Begin a reconciliation cycle over the given last-known statuses.
    pub fn start(&mut self, statuses: Vec<TaskStatus>) {
        self.pending = statuses
            .into_iter()
            .map(|s| (s.task_id.clone(), s))
            .collect();
        self.attempt = 0;
        self.next = Some(Instant::now());
        self.implicit_done = false;
    }

    /// A status arrived for this task; it no longer needs re-sending.
    pub fn confirm(&mut self, task_id: &TaskId) {
        if self.pending.remove(task_id).is_some() {
            tracing::debug!(%task_id, remaining = self.pending.len(), "task reconciled");
        }
    }

    /// Tasks still awaiting confirmation from the master.
    pub fn pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub async fn tick(&mut self, driver: &dyn MasterDriver) {
        let Some(next) = self.next else {
            return;
        };
        if self.pending.is_empty() {
            if !self.implicit_done {
                tracing::info!("explicit reconciliation complete, requesting implicit pass");
                driver.reconcile_tasks(vec![]).await;
                self.implicit_done = true;
                self.next = None;
            }
            return;
        }
        let now = Instant::now();
        if now < next {
            return;
        }
        tracing::info!(tasks = self.pending.len(), "requesting task reconciliation");
        driver
            .reconcile_tasks(self.pending.values().cloned().collect())
            .await;
        self.attempt += 1;
        self.next = Some(now + backoff_capped(self.base, self.cap, self.attempt));
    }
}
