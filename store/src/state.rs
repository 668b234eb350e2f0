use std::sync::Arc;

use kestrel_types::{GoalOverride, TaskId, TaskInfo, TaskStatus, transition_allowed};

use crate::error::StoreError;
use crate::paths;
use crate::persistent::PersistentStore;

/// Persists TaskInfos, TaskStatuses, goal-state overrides, and free-form
/// per-task properties. All writes are single-key; callers relying on
/// multi-record consistency write one record at a time so a crash leaves at
/// most one inconsistent task.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn PersistentStore>,
}

impl StateStore {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        StateStore { store }
    }

    pub async fn store_task(&self, task: &TaskInfo) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(task)?;
        self.store.set(&paths::task_info_path(&task.name), bytes).await
    }

    /// Writes each task individually, in order. Not atomic across tasks.
    pub async fn store_tasks(&self, tasks: &[TaskInfo]) -> Result<(), StoreError> {
        for task in tasks {
            self.store_task(task).await?;
        }
        Ok(())
    }

    pub async fn fetch_task(&self, name: &str) -> Result<Option<TaskInfo>, StoreError> {
        match self.store.get(&paths::task_info_path(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn fetch_tasks(&self) -> Result<Vec<TaskInfo>, StoreError> {
        let mut tasks = Vec::new();
        for name in self.store.list(paths::TASKS).await? {
            if let Some(task) = self.fetch_task(&name).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Looks a task up by its current task-id. Names can be rebound to new
    /// ids over time, so status handling must resolve through the id.
    pub async fn fetch_task_by_id(&self, id: &TaskId) -> Result<Option<TaskInfo>, StoreError> {
        for task in self.fetch_tasks().await? {
            if &task.task_id == id {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Removes every record stored under the task name.
    pub async fn clear_task(&self, name: &str) -> Result<(), StoreError> {
        self.store.recursive_delete(&paths::task_path(name)).await
    }

    /// Persist a status update. The owning task is resolved by task-id;
    /// unknown ids are rejected, as is a terminal task re-entering a
    /// non-terminal state under the same id. Re-writing an identical status
    /// is idempotent.
    pub async fn store_status(&self, status: &TaskStatus) -> Result<String, StoreError> {
        let task = self
            .fetch_task_by_id(&status.task_id)
            .await?
            .ok_or_else(|| StoreError::UnknownTask(status.task_id.0.clone()))?;
        if let Some(existing) = self.fetch_status(&task.name).await?
            && existing.task_id == status.task_id
            && existing.state.is_terminal()
            && !status.state.is_terminal()
        {
            return Err(StoreError::InvalidTransition {
                task: task.name.clone(),
                from: existing.state,
                to: status.state,
            });
        }
        let bytes = serde_json::to_vec(status)?;
        self.store
            .set(&paths::task_status_path(&task.name), bytes)
            .await?;
        Ok(task.name)
    }

    pub async fn fetch_status(&self, name: &str) -> Result<Option<TaskStatus>, StoreError> {
        match self.store.get(&paths::task_status_path(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn clear_status(&self, name: &str) -> Result<(), StoreError> {
        match self.store.delete(&paths::task_status_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn store_goal_override(
        &self,
        name: &str,
        goal: GoalOverride,
    ) -> Result<(), StoreError> {
        let current = self.fetch_goal_override(name).await?;
        if !transition_allowed(current, goal) {
            return Err(StoreError::InvalidOverrideTransition(name.to_string()));
        }
        let bytes = serde_json::to_vec(&goal)?;
        self.store
            .set(&paths::goal_override_path(name), bytes)
            .await
    }

    pub async fn fetch_goal_override(&self, name: &str) -> Result<GoalOverride, StoreError> {
        match self.store.get(&paths::goal_override_path(name)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.is_not_found() => Ok(GoalOverride::default()),
            Err(e) => Err(e),
        }
    }

    pub async fn store_property(
        &self,
        name: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.store
            .set(&paths::task_property_path(name, key), value)
            .await
    }

    pub async fn fetch_property(&self, name: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.store.get(&paths::task_property_path(name, key)).await
    }

    pub async fn list_properties(&self, name: &str) -> Result<Vec<String>, StoreError> {
        self.store.list(&paths::task_properties_path(name)).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kestrel_types::{AgentId, OverrideKind, OverrideProgress, TaskState};

    use super::*;
    use crate::persistent::MemoryStore;

    fn task(name: &str, id: &str) -> TaskInfo {
        TaskInfo {
            name: name.to_string(),
            task_id: TaskId(id.to_string()),
            pod_instance: "p0-0".into(),
            agent_id: AgentId("agent-1".into()),
            hostname: "host-1".into(),
            region: None,
            zone: None,
            attributes: BTreeMap::new(),
            command: "./run".into(),
            resources: vec![],
            labels: BTreeMap::new(),
            config_id: None,
            permanently_failed: false,
        }
    }

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn tasks_round_trip() {
        let s = store();
        s.store_tasks(&[task("p0-0-a", "t1"), task("p0-0-b", "t2")])
            .await
            .unwrap();
        let mut names: Vec<_> = s
            .fetch_tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["p0-0-a", "p0-0-b"]);
        assert_eq!(
            s.fetch_task_by_id(&TaskId("t2".into())).await.unwrap().unwrap().name,
            "p0-0-b"
        );
        s.clear_task("p0-0-a").await.unwrap();
        assert!(s.fetch_task("p0-0-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_requires_known_task() {
        let s = store();
        let err = s
            .store_status(&TaskStatus::new(TaskId("nope".into()), TaskState::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn status_rejects_terminal_to_live_for_same_id() {
        let s = store();
        s.store_task(&task("p0-0-a", "t1")).await.unwrap();
        s.store_status(&TaskStatus::new(TaskId("t1".into()), TaskState::Failed))
            .await
            .unwrap();
        let err = s
            .store_status(&TaskStatus::new(TaskId("t1".into()), TaskState::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // a rebound id may go live again
        s.store_task(&task("p0-0-a", "t2")).await.unwrap();
        s.store_status(&TaskStatus::new(TaskId("t2".into()), TaskState::Running))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn status_is_idempotent() {
        let s = store();
        s.store_task(&task("p0-0-a", "t1")).await.unwrap();
        let status = TaskStatus::new(TaskId("t1".into()), TaskState::Failed);
        s.store_status(&status).await.unwrap();
        s.store_status(&status).await.unwrap();
        assert_eq!(
            s.fetch_status("p0-0-a").await.unwrap().unwrap().state,
            TaskState::Failed
        );
    }

    #[tokio::test]
    async fn goal_override_transitions_are_validated() {
        let s = store();
        assert_eq!(
            s.fetch_goal_override("p0-0-a").await.unwrap(),
            GoalOverride::default()
        );
        s.store_goal_override("p0-0-a", GoalOverride::new(OverrideKind::Paused))
            .await
            .unwrap();
        // regressing progress is rejected
        s.store_goal_override(
            "p0-0-a",
            GoalOverride {
                kind: OverrideKind::Paused,
                progress: OverrideProgress::InProgress,
            },
        )
        .await
        .unwrap();
        let err = s
            .store_goal_override("p0-0-a", GoalOverride::new(OverrideKind::Paused))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOverrideTransition(_)));
    }

    #[tokio::test]
    async fn properties_are_scoped_per_task() {
        let s = store();
        s.store_property("p0-0-a", "checkpoint", b"42".to_vec())
            .await
            .unwrap();
        s.store_property("p0-0-b", "checkpoint", b"7".to_vec())
            .await
            .unwrap();
        assert_eq!(s.fetch_property("p0-0-a", "checkpoint").await.unwrap(), b"42");
        assert_eq!(s.fetch_property("p0-0-b", "checkpoint").await.unwrap(), b"7");
        assert_eq!(
            s.list_properties("p0-0-a").await.unwrap(),
            vec!["checkpoint".to_string()]
        );
    }
}
