use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::offer::AgentId;
use crate::resource::Resource;

/// Task identifier. The empty id is a sentinel: a TaskInfo carrying it is a
/// reservation-only record (resources held, no task currently running).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn reservation() -> Self {
        TaskId(String::new())
    }

    pub fn generate(task_name: &str) -> Self {
        TaskId(format!("{}__{}", task_name, Uuid::new_v4()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Dropped,
    Unreachable,
    Gone,
}

impl TaskState {
    /// Terminal states never transition back to a live state for the same
    /// task-id. UNREACHABLE is excluded: an unreachable task may come back.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Dropped
                | TaskState::Gone
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReason {
    GarbageCollectionError,
    AgentRemoved,
    ReconciliationRequested,
    Other(String),
}

impl StatusReason {
    /// Reasons that mark the task as permanently failed: its agent or its
    /// sandbox is gone, so relaunching in place can never succeed.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(
            self,
            StatusReason::GarbageCollectionError | StatusReason::AgentRemoved
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub reason: Option<StatusReason>,
    pub message: Option<String>,
    pub container_ip: Option<String>,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        TaskStatus {
            task_id,
            state,
            reason: None,
            message: None,
            container_ip: None,
        }
    }
}

/// Canonical description of a launched or launchable task. The agent
/// placement fields (hostname, region, zone, attributes) are snapshotted
/// from the offer the task was launched against so placement rules can be
/// evaluated without the agent being re-offered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    pub task_id: TaskId,
    pub pod_instance: String,
    pub agent_id: AgentId,
    pub hostname: String,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub command: String,
    pub resources: Vec<Resource>,
    pub labels: BTreeMap<String, String>,
    pub config_id: Option<Uuid>,
    pub permanently_failed: bool,
}

impl TaskInfo {
    pub fn resource_ids(&self) -> Vec<Uuid> {
        self.resources
            .iter()
            .filter_map(|r| r.resource_id())
            .collect()
    }

    pub fn is_reservation_only(&self) -> bool {
        self.task_id.is_empty()
    }

    /// The pod type, i.e. the instance name with its trailing index removed.
    pub fn pod_type(&self) -> &str {
        match self.pod_instance.rfind('-') {
            Some(i) => &self.pod_instance[..i],
            None => &self.pod_instance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Gone.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Unreachable.is_terminal());
    }

    #[test]
    fn reservation_sentinel() {
        let id = TaskId::reservation();
        assert!(id.is_empty());
        let real = TaskId::generate("pod-0-server");
        assert!(!real.is_empty());
        assert!(real.0.starts_with("pod-0-server__"));
    }

    #[test]
    fn pod_type_strips_index() {
        let mut info = TaskInfo {
            name: "db-3-node".into(),
            task_id: TaskId::reservation(),
            pod_instance: "db-3".into(),
            agent_id: AgentId("a1".into()),
            hostname: "h1".into(),
            region: None,
            zone: None,
            attributes: BTreeMap::new(),
            command: String::new(),
            resources: vec![],
            labels: BTreeMap::new(),
            config_id: None,
            permanently_failed: false,
        };
        assert_eq!(info.pod_type(), "db");
        info.pod_instance = "db".into();
        assert_eq!(info.pod_type(), "db");
    }
}
