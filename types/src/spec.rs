use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalState {
    /// The task should run indefinitely and is relaunched on failure.
    Running,
    /// The task runs to completion once.
    Finished,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    /// Requested port number; 0 asks for any port from the offered ranges.
    pub port: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub container_path: String,
    pub disk_mb: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub goal: GoalState,
    pub command: String,
    pub cpus: f64,
    pub mem_mb: f64,
    pub ports: Vec<PortSpec>,
}

/// Placement rules are predicates over an offer, evaluated against the
/// already-deployed tasks before any resource matching happens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PlacementRule {
    /// No two instances of this pod on the same hostname.
    UniqueHostname,
    /// No two instances of this pod in the same region.
    UniqueRegion,
    /// No two instances of this pod in the same zone.
    UniqueZone,
    /// No two instances of this pod on agents sharing this attribute value.
    UniqueAttribute(String),
    /// This instance must land on the host running the same-index instance
    /// of the named pod.
    Colocate(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: String,
    pub count: u32,
    pub tasks: Vec<TaskSpec>,
    pub placement: Vec<PlacementRule>,
    pub volumes: Vec<VolumeSpec>,
}

/// The declarative service description the scheduler drives the cluster
/// toward. Two specs with the same identity hash are the same target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub role: String,
    pub principal: String,
    pub pods: Vec<PodSpec>,
}

impl ServiceSpec {
    /// Stable identity hash: hex SHA-256 over the canonical JSON encoding.
    pub fn identity_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("spec serializes");
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn pod(&self, name: &str) -> Option<&PodSpec> {
        self.pods.iter().find(|p| p.name == name)
    }
}

pub fn pod_instance_name(pod: &str, index: u32) -> String {
    format!("{pod}-{index}")
}

pub fn task_name(pod: &str, index: u32, task: &str) -> String {
    format!("{pod}-{index}-{task}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(count: u32) -> ServiceSpec {
        ServiceSpec {
            name: "svc".into(),
            role: "svc-role".into(),
            principal: "svc-principal".into(),
            pods: vec![PodSpec {
                name: "p0".into(),
                count,
                tasks: vec![TaskSpec {
                    name: "server".into(),
                    goal: GoalState::Running,
                    command: "./server".into(),
                    cpus: 1.0,
                    mem_mb: 256.0,
                    ports: vec![],
                }],
                placement: vec![],
                volumes: vec![],
            }],
        }
    }

    #[test]
    fn identity_hash_tracks_content() {
        assert_eq!(spec(2).identity_hash(), spec(2).identity_hash());
        assert_ne!(spec(2).identity_hash(), spec(3).identity_hash());
    }

    #[test]
    fn naming() {
        assert_eq!(pod_instance_name("p0", 1), "p0-1");
        assert_eq!(task_name("p0", 1, "server"), "p0-1-server");
    }
}
