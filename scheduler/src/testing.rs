//! Shared test doubles and fixture builders.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_types::{
    AgentId, GoalState, Offer, OfferId, OfferOperation, PodSpec, Resource, ServiceSpec, TaskId,
    TaskInfo, TaskSpec, TaskStatus,
};
use parking_lot::Mutex;

use crate::driver::MasterDriver;

#[derive(Clone, Debug)]
pub enum DriverCall {
    Accept {
        offer_ids: Vec<OfferId>,
        operations: Vec<OfferOperation>,
        refuse: Duration,
    },
    Decline {
        offer_id: OfferId,
        refuse: Duration,
    },
    Kill(TaskId),
    Reconcile(Vec<TaskStatus>),
    Suppress,
    Revive,
    Stop {
        failover: bool,
    },
}

/// Captures every driver call in order.
#[derive(Default)]
pub struct RecordingDriver {
    pub calls: Mutex<Vec<DriverCall>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn accepts(&self) -> Vec<(Vec<OfferId>, Vec<OfferOperation>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Accept {
                    offer_ids,
                    operations,
                    ..
                } => Some((offer_ids, operations)),
                _ => None,
            })
            .collect()
    }

    pub fn declines(&self) -> Vec<(OfferId, Duration)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Decline { offer_id, refuse } => Some((offer_id, refuse)),
                _ => None,
            })
            .collect()
    }

    pub fn kills(&self) -> Vec<TaskId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Kill(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl MasterDriver for RecordingDriver {
    async fn accept_offers(
        &self,
        offer_ids: &[OfferId],
        operations: Vec<OfferOperation>,
        refuse: Duration,
    ) {
        self.calls.lock().push(DriverCall::Accept {
            offer_ids: offer_ids.to_vec(),
            operations,
            refuse,
        });
    }

    async fn decline_offer(&self, offer_id: &OfferId, refuse: Duration) {
        self.calls.lock().push(DriverCall::Decline {
            offer_id: offer_id.clone(),
            refuse,
        });
    }

    async fn kill_task(&self, task_id: &TaskId) {
        self.calls.lock().push(DriverCall::Kill(task_id.clone()));
    }

    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) {
        self.calls.lock().push(DriverCall::Reconcile(statuses));
    }

    async fn suppress_offers(&self) {
        self.calls.lock().push(DriverCall::Suppress);
    }

    async fn revive_offers(&self) {
        self.calls.lock().push(DriverCall::Revive);
    }

    async fn stop(&self, failover: bool) {
        self.calls.lock().push(DriverCall::Stop { failover });
    }
}

pub fn offer(id: &str, agent: &str, hostname: &str, resources: Vec<Resource>) -> Offer {
    Offer {
        id: OfferId(id.to_string()),
        agent_id: AgentId(agent.to_string()),
        hostname: hostname.to_string(),
        region: None,
        zone: None,
        attributes: BTreeMap::new(),
        resources,
    }
}

pub fn single_task_spec(pod: &str, count: u32, cpus: f64) -> ServiceSpec {
    ServiceSpec {
        name: "svc".into(),
        role: "svc-role".into(),
        principal: "svc-principal".into(),
        pods: vec![PodSpec {
            name: pod.to_string(),
            count,
            tasks: vec![TaskSpec {
                name: "server".into(),
                goal: GoalState::Running,
                command: "./server".into(),
                cpus,
                mem_mb: 0.0,
                ports: vec![],
            }],
            placement: vec![],
            volumes: vec![],
        }],
    }
}

pub fn task_info(name: &str, instance: &str, id: &str, resources: Vec<Resource>) -> TaskInfo {
    TaskInfo {
        name: name.to_string(),
        task_id: TaskId(id.to_string()),
        pod_instance: instance.to_string(),
        agent_id: AgentId("agent-1".into()),
        hostname: "host-1".into(),
        region: None,
        zone: None,
        attributes: BTreeMap::new(),
        command: "./server".into(),
        resources,
        labels: BTreeMap::new(),
        config_id: None,
        permanently_failed: false,
    }
}
