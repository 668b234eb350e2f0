use std::collections::HashMap;

use kestrel_types::{
    CPUS, DISK, GoalOverride, GoalState, MEM, OverrideKind, PORTS, PodSpec, PortRange, Resource,
    ServiceSpec, TaskInfo, TaskState, TaskStatus, ResourceValue, pod_instance_name, task_name,
};
use uuid::Uuid;

use crate::evaluator::{PodInstanceRequirement, ResourceRequest, TaskRequirement, VolumeRequest};
use crate::plan::{Phase, Plan, PlanManager, Step, StepWork, Strategy, StatusCtx};

/// Command substituted for a paused task: the container comes up and holds
/// its resources without doing the task's real work.
pub const PAUSE_COMMAND: &str = "sleep infinity";

fn existing_resource_id(prior: Option<&TaskInfo>, name: &str) -> Option<Uuid> {
    prior?
        .resources
        .iter()
        .find(|r| r.name == name && r.volume.is_none())
        .and_then(Resource::resource_id)
}

fn existing_volume_id(prior: Option<&TaskInfo>, container_path: &str) -> Option<Uuid> {
    prior?
        .resources
        .iter()
        .find(|r| {
            r.volume
                .as_ref()
                .is_some_and(|v| v.container_path == container_path)
        })
        .and_then(Resource::resource_id)
}

/// Translate one pod instance of the spec into the evaluator's requirement,
/// folding in reservations already held and any goal-state override.
///
/// With `reuse_reservations` false the requirement asks for everything
/// fresh: the replace path after a permanent failure.
pub fn build_requirement(
    pod: &PodSpec,
    index: u32,
    config_id: Option<Uuid>,
    existing: &[TaskInfo],
    overrides: &HashMap<String, GoalOverride>,
    reuse_reservations: bool,
) -> PodInstanceRequirement {
    let instance = pod_instance_name(&pod.name, index);
    let mut tasks = Vec::new();
    for (i, task) in pod.tasks.iter().enumerate() {
        let name = task_name(&pod.name, index, &task.name);
        let prior = existing
            .iter()
            .find(|t| t.name == name)
            .filter(|t| reuse_reservations && !t.permanently_failed);
        let goal_override = overrides.get(&name).copied().unwrap_or_default();
        let suppressed = matches!(
            goal_override.kind,
            OverrideKind::Stopped | OverrideKind::Decommissioning
        );
        if suppressed && prior.is_none() {
            // Nothing running and nothing reserved: do not reserve on behalf
            // of a task that will not launch.
            continue;
        }
        let command = if goal_override.kind == OverrideKind::Paused {
            PAUSE_COMMAND.to_string()
        } else {
            task.command.clone()
        };

        let mut resources = Vec::new();
        if task.cpus > 0.0 {
            resources.push(ResourceRequest {
                name: CPUS.into(),
                value: ResourceValue::Scalar(task.cpus),
                existing_id: existing_resource_id(prior, CPUS),
                volume: None,
            });
        }
        if task.mem_mb > 0.0 {
            resources.push(ResourceRequest {
                name: MEM.into(),
                value: ResourceValue::Scalar(task.mem_mb),
                existing_id: existing_resource_id(prior, MEM),
                volume: None,
            });
        }
        if !task.ports.is_empty() {
            resources.push(ResourceRequest {
                name: PORTS.into(),
                value: ResourceValue::Ranges(
                    task.ports
                        .iter()
                        .map(|p| PortRange {
                            begin: p.port,
                            end: p.port,
                        })
                        .collect(),
                ),
                existing_id: existing_resource_id(prior, PORTS),
                volume: None,
            });
        }
        if i == 0 {
            // Pod volumes ride on the first task's resource set.
            for volume in &pod.volumes {
                resources.push(ResourceRequest {
                    name: DISK.into(),
                    value: ResourceValue::Scalar(volume.disk_mb),
                    existing_id: existing_volume_id(prior, &volume.container_path),
                    volume: Some(VolumeRequest {
                        container_path: volume.container_path.clone(),
                    }),
                });
            }
        }
        tasks.push(TaskRequirement {
            name,
            command,
            goal: task.goal,
            should_launch: !suppressed,
            resources,
        });
    }
    PodInstanceRequirement {
        pod_instance: instance,
        placement: pod.placement.clone(),
        tasks,
        config_id,
    }
}

/// Drives the cluster from whatever is running toward the target config,
/// one pod instance at a time. Instances already at the target start their
/// steps COMPLETE, so only the delta is worked.
pub struct DeploymentManager {
    plan: Plan,
}

impl DeploymentManager {
    pub fn new(
        spec: &ServiceSpec,
        config_id: Uuid,
        tasks: &[TaskInfo],
        statuses: &HashMap<String, TaskStatus>,
        overrides: &HashMap<String, GoalOverride>,
    ) -> Self {
        let mut phases = Vec::new();
        for pod in &spec.pods {
            let mut steps = Vec::new();
            for index in 0..pod.count {
                let requirement =
                    build_requirement(pod, index, Some(config_id), tasks, overrides, true);
                let converged = requirement.tasks.iter().all(|req| {
                    let info = tasks.iter().find(|t| t.name == req.name);
                    match info {
                        None => false,
                        Some(info) if !req.should_launch => !info.permanently_failed,
                        Some(info) => {
                            let at_goal = statuses.get(&req.name).is_some_and(|s| {
                                s.task_id == info.task_id
                                    && match req.goal {
                                        GoalState::Running => s.state == TaskState::Running,
                                        GoalState::Finished => s.state == TaskState::Finished,
                                    }
                            });
                            info.config_id == Some(config_id)
                                && !info.permanently_failed
                                && at_goal
                        }
                    }
                });
                let name = requirement.pod_instance.clone();
                let work = StepWork::Launch {
                    requirement,
                    pending: vec![],
                };
                steps.push(if converged {
                    Step::completed(name, work)
                } else {
                    Step::new(name, work)
                });
            }
            phases.push(Phase::new(pod.name.clone(), steps));
        }
        DeploymentManager {
            plan: Plan::new("deploy", Strategy::Serial, phases),
        }
    }
}

impl PlanManager for DeploymentManager {
    fn name(&self) -> &str {
        "deploy"
    }

    fn plan(&self) -> &Plan {
        &self.plan
    }

    fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    fn handle_status(&mut self, status: &TaskStatus, _ctx: &StatusCtx) {
        self.plan.handle_status(status);
    }
}

#[cfg(test)]
mod tests {
    use kestrel_types::{OverrideProgress, TaskId};

    use super::*;
    use crate::plan::StepStatus;
    use crate::testing::{single_task_spec, task_info};

    #[test]
    fn fresh_spec_generates_pending_steps_per_instance() {
        let spec = single_task_spec("p0", 3, 1.0);
        let mgr = DeploymentManager::new(
            &spec,
            Uuid::new_v4(),
            &[],
            &HashMap::new(),
            &HashMap::new(),
        );
        let steps: Vec<_> = mgr.plan().steps().collect();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(steps[0].name, "p0-0");
        // serial: only the head step is a candidate
        assert_eq!(mgr.plan().candidates().len(), 1);
    }

    #[test]
    fn converged_instance_starts_complete() {
        let spec = single_task_spec("p0", 2, 1.0);
        let config_id = Uuid::new_v4();
        let mut running = task_info("p0-0-server", "p0-0", "t1", vec![]);
        running.config_id = Some(config_id);
        let statuses: HashMap<String, TaskStatus> = [(
            "p0-0-server".to_string(),
            TaskStatus::new(TaskId("t1".into()), TaskState::Running),
        )]
        .into();
        let mgr = DeploymentManager::new(
            &spec,
            config_id,
            &[running],
            &statuses,
            &HashMap::new(),
        );
        let statuses: Vec<_> = mgr.plan().steps().map(|s| s.status).collect();
        assert_eq!(statuses, vec![StepStatus::Complete, StepStatus::Pending]);
    }

    #[test]
    fn stale_config_means_not_converged() {
        let spec = single_task_spec("p0", 1, 1.0);
        let mut running = task_info("p0-0-server", "p0-0", "t1", vec![]);
        running.config_id = Some(Uuid::new_v4());
        let statuses: HashMap<String, TaskStatus> = [(
            "p0-0-server".to_string(),
            TaskStatus::new(TaskId("t1".into()), TaskState::Running),
        )]
        .into();
        let mgr = DeploymentManager::new(
            &spec,
            Uuid::new_v4(),
            &[running],
            &statuses,
            &HashMap::new(),
        );
        assert!(mgr.plan().steps().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn paused_override_swaps_the_command() {
        let spec = single_task_spec("p0", 1, 1.0);
        let overrides: HashMap<String, GoalOverride> = [(
            "p0-0-server".to_string(),
            GoalOverride {
                kind: OverrideKind::Paused,
                progress: OverrideProgress::InProgress,
            },
        )]
        .into();
        let req = build_requirement(&spec.pods[0], 0, None, &[], &overrides, true);
        assert_eq!(req.tasks[0].command, PAUSE_COMMAND);
        assert!(req.tasks[0].should_launch);
    }

    #[test]
    fn stopped_override_without_reservation_requests_nothing() {
        let spec = single_task_spec("p0", 1, 1.0);
        let overrides: HashMap<String, GoalOverride> = [(
            "p0-0-server".to_string(),
            GoalOverride {
                kind: OverrideKind::Stopped,
                progress: OverrideProgress::InProgress,
            },
        )]
        .into();
        let req = build_requirement(&spec.pods[0], 0, None, &[], &overrides, true);
        assert!(req.tasks.is_empty());
    }

    #[test]
    fn replace_path_drops_existing_reservation_ids() {
        use kestrel_types::Reservation;
        let spec = single_task_spec("p0", 1, 1.0);
        let mut reserved = Resource::scalar(CPUS, 1.0, "svc-role");
        reserved.reservation = Some(Reservation {
            role: "svc-role".into(),
            principal: "svc-principal".into(),
            resource_id: Uuid::new_v4(),
        });
        let prior = task_info("p0-0-server", "p0-0", "t1", vec![reserved]);

        let reuse = build_requirement(&spec.pods[0], 0, None, std::slice::from_ref(&prior), &HashMap::new(), true);
        assert!(reuse.tasks[0].resources[0].existing_id.is_some());

        let replace = build_requirement(&spec.pods[0], 0, None, &[prior], &HashMap::new(), false);
        assert!(replace.tasks[0].resources[0].existing_id.is_none());
    }
}
