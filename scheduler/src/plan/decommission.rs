use std::collections::{BTreeMap, HashSet};

use kestrel_types::{ServiceSpec, TaskInfo, TaskStatus};
use uuid::Uuid;

use crate::evaluator::instance_index;
use crate::plan::{Phase, Plan, PlanManager, StatusCtx, Step, StepWork, Strategy};

/// Everything that must go away with one pod instance.
#[derive(Clone, Debug)]
pub struct InstanceTeardown {
    pub instance: String,
    pub task_names: Vec<String>,
    pub resource_ids: HashSet<Uuid>,
}

/// Pod instances the stored state knows about but the target config no
/// longer wants: pods removed entirely, or indexes beyond the new count.
pub fn teardowns_for(spec: &ServiceSpec, tasks: &[TaskInfo]) -> Vec<InstanceTeardown> {
    let mut by_instance: BTreeMap<String, InstanceTeardown> = BTreeMap::new();
    for task in tasks {
        let wanted = spec.pod(task.pod_type()).is_some_and(|pod| {
            instance_index(&task.pod_instance).is_some_and(|index| index < pod.count)
        });
        if wanted {
            continue;
        }
        let entry = by_instance
            .entry(task.pod_instance.clone())
            .or_insert_with(|| InstanceTeardown {
                instance: task.pod_instance.clone(),
                task_names: vec![],
                resource_ids: HashSet::new(),
            });
        entry.task_names.push(task.name.clone());
        entry.resource_ids.extend(task.resource_ids());
    }
    by_instance.into_values().collect()
}

/// Ordered teardown per instance: kill the tasks, wait for their
/// reservations to be released, then drop the task records.
pub struct DecommissionManager {
    plan: Plan,
}

impl DecommissionManager {
    pub fn new(teardowns: Vec<InstanceTeardown>) -> Self {
        let phases = teardowns
            .into_iter()
            .map(|t| {
                let unreserve = if t.resource_ids.is_empty() {
                    Step::completed(
                        format!("unreserve-{}", t.instance),
                        StepWork::ResourceCleanup {
                            remaining: HashSet::new(),
                        },
                    )
                } else {
                    Step::new(
                        format!("unreserve-{}", t.instance),
                        StepWork::ResourceCleanup {
                            remaining: t.resource_ids,
                        },
                    )
                };
                Phase::new(
                    t.instance.clone(),
                    vec![
                        Step::new(
                            format!("kill-{}", t.instance),
                            StepWork::Kill {
                                task_names: t.task_names.clone(),
                                pending: HashSet::new(),
                            },
                        ),
                        unreserve,
                        Step::new(
                            format!("clear-{}", t.instance),
                            StepWork::ClearTask {
                                task_names: t.task_names,
                            },
                        ),
                    ],
                )
            })
            .collect();
        DecommissionManager {
            plan: Plan::new("decommission", Strategy::Parallel, phases),
        }
    }
}

impl PlanManager for DecommissionManager {
    fn name(&self) -> &str {
        "decommission"
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
