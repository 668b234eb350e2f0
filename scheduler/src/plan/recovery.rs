use kestrel_types::{GoalState, ServiceSpec, TaskState, TaskStatus, task_name};
use uuid::Uuid;

use crate::evaluator::instance_index;
use crate::plan::deploy::build_requirement;
use crate::plan::{DirtyAssets, Phase, Plan, PlanManager, StatusCtx, Step, StepWork, Strategy};

/// Watches task statuses and creates transient launch steps for tasks that
/// died. A transient failure relaunches in place on the existing
/// reservations; a permanent failure replaces the task, requesting
/// everything fresh and leaving the old reservations for cleanup.
pub struct RecoveryManager {
    spec: ServiceSpec,
    config_id: Uuid,
    plan: Plan,
}

impl RecoveryManager {
    pub fn new(spec: ServiceSpec, config_id: Uuid) -> Self {
        RecoveryManager {
            spec,
            config_id,
            plan: Plan::new("recovery", Strategy::Parallel, vec![]),
        }
    }

    fn needs_recovery(&self, status: &TaskStatus, ctx: &StatusCtx) -> bool {
        if !status.state.is_terminal() {
            return false;
        }
        let Some(task) = ctx.tasks.iter().find(|t| t.name == ctx.task_name) else {
            return false;
        };
        // A reservation-only record or a stale id is not a failure.
        if task.is_reservation_only() || task.task_id != status.task_id {
            return false;
        }
        if ctx
            .overrides
            .get(ctx.task_name)
            .is_some_and(|o| o.is_active())
        {
            return false;
        }
        let Some(index) = instance_index(&task.pod_instance) else {
            return false;
        };
        let Some(pod) = self.spec.pod(task.pod_type()) else {
            return false;
        };
        if index >= pod.count {
            // Beyond the target count: decommission territory.
            return false;
        }
        let goal = pod
            .tasks
            .iter()
            .find(|t| task_name(&pod.name, index, &t.name) == task.name)
            .map(|t| t.goal)
            .unwrap_or(GoalState::Running);
        // A once-task that finished is done, not failed.
        !(goal == GoalState::Finished && status.state == TaskState::Finished)
    }
}

impl PlanManager for RecoveryManager {
    fn name(&self) -> &str {
        "recovery"
    }

    fn plan(&self) -> &Plan {
        &self.plan
    }

    fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    fn candidate_steps(&mut self, dirty: &DirtyAssets) -> Vec<Uuid> {
        // Finished recoveries are transient; drop them before yielding.
        self.plan.phases.retain(|p| !p.is_complete());
        self.plan
            .candidates()
            .into_iter()
            .filter(|id| match self.plan.step(*id).and_then(Step::pod_instance) {
                Some(instance) => !dirty.contains(instance),
                None => true,
            })
            .collect()
    }

    fn handle_status(&mut self, status: &TaskStatus, ctx: &StatusCtx) {
        self.plan.handle_status(status);

        if !self.needs_recovery(status, ctx) {
            return;
        }
        let task = ctx
            .tasks
            .iter()
            .find(|t| t.name == ctx.task_name)
            .expect("checked by needs_recovery");
        let instance = task.pod_instance.clone();
        let already_recovering = self
            .plan
            .steps()
            .any(|s| s.pod_instance() == Some(instance.as_str()) && !s.status.is_complete());
        if already_recovering {
            return;
        }

        let index = instance_index(&instance).expect("checked by needs_recovery");
        let pod = self.spec.pod(task.pod_type()).expect("checked by needs_recovery");
        let permanent = task.permanently_failed;
        let mut requirement = build_requirement(
            pod,
            index,
            Some(self.config_id),
            ctx.tasks,
            ctx.overrides,
            !permanent,
        );
        // Recover only the task that died; its siblings keep running.
        requirement.tasks.retain(|t| t.name == ctx.task_name);
        if requirement.tasks.is_empty() {
            return;
        }
        tracing::info!(
            task = %ctx.task_name,
            %instance,
            permanent,
            "creating recovery step"
        );
        let step = Step::new(
            format!("recover-{}", ctx.task_name),
            StepWork::Launch {
                requirement,
                pending: vec![],
            },
        );
        self.plan.phases.push(Phase::new(instance, vec![step]));
    }
}
