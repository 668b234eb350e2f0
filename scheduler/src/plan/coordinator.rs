use std::collections::HashSet;

use kestrel_types::TaskStatus;
use uuid::Uuid;

use crate::plan::{DirtyAssets, Plan, PlanManager, StatusCtx, Step, StepWork};

/// Owns the set of active plans. Each tick it asks every manager for its
/// candidate steps; a pod instance being touched by one plan is excluded
/// from all the others via the dirty-asset view.
pub struct PlanCoordinator {
    managers: Vec<Box<dyn PlanManager>>,
}

impl PlanCoordinator {
    pub fn new(managers: Vec<Box<dyn PlanManager>>) -> Self {
        PlanCoordinator { managers }
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.managers.iter().map(|m| m.plan())
    }

    pub fn is_complete(&self) -> bool {
        self.plans().all(|p| p.is_complete())
    }

    /// The eligible steps for this tick as (manager index, step id) pairs.
    /// Each manager sees the instances every *other* plan has in flight as
    /// dirty (its own in-flight steps stay workable), and every yielded
    /// candidate claims its instance against the managers asked later.
    pub fn candidates(&mut self) -> Vec<(usize, Uuid)> {
        let per_manager: Vec<Vec<String>> = self
            .managers
            .iter()
            .map(|m| m.plan().dirty_instances())
            .collect();
        let mut tick_claims: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for i in 0..self.managers.len() {
            let mut dirty = DirtyAssets::default();
            for (j, instances) in per_manager.iter().enumerate() {
                if j == i {
                    continue;
                }
                for instance in instances {
                    dirty.claim(instance);
                }
            }
            for instance in &tick_claims {
                dirty.claim(instance);
            }
            for id in self.managers[i].candidate_steps(&dirty) {
                if let Some(instance) = self.managers[i]
                    .plan()
                    .step(id)
                    .and_then(Step::pod_instance)
                {
                    tick_claims.insert(instance.to_string());
                }
                out.push((i, id));
            }
        }
        out
    }

    pub fn step_mut(&mut self, manager: usize, id: Uuid) -> Option<&mut Step> {
        self.managers.get_mut(manager)?.plan_mut().step_mut(id)
    }

    pub fn handle_status(&mut self, status: &TaskStatus, ctx: &StatusCtx) {
        for manager in &mut self.managers {
            manager.handle_status(status, ctx);
        }
    }

    /// A reservation was released back to the master; advance whichever
    /// resource-cleanup step was waiting on it. Returns whether any was.
    pub fn advance_cleanup(&mut self, resource_id: Uuid) -> bool {
        let mut matched = false;
        for manager in &mut self.managers {
            for step in manager.plan_mut().steps_mut() {
                if step.status.is_complete() {
                    continue;
                }
                let released = match &mut step.work {
                    StepWork::ResourceCleanup { remaining } => {
                        if remaining.remove(&resource_id) {
                            matched = true;
                            remaining.is_empty()
                        } else {
                            false
                        }
                    }
                    _ => false,
                };
                if released {
                    step.transition(super::StepStatus::Complete, "all resources released");
                }
            }
        }
        matched
    }

    /// Every task name any plan still references: launchable tasks plus
    /// tasks being killed or decommissioned. Anything persisted outside
    /// this set is cruft from an older configuration.
    pub fn known_task_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for plan in self.plans() {
            for step in plan.steps() {
                match &step.work {
                    StepWork::Launch { requirement, .. } => {
                        names.extend(requirement.tasks.iter().map(|t| t.name.clone()));
                    }
                    StepWork::Kill { task_names, .. } | StepWork::ClearTask { task_names } => {
                        names.extend(task_names.iter().cloned());
                    }
                    _ => {}
                }
            }
        }
        names
    }
}
