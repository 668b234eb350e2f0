//! Plans are the unit of deployment progress: ordered phases of steps, with
//! each step mapping to concrete work. Steps walk the state machine
//! PENDING -> PREPARED -> STARTING -> STARTED -> COMPLETE, dropping to ERROR
//! on non-recoverable failure and parking in WAITING when externally blocked.

pub mod coordinator;
pub mod decommission;
pub mod deploy;
pub mod recovery;

use std::collections::{HashMap, HashSet};

use kestrel_types::{GoalOverride, GoalState, TaskId, TaskInfo, TaskState, TaskStatus};
use uuid::Uuid;

use crate::evaluator::PodInstanceRequirement;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Prepared,
    Starting,
    Started,
    Complete,
    Waiting,
    Error,
}

impl StepStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, StepStatus::Complete)
    }

    /// A step currently holding its pod instance: it has produced work that
    /// is not finished yet.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StepStatus::Prepared | StepStatus::Starting | StepStatus::Started
        )
    }
}

#[derive(Clone, Debug)]
pub enum StepWork {
    /// Drive a pod instance toward its spec via the offer evaluator.
    Launch {
        requirement: PodInstanceRequirement,
        /// Task-ids launched for this step, awaiting their goal state.
        pending: Vec<TaskId>,
    },
    /// Kill the named tasks and wait for terminal statuses.
    Kill {
        task_names: Vec<String>,
        pending: HashSet<TaskId>,
    },
    /// Wait until every listed reservation has been released back.
    ResourceCleanup { remaining: HashSet<Uuid> },
    /// Remove the named tasks from the state store.
    ClearTask { task_names: Vec<String> },
    SetUninstallFlag,
    DeleteState,
    Deregister,
}

#[derive(Clone, Debug)]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    pub status: StepStatus,
    pub message: String,
    pub work: StepWork,
}

impl Step {
    pub fn new(name: impl Into<String>, work: StepWork) -> Self {
        Step {
            id: Uuid::new_v4(),
            name: name.into(),
            status: StepStatus::Pending,
            message: String::new(),
            work,
        }
    }

    /// A step born satisfied, e.g. a pod instance already at the target
    /// configuration when the plan is generated.
    pub fn completed(name: impl Into<String>, work: StepWork) -> Self {
        let mut step = Self::new(name, work);
        step.status = StepStatus::Complete;
        step
    }

    pub fn pod_instance(&self) -> Option<&str> {
        match &self.work {
            StepWork::Launch { requirement, .. } => Some(&requirement.pod_instance),
            _ => None,
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self.status, StepStatus::Pending | StepStatus::Prepared)
    }

    pub fn transition(&mut self, to: StepStatus, message: impl Into<String>) {
        if self.status != to {
            tracing::info!(step = %self.name, from = ?self.status, to = ?to, "step transition");
        }
        self.status = to;
        self.message = message.into();
    }

    /// PENDING -> PREPARED: yield the pod-instance requirement, if this step
    /// has one and is still eligible.
    pub fn start(&mut self) -> Option<PodInstanceRequirement> {
        if !self.is_eligible() {
            return None;
        }
        match &self.work {
            StepWork::Launch { requirement, .. } => {
                let requirement = requirement.clone();
                self.transition(StepStatus::Prepared, "requirement ready");
                Some(requirement)
            }
            _ => None,
        }
    }

    /// Default status-driven advancement for launch and kill steps.
    fn advance_on_status(&mut self, status: &TaskStatus) {
        enum Outcome {
            None,
            GoalReached,
            FailedBeforeGoal,
            AllKilled,
        }
        if !self.status.is_active() {
            return;
        }
        let outcome = match &mut self.work {
            StepWork::Launch {
                requirement,
                pending,
            } => {
                if !pending.contains(&status.task_id) {
                    Outcome::None
                } else {
                    let goal = requirement
                        .tasks
                        .iter()
                        .find(|t| status.task_id.0.starts_with(&format!("{}__", t.name)))
                        .map(|t| t.goal)
                        .unwrap_or(GoalState::Running);
                    let achieved = match goal {
                        GoalState::Running => status.state == TaskState::Running,
                        GoalState::Finished => status.state == TaskState::Finished,
                    };
                    if achieved {
                        pending.retain(|id| id != &status.task_id);
                        if pending.is_empty() {
                            Outcome::GoalReached
                        } else {
                            Outcome::None
                        }
                    } else if status.state.is_terminal() {
                        // Task died before reaching its goal; retry on a
                        // later offer, reusing whatever reservations
                        // survived.
                        pending.clear();
                        Outcome::FailedBeforeGoal
                    } else {
                        Outcome::None
                    }
                }
            }
            StepWork::Kill { pending, .. } => {
                if status.state.is_terminal()
                    && pending.remove(&status.task_id)
                    && pending.is_empty()
                {
                    Outcome::AllKilled
                } else {
                    Outcome::None
                }
            }
            _ => Outcome::None,
        };
        match outcome {
            Outcome::GoalReached => {
                self.transition(StepStatus::Started, "all tasks reached goal");
                self.transition(StepStatus::Complete, "");
            }
            Outcome::FailedBeforeGoal => {
                self.transition(StepStatus::Pending, "task failed before goal, retrying");
            }
            Outcome::AllKilled => self.transition(StepStatus::Complete, "all tasks terminal"),
            Outcome::None => {}
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One step at a time, phases in order.
    Serial,
    /// Phases advance independently; steps within a phase stay ordered.
    Parallel,
}

#[derive(Clone, Debug)]
pub struct Phase {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Phase {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Phase {
            name: name.into(),
            steps,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_complete())
    }

    fn next_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| !s.status.is_complete())
    }
}

#[derive(Clone, Debug)]
pub struct Plan {
    pub name: String,
    pub strategy: Strategy,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn new(name: impl Into<String>, strategy: Strategy, phases: Vec<Phase>) -> Self {
        Plan {
            name: name.into(),
            strategy,
            phases,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phases.iter().all(|p| p.is_complete())
    }

    pub fn has_errors(&self) -> bool {
        self.steps().any(|s| s.status == StepStatus::Error)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn steps_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        self.phases.iter_mut().flat_map(|p| p.steps.iter_mut())
    }

    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: Uuid) -> Option<&mut Step> {
        self.steps_mut().find(|s| s.id == id)
    }

    /// Pod instances this plan is currently touching.
    pub fn dirty_instances(&self) -> Vec<String> {
        self.steps()
            .filter(|s| s.status.is_active())
            .filter_map(|s| s.pod_instance().map(str::to_string))
            .collect()
    }

    /// Steps eligible to do work this tick, per the plan's strategy.
    pub fn candidates(&self) -> Vec<Uuid> {
        match self.strategy {
            Strategy::Serial => self
                .phases
                .iter()
                .find(|p| !p.is_complete())
                .and_then(|p| p.next_step())
                .filter(|s| s.is_eligible())
                .map(|s| vec![s.id])
                .unwrap_or_default(),
            Strategy::Parallel => self
                .phases
                .iter()
                .filter_map(|p| p.next_step())
                .filter(|s| s.is_eligible())
                .map(|s| s.id)
                .collect(),
        }
    }

    pub fn handle_status(&mut self, status: &TaskStatus) {
        for step in self.steps_mut() {
            step.advance_on_status(status);
        }
    }
}

/// Read-only view of the pod instances already claimed in the current tick,
/// across all plans. Passed to each manager so one plan never works an asset
/// another plan is touching.
#[derive(Debug, Default)]
pub struct DirtyAssets {
    set: HashSet<String>,
}

impl DirtyAssets {
    pub fn claim(&mut self, instance: &str) {
        self.set.insert(instance.to_string());
    }

    pub fn contains(&self, instance: &str) -> bool {
        self.set.contains(instance)
    }
}

/// Snapshot handed to managers alongside each status broadcast.
pub struct StatusCtx<'a> {
    pub task_name: &'a str,
    pub tasks: &'a [TaskInfo],
    pub overrides: &'a HashMap<String, GoalOverride>,
}

pub trait PlanManager: Send + Sync {
    fn name(&self) -> &str;

    fn plan(&self) -> &Plan;

    fn plan_mut(&mut self) -> &mut Plan;

    /// Steps this manager wants worked this tick, minus any whose pod
    /// instance another plan already claims.
    fn candidate_steps(&mut self, dirty: &DirtyAssets) -> Vec<Uuid> {
        let plan = self.plan();
        plan.candidates()
            .into_iter()
            .filter(|id| match plan.step(*id).and_then(Step::pod_instance) {
                Some(instance) => !dirty.contains(instance),
                None => true,
            })
            .collect()
    }

    fn handle_status(&mut self, status: &TaskStatus, ctx: &StatusCtx);
}

#[cfg(test)]
mod tests {
    use kestrel_types::{ResourceValue, CPUS};

    use super::*;
    use crate::evaluator::{ResourceRequest, TaskRequirement};

    fn launch_step(name: &str, instance: &str) -> Step {
        Step::new(
            name,
            StepWork::Launch {
                requirement: PodInstanceRequirement {
                    pod_instance: instance.to_string(),
                    placement: vec![],
                    tasks: vec![TaskRequirement {
                        name: format!("{instance}-server"),
                        command: "./server".into(),
                        goal: GoalState::Running,
                        should_launch: true,
                        resources: vec![ResourceRequest {
                            name: CPUS.into(),
                            value: ResourceValue::Scalar(1.0),
                            existing_id: None,
                            volume: None,
                        }],
                    }],
                    config_id: None,
                },
                pending: vec![],
            },
        )
    }

    #[test]
    fn start_moves_pending_to_prepared() {
        let mut step = launch_step("deploy-p0-0", "p0-0");
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.start().is_some());
        assert_eq!(step.status, StepStatus::Prepared);
        // a prepared step can re-yield its requirement
        assert!(step.start().is_some());
    }

    #[test]
    fn running_status_completes_launch_step() {
        let mut step = launch_step("deploy-p0-0", "p0-0");
        step.start();
        let id = TaskId::generate("p0-0-server");
        if let StepWork::Launch { pending, .. } = &mut step.work {
            pending.push(id.clone());
        }
        step.transition(StepStatus::Starting, "");
        step.advance_on_status(&TaskStatus::new(id.clone(), TaskState::Staging));
        assert_eq!(step.status, StepStatus::Starting);
        step.advance_on_status(&TaskStatus::new(id, TaskState::Running));
        assert_eq!(step.status, StepStatus::Complete);
    }

    #[test]
    fn failure_before_goal_reverts_to_pending() {
        let mut step = launch_step("deploy-p0-0", "p0-0");
        step.start();
        let id = TaskId::generate("p0-0-server");
        if let StepWork::Launch { pending, .. } = &mut step.work {
            pending.push(id.clone());
        }
        step.transition(StepStatus::Starting, "");
        step.advance_on_status(&TaskStatus::new(id, TaskState::Failed));
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn serial_plan_yields_one_candidate() {
        let plan = Plan::new(
            "deploy",
            Strategy::Serial,
            vec![
                Phase::new("p0", vec![launch_step("p0-0", "p0-0"), launch_step("p0-1", "p0-1")]),
                Phase::new("p1", vec![launch_step("p1-0", "p1-0")]),
            ],
        );
        let candidates = plan.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(plan.step(candidates[0]).unwrap().name, "p0-0");
    }

    #[test]
    fn parallel_plan_yields_head_of_each_phase() {
        let plan = Plan::new(
            "recovery",
            Strategy::Parallel,
            vec![
                Phase::new("p0-0", vec![launch_step("a", "p0-0")]),
                Phase::new("p0-1", vec![launch_step("b", "p0-1")]),
            ],
        );
        assert_eq!(plan.candidates().len(), 2);
    }

    #[test]
    fn dirty_assets_filter_candidates() {
        struct Mgr(Plan);
        impl PlanManager for Mgr {
            fn name(&self) -> &str {
                "test"
            }
            fn plan(&self) -> &Plan {
                &self.0
            }
            fn plan_mut(&mut self) -> &mut Plan {
                &mut self.0
            }
            fn handle_status(&mut self, _: &TaskStatus, _: &StatusCtx) {}
        }
        let mut mgr = Mgr(Plan::new(
            "recovery",
            Strategy::Parallel,
            vec![
                Phase::new("p0-0", vec![launch_step("a", "p0-0")]),
                Phase::new("p0-1", vec![launch_step("b", "p0-1")]),
            ],
        ));
        let mut dirty = DirtyAssets::default();
        dirty.claim("p0-0");
        let candidates = mgr.candidate_steps(&dirty);
        assert_eq!(candidates.len(), 1);
        assert_eq!(mgr.plan().step(candidates[0]).unwrap().name, "b");
    }
}
