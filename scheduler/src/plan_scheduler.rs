use std::sync::Arc;

use kestrel_store::{PersistentStore, StateStore, UNINSTALL_FLAG};
use kestrel_types::{Offer, OfferRecommendation, TaskId, TaskInfo};
use metrics::counter;

use crate::evaluator::{OfferEvaluator, OfferOutcomeTracker};
use crate::killer::TaskKiller;
use crate::plan::coordinator::PlanCoordinator;
use crate::plan::{StepStatus, StepWork};
use crate::recorder::LaunchRecorder;

/// Drives one tick's eligible steps against the current offer batch. Launch
/// steps run through the evaluator; everything the evaluator recommends is
/// recorded to the state store before it may be sent to the master. A
/// recording failure abandons the step's recommendations for this tick;
/// nothing half-recorded ever reaches the driver.
pub struct PlanScheduler {
    evaluator: OfferEvaluator,
    state: StateStore,
    raw: Arc<dyn PersistentStore>,
}

impl PlanScheduler {
    pub fn new(evaluator: OfferEvaluator, state: StateStore, raw: Arc<dyn PersistentStore>) -> Self {
        PlanScheduler {
            evaluator,
            state,
            raw,
        }
    }

    pub async fn process_steps(
        &self,
        coordinator: &mut PlanCoordinator,
        offers: &mut Vec<Offer>,
        deployed: &[TaskInfo],
        killer: &mut TaskKiller,
        outcomes: &mut OfferOutcomeTracker,
        recorder: &LaunchRecorder,
    ) -> Vec<OfferRecommendation> {
        let mut accepted = Vec::new();
        for (mgr, id) in coordinator.candidates() {
            let Some(step) = coordinator.step_mut(mgr, id) else {
                continue;
            };
            match &step.work {
                StepWork::Launch { .. } => {
                    let Some(requirement) = step.start() else {
                        continue;
                    };
                    let recs = self
                        .evaluator
                        .evaluate(&requirement, offers, deployed, outcomes);
                    if recs.is_empty() {
                        continue;
                    }
                    let keep: Vec<OfferRecommendation> = recs
                        .into_iter()
                        .filter(|r| {
                            !matches!(
                                r,
                                OfferRecommendation::Launch {
                                    should_launch: false,
                                    ..
                                }
                            )
                        })
                        .collect();
                    if keep.is_empty() {
                        // Held reservations already satisfy the requirement
                        // and nothing wants to run.
                        step.transition(StepStatus::Complete, "requirement already satisfied");
                        continue;
                    }
                    if let Err(e) = recorder.record(&keep).await {
                        tracing::error!(step = %step.name, "failed to record operations: {e}");
                        counter!("record_failures_total").increment(1);
                        continue;
                    }
                    let consumed = keep[0].offer_id().clone();
                    offers.retain(|o| o.id != consumed);
                    let launched: Vec<TaskId> = keep
                        .iter()
                        .filter_map(|r| match r {
                            OfferRecommendation::Launch {
                                task,
                                should_launch: true,
                                ..
                            } => Some(task.task_id.clone()),
                            _ => None,
                        })
                        .collect();
                    if let StepWork::Launch { pending, .. } = &mut step.work {
                        *pending = launched;
                    }
                    step.transition(StepStatus::Starting, "operations recorded");
                    accepted.extend(keep);
                }
                StepWork::Kill { task_names, .. } => {
                    let mut ids: Vec<TaskId> = Vec::new();
                    for task in deployed
                        .iter()
                        .filter(|t| task_names.contains(&t.name) && !t.task_id.is_empty())
                    {
                        // A task whose last status is already terminal needs
                        // no kill and will send no further statuses.
                        let already_dead = match self.state.fetch_status(&task.name).await {
                            Ok(Some(s)) => s.task_id == task.task_id && s.state.is_terminal(),
                            Ok(None) => false,
                            Err(e) => {
                                tracing::error!(task = %task.name, "failed to read status: {e}");
                                false
                            }
                        };
                        if !already_dead {
                            ids.push(task.task_id.clone());
                        }
                    }
                    if ids.is_empty() {
                        step.transition(StepStatus::Complete, "no live tasks to kill");
                        continue;
                    }
                    if let StepWork::Kill { pending, .. } = &mut step.work {
                        pending.extend(ids.iter().cloned());
                    }
                    step.transition(StepStatus::Starting, "kills issued");
                    for id in ids {
                        killer.kill(id).await;
                    }
                }
                StepWork::ResourceCleanup { remaining } => {
                    if remaining.is_empty() {
                        step.transition(StepStatus::Complete, "nothing reserved");
                    } else {
                        // Externally blocked: only the master re-offering
                        // the reserved resources can move this forward.
                        step.transition(StepStatus::Waiting, "awaiting offers to unreserve");
                    }
                }
                StepWork::ClearTask { task_names } => {
                    let names = task_names.clone();
                    let mut failed = false;
                    for name in &names {
                        if let Err(e) = self.state.clear_task(name).await {
                            tracing::error!(task = %name, "failed to clear task: {e}");
                            failed = true;
                            break;
                        }
                    }
                    if !failed {
                        step.transition(StepStatus::Complete, "task records removed");
                    }
                }
                StepWork::SetUninstallFlag => {
                    match self.raw.set(UNINSTALL_FLAG, Vec::new()).await {
                        Ok(()) => step.transition(StepStatus::Complete, "uninstall flag set"),
                        Err(e) => tracing::error!("failed to set uninstall flag: {e}"),
                    }
                }
                StepWork::DeleteState => match self.raw.recursive_delete("/").await {
                    Ok(()) => step.transition(StepStatus::Complete, "persistent state deleted"),
                    Err(e) => tracing::error!("failed to delete persistent state: {e}"),
                },
                StepWork::Deregister => {
                    step.transition(StepStatus::Complete, "deregistration requested");
                }
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use kestrel_store::MemoryStore;
    use kestrel_types::{CPUS, Resource, TaskState, TaskStatus, UNRESERVED_ROLE};
    use uuid::Uuid;

    use super::*;
    use crate::plan::decommission::{DecommissionManager, InstanceTeardown};
    use crate::plan::deploy::DeploymentManager;
    use crate::testing::{RecordingDriver, offer, single_task_spec, task_info};

    fn fixture() -> (PlanScheduler, StateStore, Arc<RecordingDriver>) {
        let raw: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let state = StateStore::new(raw.clone());
        let scheduler = PlanScheduler::new(
            OfferEvaluator::new("svc-role", "svc-principal"),
            state.clone(),
            raw,
        );
        (scheduler, state, Arc::new(RecordingDriver::new()))
    }

    #[tokio::test]
    async fn launch_step_records_before_reporting() {
        let (scheduler, state, driver) = fixture();
        let spec = single_task_spec("p0", 1, 1.0);
        let deploy = DeploymentManager::new(
            &spec,
            Uuid::new_v4(),
            &[],
            &HashMap::new(),
            &HashMap::new(),
        );
        let mut coordinator = PlanCoordinator::new(vec![Box::new(deploy)]);
        let mut offers = vec![offer(
            "o1",
            "a1",
            "h1",
            vec![Resource::scalar(CPUS, 3.0, UNRESERVED_ROLE)],
        )];
        let mut killer = TaskKiller::new(driver, Duration::from_secs(5));
        let mut outcomes = OfferOutcomeTracker::new(16);
        let recorder = LaunchRecorder::new(state.clone());

        let recs = scheduler
            .process_steps(
                &mut coordinator,
                &mut offers,
                &[],
                &mut killer,
                &mut outcomes,
                &recorder,
            )
            .await;

        assert_eq!(recs.len(), 2, "reserve + launch");
        assert!(offers.is_empty(), "consumed offer leaves the batch");
        // persist-before-publish: the task is in the store as the recs return
        let task = state.fetch_task("p0-0-server").await.unwrap().unwrap();
        assert!(!task.task_id.is_empty());
        let step = coordinator.plans().next().unwrap().steps().next().unwrap();
        assert_eq!(step.status, StepStatus::Starting);
        if let StepWork::Launch { pending, .. } = &step.work {
            assert_eq!(pending, &vec![task.task_id]);
        } else {
            panic!("launch work expected");
        }
    }

    #[tokio::test]
    async fn no_fitting_offer_leaves_step_prepared() {
        let (scheduler, state, driver) = fixture();
        let spec = single_task_spec("p0", 1, 4.0);
        let deploy = DeploymentManager::new(
            &spec,
            Uuid::new_v4(),
            &[],
            &HashMap::new(),
            &HashMap::new(),
        );
        let mut coordinator = PlanCoordinator::new(vec![Box::new(deploy)]);
        let mut offers = vec![offer(
            "o1",
            "a1",
            "h1",
            vec![Resource::scalar(CPUS, 1.0, UNRESERVED_ROLE)],
        )];
        let mut killer = TaskKiller::new(driver, Duration::from_secs(5));
        let mut outcomes = OfferOutcomeTracker::new(16);
        let recorder = LaunchRecorder::new(state.clone());

        let recs = scheduler
            .process_steps(
                &mut coordinator,
                &mut offers,
                &[],
                &mut killer,
                &mut outcomes,
                &recorder,
            )
            .await;
        assert!(recs.is_empty());
        assert_eq!(offers.len(), 1, "unconsumed offer stays for declining");
        assert!(state.fetch_task("p0-0-server").await.unwrap().is_none());
        let step = coordinator.plans().next().unwrap().steps().next().unwrap();
        assert_eq!(step.status, StepStatus::Prepared);
    }

    #[tokio::test]
    async fn kill_steps_feed_the_killer_and_wait() {
        let (scheduler, _state, driver) = fixture();
        let decommission = DecommissionManager::new(vec![InstanceTeardown {
            instance: "p0-1".into(),
            task_names: vec!["p0-1-server".into()],
            resource_ids: [Uuid::new_v4()].into_iter().collect(),
        }]);
        let mut coordinator = PlanCoordinator::new(vec![Box::new(decommission)]);
        let deployed = vec![task_info("p0-1-server", "p0-1", "t1", vec![])];
        let mut killer = TaskKiller::new(driver.clone(), Duration::from_secs(5));
        let mut outcomes = OfferOutcomeTracker::new(16);
        let recorder = LaunchRecorder::new(_state.clone());
        let mut offers = Vec::new();

        let recs = scheduler
            .process_steps(
                &mut coordinator,
                &mut offers,
                &deployed,
                &mut killer,
                &mut outcomes,
                &recorder,
            )
            .await;
        assert!(recs.is_empty());
        assert_eq!(driver.kills(), vec![kestrel_types::TaskId("t1".into())]);

        // terminal status completes the kill step and unblocks the phase
        let mut ctx_tasks = deployed.clone();
        ctx_tasks[0].task_id = kestrel_types::TaskId("t1".into());
        coordinator.handle_status(
            &TaskStatus::new(kestrel_types::TaskId("t1".into()), TaskState::Killed),
            &crate::plan::StatusCtx {
                task_name: "p0-1-server",
                tasks: &ctx_tasks,
                overrides: &HashMap::new(),
            },
        );
        let statuses: Vec<_> = coordinator
            .plans()
            .flat_map(|p| p.steps())
            .map(|s| (s.name.clone(), s.status))
            .collect();
        assert_eq!(statuses[0].1, StepStatus::Complete, "{statuses:?}");
    }
}
