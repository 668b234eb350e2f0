use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_store::{FrameworkStore, StateStore, PersistentStore, StoreError};
use kestrel_types::{Offer, Resource, TaskStatus};
use uuid::Uuid;

use crate::args::SchedulerConfig;
use crate::driver::MasterDriver;
use crate::evaluator::{OfferEvaluator, OfferOutcomeTracker};
use crate::killer::TaskKiller;
use crate::plan::coordinator::PlanCoordinator;
use crate::plan::{Phase, Plan, PlanManager, StatusCtx, Step, StepWork, Strategy};
use crate::plan_scheduler::PlanScheduler;
use crate::recorder::LaunchRecorder;
use crate::service::{
    ClientState, OfferEventClient, OffersResponse, UnexpectedResources,
};

struct UninstallManager {
    plan: Plan,
}

impl PlanManager for UninstallManager {
    fn name(&self) -> &str {
        "uninstall"
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

/// Ordered teardown of the whole service: flag the uninstall bit, kill every
/// task, release every reservation and volume as offers come back, wipe the
/// persistent state, deregister. The flag written by the first step makes
/// bootstrap re-enter uninstall mode if the process restarts midway.
pub struct UninstallScheduler {
    framework: FrameworkStore,
    state: StateStore,
    coordinator: PlanCoordinator,
    plan_scheduler: PlanScheduler,
    recorder: LaunchRecorder,
    outcomes: OfferOutcomeTracker,
    killer: TaskKiller,
    all_resource_ids: HashSet<Uuid>,
}

impl UninstallScheduler {
    pub async fn new(
        config: SchedulerConfig,
        raw: Arc<dyn PersistentStore>,
        driver: Arc<dyn MasterDriver>,
    ) -> Result<Self, StoreError> {
        let state = StateStore::new(raw.clone());
        let tasks = state.fetch_tasks().await?;

        let task_names: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
        let mut resource_ids: HashSet<Uuid> = HashSet::new();
        let mut volume_ids: HashSet<Uuid> = HashSet::new();
        for task in &tasks {
            for resource in &task.resources {
                let Some(id) = resource.resource_id() else {
                    continue;
                };
                resource_ids.insert(id);
                if resource.volume.is_some() {
                    volume_ids.insert(id);
                }
            }
        }

        let cleanup_step = |name: &str, ids: &HashSet<Uuid>| {
            if ids.is_empty() {
                Step::completed(
                    name,
                    StepWork::ResourceCleanup {
                        remaining: HashSet::new(),
                    },
                )
            } else {
                Step::new(
                    name,
                    StepWork::ResourceCleanup {
                        remaining: ids.clone(),
                    },
                )
            }
        };
        let plan = Plan::new(
            "uninstall",
            Strategy::Serial,
            vec![
                Phase::new(
                    "uninstall-flag",
                    vec![Step::new("set-uninstall-flag", StepWork::SetUninstallFlag)],
                ),
                Phase::new(
                    "kill-tasks",
                    vec![Step::new(
                        "kill-all-tasks",
                        StepWork::Kill {
                            task_names,
                            pending: HashSet::new(),
                        },
                    )],
                ),
                Phase::new(
                    "unreserve-resources",
                    vec![cleanup_step("unreserve-all-resources", &resource_ids)],
                ),
                Phase::new(
                    "destroy-volumes",
                    vec![cleanup_step("destroy-all-volumes", &volume_ids)],
                ),
                Phase::new(
                    "delete-state",
                    vec![Step::new("delete-persistent-state", StepWork::DeleteState)],
                ),
                Phase::new(
                    "deregister",
                    vec![Step::new("deregister-framework", StepWork::Deregister)],
                ),
            ],
        );

        let evaluator = OfferEvaluator::new("", "");
        Ok(UninstallScheduler {
            framework: FrameworkStore::new(raw.clone()),
            plan_scheduler: PlanScheduler::new(evaluator, state.clone(), raw.clone()),
            recorder: LaunchRecorder::new(state.clone()),
            outcomes: OfferOutcomeTracker::new(config.offer_outcome_capacity),
            killer: TaskKiller::new(driver.clone(), config.kill_retry_base),
            coordinator: PlanCoordinator::new(vec![Box::new(UninstallManager { plan })]),
            state,
            all_resource_ids: resource_ids,
        })
    }

    pub fn plan(&self) -> &Plan {
        self.coordinator
            .plans()
            .next()
            .expect("uninstall coordinator has one plan")
    }

    /// Run the bookkeeping steps that do not need offers.
    async fn tick(&mut self) {
        self.killer.tick().await;
        let tasks = self.state.fetch_tasks().await.unwrap_or_default();
        let mut no_offers = Vec::new();
        self.plan_scheduler
            .process_steps(
                &mut self.coordinator,
                &mut no_offers,
                &tasks,
                &mut self.killer,
                &mut self.outcomes,
                &self.recorder,
            )
            .await;
    }
}

#[async_trait]
impl OfferEventClient for UninstallScheduler {
    fn state(&self) -> ClientState {
        let deregistered = self
            .plan()
            .steps()
            .any(|s| matches!(s.work, StepWork::Deregister) && s.status.is_complete());
        if deregistered {
            ClientState::Uninstalled
        } else {
            ClientState::Running
        }
    }

    async fn registered(&mut self, framework_id: &str, reregistration: bool) {
        tracing::info!(%framework_id, reregistration, "registered while uninstalling");
        if !framework_id.is_empty()
            && let Err(e) = self.framework.store_framework_id(framework_id).await
        {
            tracing::error!("failed to persist framework id: {e}");
        }
    }

    async fn handle_status(&mut self, status: &TaskStatus) {
        self.killer.confirm(status);
        // The store may already be partially gone; a failed write is fine,
        // the plan advancement below is what matters.
        match self.state.store_status(status).await {
            Ok(_) | Err(StoreError::UnknownTask(_)) => {}
            Err(e) => tracing::debug!("ignoring status persist failure during uninstall: {e}"),
        }
        let tasks = self.state.fetch_tasks().await.unwrap_or_default();
        let ctx = StatusCtx {
            task_name: "",
            tasks: &tasks,
            overrides: &Default::default(),
        };
        self.coordinator.handle_status(status, &ctx);
    }

    async fn offers(&mut self, _offers: &[Offer]) -> OffersResponse {
        self.tick().await;
        // The reserved resources themselves are released through the
        // unexpected-resources path; nothing is ever launched here.
        OffersResponse::Processed(vec![])
    }

    async fn unexpected_resources(&mut self, unused: &[Offer]) -> Vec<UnexpectedResources> {
        let mut out = Vec::new();
        for offer in unused {
            let resources: Vec<Resource> = offer
                .resources
                .iter()
                .filter(|r| {
                    r.resource_id()
                        .is_some_and(|id| self.all_resource_ids.contains(&id))
                })
                .cloned()
                .collect();
            if resources.is_empty() {
                continue;
            }
            for resource in &resources {
                if let Some(id) = resource.resource_id() {
                    self.coordinator.advance_cleanup(id);
                }
            }
            tracing::info!(
                offer = %offer.id,
                count = resources.len(),
                "releasing reserved resources for uninstall"
            );
            out.push(UnexpectedResources {
                offer_id: offer.id.clone(),
                agent_id: offer.agent_id.clone(),
                resources,
            });
        }
        out
    }

    async fn unregistered(&mut self) {
        tracing::info!("framework deregistered");
        if let Err(e) = self.framework.clear_framework_id().await {
            tracing::debug!("framework id already gone: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use kestrel_store::{MemoryStore, UNINSTALL_FLAG};
    use kestrel_types::{CPUS, Reservation, TaskId, TaskState};

    use super::*;
    use crate::plan::StepStatus;
    use crate::testing::{RecordingDriver, offer, task_info};

    async fn seeded_store() -> (Arc<dyn PersistentStore>, Uuid) {
        let raw: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let state = StateStore::new(raw.clone());
        let rid = Uuid::new_v4();
        let mut reserved = Resource::scalar(CPUS, 1.0, "svc-role");
        reserved.reservation = Some(Reservation {
            role: "svc-role".into(),
            principal: "svc-principal".into(),
            resource_id: rid,
        });
        state
            .store_task(&task_info("p0-0-server", "p0-0", "t1", vec![reserved]))
            .await
            .unwrap();
        (raw, rid)
    }

    #[tokio::test]
    async fn uninstall_runs_flag_kill_release_delete_deregister() {
        let (raw, rid) = seeded_store().await;
        let driver = Arc::new(RecordingDriver::new());
        let config = SchedulerConfig::default();
        let mut scheduler = UninstallScheduler::new(config, raw.clone(), driver.clone())
            .await
            .unwrap();

        assert_eq!(scheduler.state(), ClientState::Running);

        // the serial plan advances one step per tick: flag first, then kill
        scheduler.offers(&[]).await;
        assert!(raw.get(UNINSTALL_FLAG).await.is_ok());
        assert!(driver.kills().is_empty());
        scheduler.offers(&[]).await;
        assert_eq!(driver.kills(), vec![TaskId("t1".into())]);

        // the kill lands
        scheduler
            .handle_status(&TaskStatus::new(TaskId("t1".into()), TaskState::Killed))
            .await;

        // an offer returns the reservation; it is reported unexpected and
        // the cleanup steps advance
        scheduler.offers(&[]).await;
        let mut reserved = Resource::scalar(CPUS, 1.0, "svc-role");
        reserved.reservation = Some(Reservation {
            role: "svc-role".into(),
            principal: "svc-principal".into(),
            resource_id: rid,
        });
        let back = offer("o1", "a1", "h1", vec![reserved]);
        let unexpected = scheduler.unexpected_resources(std::slice::from_ref(&back)).await;
        assert_eq!(unexpected.len(), 1);
        assert_eq!(unexpected[0].resources[0].resource_id(), Some(rid));

        // remaining bookkeeping: delete state, deregister
        scheduler.offers(&[]).await;
        scheduler.offers(&[]).await;
        scheduler.offers(&[]).await;
        assert_eq!(scheduler.state(), ClientState::Uninstalled);
        assert!(
            scheduler
                .plan()
                .steps()
                .all(|s| s.status == StepStatus::Complete),
            "{:?}",
            scheduler
                .plan()
                .steps()
                .map(|s| (s.name.clone(), s.status))
                .collect::<Vec<_>>()
        );
        // the store was wiped by the delete-state step
        assert!(raw.get(UNINSTALL_FLAG).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn empty_service_uninstalls_without_offers() {
        let raw: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let driver = Arc::new(RecordingDriver::new());
        let mut scheduler =
            UninstallScheduler::new(SchedulerConfig::default(), raw, driver)
                .await
                .unwrap();
        for _ in 0..6 {
            scheduler.offers(&[]).await;
        }
        assert_eq!(scheduler.state(), ClientState::Uninstalled);
    }

    #[tokio::test]
    async fn unrelated_reservations_are_not_matched() {
        let (raw, _rid) = seeded_store().await;
        let driver = Arc::new(RecordingDriver::new());
        let mut scheduler =
            UninstallScheduler::new(SchedulerConfig::default(), raw, driver)
                .await
                .unwrap();
        let mut foreign = Resource::scalar(CPUS, 1.0, "other-role");
        foreign.reservation = Some(Reservation {
            role: "other-role".into(),
            principal: "other".into(),
            resource_id: Uuid::new_v4(),
        });
        let unexpected = scheduler
            .unexpected_resources(&[offer("o1", "a1", "h1", vec![foreign])])
            .await;
        assert!(unexpected.is_empty());
    }
}
