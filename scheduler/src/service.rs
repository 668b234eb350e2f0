use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kestrel_store::{ConfigStore, FrameworkStore, PersistentStore, StateStore, StoreError};
use kestrel_types::{
    AgentId, GoalOverride, Offer, OfferId, OfferRecommendation, OverrideKind, OverrideProgress,
    Resource, ServiceSpec, TaskId, TaskInfo, TaskState, TaskStatus,
};
use metrics::counter;
use uuid::Uuid;

use crate::args::SchedulerConfig;
use crate::bootstrap::{FatalHandler, FatalKind};
use crate::driver::MasterDriver;
use crate::evaluator::{OfferEvaluator, OfferOutcome, OfferOutcomeTracker};
use crate::killer::TaskKiller;
use crate::plan::coordinator::PlanCoordinator;
use crate::plan::{Plan, StatusCtx};
use crate::plan_scheduler::PlanScheduler;
use crate::processor::OfferProcessor;
use crate::reconciler::ImplicitReconciler;
use crate::recorder::LaunchRecorder;
use crate::uninstall::UninstallScheduler;

/// Lifecycle as reported to the offer processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Running,
    Finished,
    Uninstalled,
}

/// The client's answer to one offer batch. `NotReady` asks the processor to
/// decline the remainder with the short interval so the offers come back.
#[derive(Debug)]
pub enum OffersResponse {
    Processed(Vec<OfferRecommendation>),
    NotReady(Vec<OfferRecommendation>),
}

/// Reserved resources found in an offer that no live task accounts for.
#[derive(Clone, Debug)]
pub struct UnexpectedResources {
    pub offer_id: OfferId,
    pub agent_id: AgentId,
    pub resources: Vec<Resource>,
}

/// The scheduler as seen from the offer processor's worker. Implemented by
/// the deploy and uninstall variants, which share the same machinery.
#[async_trait]
pub trait OfferEventClient: Send {
    fn state(&self) -> ClientState;

    async fn registered(&mut self, framework_id: &str, reregistration: bool);

    async fn handle_status(&mut self, status: &TaskStatus);

    async fn offers(&mut self, offers: &[Offer]) -> OffersResponse;

    async fn unexpected_resources(&mut self, unused: &[Offer]) -> Vec<UnexpectedResources>;

    async fn unregistered(&mut self);
}

pub type SharedClient = Arc<tokio::sync::Mutex<dyn OfferEventClient>>;

/// Cross-thread flags shared between the driver callback side and the
/// worker. These are the only atomics in the scheduler.
#[derive(Default)]
pub struct SchedulerFlags {
    pub api_server_started: AtomicBool,
    pub register_called: AtomicBool,
}

// ---------------------------------------------------------------------------
// Deploy mode
// ---------------------------------------------------------------------------

/// Normal operation: drive the cluster toward the target config, recover
/// failures, decommission surplus instances.
pub struct DeployScheduler {
    spec: ServiceSpec,
    target_config: Uuid,
    config: SchedulerConfig,
    raw: Arc<dyn PersistentStore>,
    driver: Arc<dyn MasterDriver>,
    framework: FrameworkStore,
    state: StateStore,
    configs: ConfigStore,
    coordinator: PlanCoordinator,
    plan_scheduler: PlanScheduler,
    recorder: LaunchRecorder,
    outcomes: OfferOutcomeTracker,
    killer: TaskKiller,
    reconciler: ImplicitReconciler,
    registered: bool,
    suppressed: bool,
}

impl DeployScheduler {
    pub fn new(
        spec: ServiceSpec,
        target_config: Uuid,
        config: SchedulerConfig,
        raw: Arc<dyn PersistentStore>,
        driver: Arc<dyn MasterDriver>,
        coordinator: PlanCoordinator,
    ) -> Self {
        let state = StateStore::new(raw.clone());
        let evaluator = OfferEvaluator::new(&spec.role, &spec.principal);
        DeployScheduler {
            framework: FrameworkStore::new(raw.clone()),
            configs: ConfigStore::new(raw.clone()),
            plan_scheduler: PlanScheduler::new(evaluator, state.clone(), raw.clone()),
            recorder: LaunchRecorder::new(state.clone()),
            outcomes: OfferOutcomeTracker::new(config.offer_outcome_capacity),
            killer: TaskKiller::new(driver.clone(), config.kill_retry_base),
            reconciler: ImplicitReconciler::new(config.reconcile_base, config.reconcile_cap),
            state,
            spec,
            target_config,
            config,
            raw,
            driver,
            coordinator,
            registered: false,
            suppressed: false,
        }
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.coordinator.plans()
    }

    pub fn target_config(&self) -> Uuid {
        self.target_config
    }

    pub fn offer_outcomes(&self) -> impl Iterator<Item = &OfferOutcome> {
        self.outcomes.outcomes()
    }

    /// In-process handoff to uninstall mode, sharing the stores. The
    /// uninstall bit is written by the new scheduler's first plan step, so a
    /// restart from here re-enters uninstall mode.
    pub async fn into_uninstall(self) -> Result<UninstallScheduler, StoreError> {
        UninstallScheduler::new(self.config, self.raw, self.driver).await
    }

    async fn overrides_snapshot(
        &self,
        tasks: &[TaskInfo],
    ) -> Result<HashMap<String, GoalOverride>, StoreError> {
        let mut overrides = HashMap::new();
        for task in tasks {
            overrides.insert(
                task.name.clone(),
                self.state.fetch_goal_override(&task.name).await?,
            );
        }
        Ok(overrides)
    }

    async fn broadcast_status(&mut self, task_name: &str, status: &TaskStatus) {
        let tasks = match self.state.fetch_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("failed to snapshot tasks for status broadcast: {e}");
                return;
            }
        };
        let overrides = match self.overrides_snapshot(&tasks).await {
            Ok(overrides) => overrides,
            Err(e) => {
                tracing::error!("failed to snapshot overrides for status broadcast: {e}");
                return;
            }
        };
        let ctx = StatusCtx {
            task_name,
            tasks: &tasks,
            overrides: &overrides,
        };
        self.coordinator.handle_status(status, &ctx);
    }

    async fn apply_override_progress(&mut self, task_name: &str, status: &TaskStatus) {
        let goal_override = match self.state.fetch_goal_override(task_name).await {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(task = %task_name, "failed to read goal override: {e}");
                return;
            }
        };
        if goal_override.progress != OverrideProgress::InProgress {
            return;
        }
        let complete = match goal_override.kind {
            OverrideKind::Paused => status.state == TaskState::Running,
            OverrideKind::Stopped | OverrideKind::Decommissioning => status.state.is_terminal(),
            OverrideKind::None => false,
        };
        if !complete {
            return;
        }
        if goal_override.kind == OverrideKind::Stopped {
            // The task stays down but its resources stay claimed: null the
            // task-id so the record becomes reservation-only and future
            // statuses for the dead id are dropped.
            match self.state.fetch_task(task_name).await {
                Ok(Some(mut task)) if task.task_id == status.task_id => {
                    task.task_id = TaskId::reservation();
                    if let Err(e) = self.state.store_task(&task).await {
                        tracing::error!(task = %task_name, "failed to null task-id: {e}");
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(task = %task_name, "failed to load task: {e}");
                    return;
                }
            }
        }
        if let Err(e) = self
            .state
            .store_goal_override(
                task_name,
                GoalOverride {
                    kind: goal_override.kind,
                    progress: OverrideProgress::Complete,
                },
            )
            .await
        {
            tracing::error!(task = %task_name, "failed to complete goal override: {e}");
        }
    }

    async fn mark_permanently_failed(&mut self, task_name: &str, status: &TaskStatus) {
        if !status.state.is_terminal()
            || !status
                .reason
                .as_ref()
                .is_some_and(|r| r.is_permanent_failure())
        {
            return;
        }
        match self.state.fetch_task(task_name).await {
            Ok(Some(mut task)) if task.task_id == status.task_id && !task.permanently_failed => {
                tracing::warn!(task = %task_name, reason = ?status.reason, "task permanently failed");
                task.permanently_failed = true;
                if let Err(e) = self.state.store_task(&task).await {
                    tracing::error!(task = %task_name, "failed to mark permanent failure: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(task = %task_name, "failed to load task: {e}"),
        }
    }
}

#[async_trait]
impl OfferEventClient for DeployScheduler {
    fn state(&self) -> ClientState {
        ClientState::Running
    }

    async fn registered(&mut self, framework_id: &str, reregistration: bool) {
        if reregistration || self.registered {
            // Master election: the cleanup below ran on first registration
            // and must not run again.
            tracing::info!("re-registered with master");
            self.registered = true;
            return;
        }
        self.registered = true;
        tracing::info!(%framework_id, "registered with master");
        if let Err(e) = self.framework.store_framework_id(framework_id).await {
            tracing::error!("failed to persist framework id: {e}");
        }

        let tasks = match self.state.fetch_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("failed to load tasks at registration: {e}");
                return;
            }
        };

        // Tasks no plan references are cruft from an older configuration:
        // null the id first (drops any late statuses), then kill the real
        // task at the master.
        let known = self.coordinator.known_task_names();
        let mut survivors = Vec::new();
        for task in tasks {
            if known.contains(&task.name) {
                survivors.push(task);
                continue;
            }
            let stale_id = task.task_id.clone();
            tracing::warn!(task = %task.name, "dropping task absent from all plans");
            if !stale_id.is_empty() {
                let mut cleared = task.clone();
                cleared.task_id = TaskId::reservation();
                if let Err(e) = self.state.store_task(&cleared).await {
                    tracing::error!(task = %task.name, "failed to null stale task: {e}");
                    survivors.push(task);
                    continue;
                }
                self.killer.kill(stale_id).await;
            }
        }

        // Overrides waiting to take effect need their task gone first.
        for task in &survivors {
            match self.state.fetch_goal_override(&task.name).await {
                Ok(o) if o.is_active() && o.progress == OverrideProgress::Pending => {
                    if !task.task_id.is_empty() {
                        self.killer.kill(task.task_id.clone()).await;
                    }
                    if let Err(e) = self
                        .state
                        .store_goal_override(
                            &task.name,
                            GoalOverride {
                                kind: o.kind,
                                progress: OverrideProgress::InProgress,
                            },
                        )
                        .await
                    {
                        tracing::error!(task = %task.name, "failed to advance override: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(task = %task.name, "failed to read override: {e}"),
            }
        }

        // Ask the master to confirm everything we think is running.
        let mut statuses = Vec::new();
        for task in &survivors {
            if task.task_id.is_empty() {
                continue;
            }
            match self.state.fetch_status(&task.name).await {
                Ok(Some(status)) if status.task_id == task.task_id => statuses.push(status),
                Ok(_) => statuses.push(TaskStatus::new(task.task_id.clone(), TaskState::Staging)),
                Err(e) => tracing::error!(task = %task.name, "failed to read status: {e}"),
            }
        }
        self.reconciler.start(statuses);
    }

    async fn handle_status(&mut self, status: &TaskStatus) {
        counter!("status_updates_total").increment(1);
        // Kill and reconciliation bookkeeping applies even when the store
        // no longer knows the id.
        self.killer.confirm(status);
        self.reconciler.confirm(&status.task_id);

        let task_name = match self.state.store_status(status).await {
            Ok(name) => name,
            Err(e @ StoreError::UnknownTask(_)) => {
                tracing::warn!(task_id = %status.task_id, "dropping status: {e}");
                return;
            }
            Err(e @ StoreError::InvalidTransition { .. }) => {
                tracing::warn!(task_id = %status.task_id, "dropping status: {e}");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %status.task_id, "failed to persist status: {e}");
                return;
            }
        };
        tracing::debug!(task = %task_name, state = ?status.state, "status update");

        self.mark_permanently_failed(&task_name, status).await;
        self.apply_override_progress(&task_name, status).await;
        self.broadcast_status(&task_name, status).await;

        // A failure is new work; make sure offers flow again.
        if self.suppressed && !self.coordinator.is_complete() {
            self.driver.revive_offers().await;
            self.suppressed = false;
        }
    }

    async fn offers(&mut self, offers: &[Offer]) -> OffersResponse {
        self.killer.tick().await;
        self.reconciler.tick(self.driver.as_ref()).await;
        if self.reconciler.pending() {
            tracing::info!("task reconciliation in progress; deferring offers");
            return OffersResponse::NotReady(vec![]);
        }

        let tasks = match self.state.fetch_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("failed to snapshot tasks: {e}");
                return OffersResponse::NotReady(vec![]);
            }
        };

        let mut batch = offers.to_vec();
        let recs = self
            .plan_scheduler
            .process_steps(
                &mut self.coordinator,
                &mut batch,
                &tasks,
                &mut self.killer,
                &mut self.outcomes,
                &self.recorder,
            )
            .await;

        if !self.suppressed
            && self.coordinator.is_complete()
            && self.killer.idle()
            && !self.reconciler.pending()
        {
            // Converged: superseded configs can go, and the master can stop
            // offering until something changes.
            let in_use: HashSet<Uuid> = tasks.iter().filter_map(|t| t.config_id).collect();
            if let Err(e) = self.configs.prune(&in_use).await {
                tracing::warn!("failed to prune configurations: {e}");
            }
            tracing::info!("all plans complete; suppressing offers");
            self.driver.suppress_offers().await;
            self.suppressed = true;
        }

        OffersResponse::Processed(recs)
    }

    async fn unexpected_resources(&mut self, unused: &[Offer]) -> Vec<UnexpectedResources> {
        let tasks = match self.state.fetch_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("failed to snapshot tasks: {e}");
                return vec![];
            }
        };
        // Resource-ids referenced by a live task are accounted for; a
        // permanently-failed or decommissioning task no longer defends its
        // reservations.
        let mut protected: HashSet<Uuid> = HashSet::new();
        for task in &tasks {
            if task.permanently_failed {
                continue;
            }
            let decommissioning = self
                .state
                .fetch_goal_override(&task.name)
                .await
                .map(|o| o.kind == OverrideKind::Decommissioning)
                .unwrap_or(false);
            if decommissioning {
                continue;
            }
            protected.extend(task.resource_ids());
        }

        let mut out = Vec::new();
        for offer in unused {
            let resources: Vec<Resource> = offer
                .resources
                .iter()
                .filter(|r| {
                    r.role == self.spec.role
                        && r.resource_id().is_some_and(|id| !protected.contains(&id))
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
            counter!("unexpected_resources_total").increment(resources.len() as u64);
            out.push(UnexpectedResources {
                offer_id: offer.id.clone(),
                agent_id: offer.agent_id.clone(),
                resources,
            });
        }
        out
    }

    async fn unregistered(&mut self) {
        tracing::info!("deploy scheduler unregistered");
    }
}

// ---------------------------------------------------------------------------
// Driver callback adapter
// ---------------------------------------------------------------------------

/// The adapter the master driver invokes on its own thread. It must return
/// quickly: offers are gated and enqueued, statuses take the client mutex
/// for the duration of one store write.
pub struct FrameworkScheduler {
    processor: OfferProcessor,
    client: SharedClient,
    driver: Arc<dyn MasterDriver>,
    flags: Arc<SchedulerFlags>,
    roles: Vec<String>,
    config: SchedulerConfig,
    on_fatal: FatalHandler,
}

impl FrameworkScheduler {
    pub fn new(
        processor: OfferProcessor,
        client: SharedClient,
        driver: Arc<dyn MasterDriver>,
        flags: Arc<SchedulerFlags>,
        role: &str,
        config: SchedulerConfig,
        on_fatal: FatalHandler,
    ) -> Self {
        FrameworkScheduler {
            processor,
            client,
            driver,
            flags,
            roles: vec![role.to_string(), kestrel_types::UNRESERVED_ROLE.to_string()],
            config,
            on_fatal,
        }
    }

    /// Offers are short-declined until the operator surface is up.
    pub fn mark_api_started(&self) {
        self.flags.api_server_started.store(true, Ordering::SeqCst);
    }

    pub async fn registered(&self, framework_id: &str) {
        let first = !self.flags.register_called.swap(true, Ordering::SeqCst);
        self.client
            .lock()
            .await
            .registered(framework_id, !first)
            .await;
    }

    pub async fn reregistered(&self) {
        self.client.lock().await.registered("", true).await;
    }

    pub async fn resource_offers(&self, offers: Vec<Offer>) {
        counter!("offers_received_total").increment(offers.len() as u64);
        if !self.flags.api_server_started.load(Ordering::SeqCst) {
            tracing::info!(count = offers.len(), "api server not started; declining offers");
            for offer in &offers {
                self.driver
                    .decline_offer(&offer.id, self.config.short_refuse)
                    .await;
            }
            return;
        }
        let (matched, unmatched): (Vec<Offer>, Vec<Offer>) = offers
            .into_iter()
            .partition(|o| o.has_role(&self.roles));
        for offer in &unmatched {
            tracing::debug!(offer = %offer.id, "declining offer with no matching role");
            counter!("offers_declined_total", "reason" => "role").increment(1);
            self.driver
                .decline_offer(&offer.id, self.config.long_refuse)
                .await;
        }
        if !matched.is_empty() {
            self.processor.enqueue(matched).await;
        }
    }

    pub fn offer_rescinded(&self, offer_id: &OfferId) {
        tracing::info!(offer = %offer_id, "offer rescinded");
        self.processor.rescind(offer_id);
    }

    pub async fn status_update(&self, status: TaskStatus) {
        self.client.lock().await.handle_status(&status).await;
    }

    pub async fn framework_message(&self, agent_id: &AgentId, data: &[u8]) {
        tracing::debug!(agent = %agent_id, bytes = data.len(), "ignoring framework message");
    }

    pub fn disconnected(&self) {
        tracing::error!("disconnected from master");
        (self.on_fatal)(FatalKind::MasterDisconnect);
    }

    pub async fn agent_lost(&self, agent_id: &AgentId) {
        // The per-task TASK_LOST statuses carry the actionable signal.
        tracing::warn!(agent = %agent_id, "agent lost");
    }

    pub async fn executor_lost(&self, agent_id: &AgentId, executor_id: &str) {
        tracing::warn!(agent = %agent_id, executor = %executor_id, "executor lost");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(%message, "driver error");
        (self.on_fatal)(FatalKind::DriverError);
    }
}

#[cfg(test)]
mod tests {
    use kestrel_store::MemoryStore;
    use kestrel_types::{CPUS, StatusReason, UNRESERVED_ROLE};

    use super::*;
    use crate::bootstrap::{Scheduler, SchedulerBuilder};
    use crate::plan::StepStatus;
    use crate::processor::OfferProcessor;
    use crate::testing::{DriverCall, RecordingDriver, offer, single_task_spec};

    struct Harness {
        raw: Arc<dyn PersistentStore>,
        state: StateStore,
        driver: Arc<RecordingDriver>,
        client: Arc<tokio::sync::Mutex<DeployScheduler>>,
        processor: OfferProcessor,
    }

    async fn harness(spec: ServiceSpec) -> Harness {
        let raw: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        harness_on(spec, raw).await
    }

    async fn harness_on(spec: ServiceSpec, raw: Arc<dyn PersistentStore>) -> Harness {
        let driver = Arc::new(RecordingDriver::new());
        let built = SchedulerBuilder::new(spec, raw.clone(), driver.clone())
            .build()
            .await
            .unwrap();
        let Scheduler::Deploy(deploy) = built else {
            panic!("expected deploy mode");
        };
        let client = Arc::new(tokio::sync::Mutex::new(*deploy));
        let shared: SharedClient = client.clone();
        let processor = OfferProcessor::direct(
            shared,
            driver.clone(),
            raw.clone(),
            SchedulerConfig::default(),
        );
        Harness {
            state: StateStore::new(raw.clone()),
            raw,
            driver,
            client,
            processor,
        }
    }

    fn cpu_offer(id: &str, cpus: f64) -> Offer {
        offer(id, "a1", "h1", vec![Resource::scalar(CPUS, cpus, UNRESERVED_ROLE)])
    }

    fn reserved_offer(id: &str, resource: Resource) -> Offer {
        offer(id, "a1", "h1", vec![resource])
    }

    fn op_kinds(ops: &[kestrel_types::OfferOperation]) -> Vec<&'static str> {
        ops.iter().map(|o| o.kind()).collect()
    }

    #[tokio::test]
    async fn s1_fresh_deploy_reserves_and_launches() {
        let h = harness(single_task_spec("p0", 1, 1.0)).await;
        h.client.lock().await.registered("fw-1", false).await;
        h.processor.enqueue(vec![cpu_offer("O1", 3.0)]).await;

        let accepts = h.driver.accepts();
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].0, vec![OfferId("O1".into())]);
        assert_eq!(op_kinds(&accepts[0].1), vec!["RESERVE", "LAUNCH"]);

        let task = h.state.fetch_task("p0-0-server").await.unwrap().unwrap();
        assert!(!task.task_id.is_empty());
        assert_eq!(task.resource_ids().len(), 1);
        assert_eq!(task.pod_instance, "p0-0");
    }

    #[tokio::test]
    async fn s2_unfit_offer_declined_long_with_outcome() {
        let h = harness(single_task_spec("p0", 1, 1.0)).await;
        h.client.lock().await.registered("fw-1", false).await;
        h.processor.enqueue(vec![cpu_offer("O2", 0.5)]).await;

        assert!(h.driver.accepts().is_empty());
        assert_eq!(
            h.driver.declines(),
            vec![(OfferId("O2".into()), SchedulerConfig::default().long_refuse)]
        );
        assert!(h.state.fetch_task("p0-0-server").await.unwrap().is_none());
        let client = h.client.lock().await;
        let outcome = client.offer_outcomes().next().unwrap();
        assert!(outcome.reason.contains("insufficient cpus"));
    }

    #[tokio::test]
    async fn s3_restart_recovers_and_defers_offers_until_reconciled() {
        let spec = single_task_spec("p0", 1, 1.0);
        let h = harness(spec.clone()).await;
        h.client.lock().await.registered("fw-1", false).await;
        h.processor.enqueue(vec![cpu_offer("O1", 3.0)]).await;
        let task = h.state.fetch_task("p0-0-server").await.unwrap().unwrap();
        let t1 = task.task_id.clone();
        h.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t1.clone(), TaskState::Running))
            .await;

        // the process restarts: same store, fresh scheduler
        let h2 = harness_on(spec, h.raw.clone()).await;
        h2.client.lock().await.registered("fw-1", false).await;
        assert!(h2.driver.kills().is_empty(), "no kills on clean restart");

        h2.processor.enqueue(vec![cpu_offer("O3", 3.0)]).await;
        // reconciliation fired for exactly the known task, offers deferred
        let reconciles: Vec<Vec<TaskId>> = h2
            .driver
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Reconcile(statuses) => {
                    Some(statuses.into_iter().map(|s| s.task_id).collect())
                }
                _ => None,
            })
            .collect();
        assert_eq!(reconciles, vec![vec![t1.clone()]]);
        assert!(h2.driver.accepts().is_empty());
        assert_eq!(
            h2.driver.declines(),
            vec![(OfferId("O3".into()), SchedulerConfig::default().short_refuse)]
        );

        // the master confirms the task; offers flow again
        h2.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t1, TaskState::Running))
            .await;
        h2.processor.enqueue(vec![cpu_offer("O4", 3.0)]).await;
        assert!(h2.driver.accepts().is_empty(), "already converged");
        // converged: the second offer is of no use, declined long
        let declines = h2.driver.declines();
        assert_eq!(declines.last().unwrap().0, OfferId("O4".into()));
        assert_eq!(declines.last().unwrap().1, SchedulerConfig::default().long_refuse);
    }

    #[tokio::test]
    async fn s4_permanent_failure_replaces_task_and_releases_old_reservation() {
        let h = harness(single_task_spec("p0", 1, 1.0)).await;
        h.client.lock().await.registered("fw-1", false).await;
        h.processor.enqueue(vec![cpu_offer("O1", 3.0)]).await;
        let before = h.state.fetch_task("p0-0-server").await.unwrap().unwrap();
        let t1 = before.task_id.clone();
        let r1 = before.resource_ids()[0];
        h.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t1.clone(), TaskState::Running))
            .await;

        let mut failed = TaskStatus::new(t1.clone(), TaskState::Failed);
        failed.reason = Some(StatusReason::GarbageCollectionError);
        h.client.lock().await.handle_status(&failed).await;
        assert!(
            h.state
                .fetch_task("p0-0-server")
                .await
                .unwrap()
                .unwrap()
                .permanently_failed
        );

        // replacement launch on the next offer: fresh reservation, new id
        h.driver.clear();
        h.processor.enqueue(vec![cpu_offer("O2", 3.0)]).await;
        let accepts = h.driver.accepts();
        assert_eq!(accepts.len(), 1);
        assert_eq!(op_kinds(&accepts[0].1), vec!["RESERVE", "LAUNCH"]);
        let after = h.state.fetch_task("p0-0-server").await.unwrap().unwrap();
        let t2 = after.task_id.clone();
        let r2 = after.resource_ids()[0];
        assert_ne!(t1, t2);
        assert_ne!(r1, r2);

        // the old reservation resurfaces in an offer and is unreserved
        h.driver.clear();
        let mut stale = Resource::scalar(CPUS, 1.0, "svc-role");
        stale.reservation = Some(kestrel_types::Reservation {
            role: "svc-role".into(),
            principal: "svc-principal".into(),
            resource_id: r1,
        });
        h.processor
            .enqueue(vec![reserved_offer("O3", stale)])
            .await;
        let accepts = h.driver.accepts();
        assert_eq!(accepts.len(), 1);
        assert_eq!(op_kinds(&accepts[0].1), vec!["UNRESERVE"]);
    }

    #[tokio::test]
    async fn duplicate_status_is_idempotent() {
        let h = harness(single_task_spec("p0", 1, 1.0)).await;
        h.client.lock().await.registered("fw-1", false).await;
        h.processor.enqueue(vec![cpu_offer("O1", 3.0)]).await;
        let t1 = h
            .state
            .fetch_task("p0-0-server")
            .await
            .unwrap()
            .unwrap()
            .task_id;

        let running = TaskStatus::new(t1, TaskState::Running);
        h.client.lock().await.handle_status(&running).await;
        let snapshot: Vec<(String, StepStatus)> = {
            let client = h.client.lock().await;
            client
                .plans()
                .flat_map(|p| p.steps())
                .map(|s| (s.name.clone(), s.status))
                .collect()
        };
        h.client.lock().await.handle_status(&running).await;
        let again: Vec<(String, StepStatus)> = {
            let client = h.client.lock().await;
            client
                .plans()
                .flat_map(|p| p.steps())
                .map(|s| (s.name.clone(), s.status))
                .collect()
        };
        assert_eq!(snapshot, again);
        assert_eq!(
            h.state.fetch_status("p0-0-server").await.unwrap().unwrap().state,
            TaskState::Running
        );
    }

    #[tokio::test]
    async fn unknown_status_is_dropped() {
        let h = harness(single_task_spec("p0", 1, 1.0)).await;
        h.client.lock().await.registered("fw-1", false).await;
        h.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(
                TaskId("stranger".into()),
                TaskState::Running,
            ))
            .await;
        assert!(h.state.fetch_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_registration_skips_initialization() {
        let h = harness(single_task_spec("p0", 1, 1.0)).await;
        {
            let mut client = h.client.lock().await;
            client.registered("fw-1", false).await;
            // master election: a repeat registration must not redo cleanup
            client.registered("fw-1", false).await;
        }
        assert_eq!(
            h.state
                .fetch_tasks()
                .await
                .unwrap()
                .len(),
            0
        );
        assert!(h.driver.kills().is_empty());
    }

    #[tokio::test]
    async fn s5_decommission_kills_unreserves_and_clears() {
        // deploy two instances
        let spec2 = single_task_spec("p0", 2, 1.0);
        let h = harness(spec2).await;
        h.client.lock().await.registered("fw-1", false).await;
        h.processor.enqueue(vec![cpu_offer("O1", 3.0)]).await;
        let t0 = h.state.fetch_task("p0-0-server").await.unwrap().unwrap().task_id;
        h.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t0, TaskState::Running))
            .await;
        h.processor.enqueue(vec![cpu_offer("O2", 3.0)]).await;
        let p01 = h.state.fetch_task("p0-1-server").await.unwrap().unwrap();
        let t1 = p01.task_id.clone();
        let r1 = p01.resource_ids()[0];
        h.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t1.clone(), TaskState::Running))
            .await;

        // the spec shrinks to one instance; restart with the new target
        let h2 = harness_on(single_task_spec("p0", 1, 1.0), h.raw.clone()).await;
        h2.client.lock().await.registered("fw-1", false).await;
        // confirm the surviving task so reconciliation clears
        let t0 = h2.state.fetch_task("p0-0-server").await.unwrap().unwrap().task_id;
        h2.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t0, TaskState::Running))
            .await;

        // a tick drives the decommission kill
        h2.processor.enqueue(vec![cpu_offer("O3", 0.1)]).await;
        assert!(h2.driver.kills().contains(&t1));
        h2.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t1, TaskState::Killed))
            .await;

        // the freed reservation comes back in an offer and is unreserved
        h2.driver.clear();
        let mut stale = Resource::scalar(CPUS, 1.0, "svc-role");
        stale.reservation = Some(kestrel_types::Reservation {
            role: "svc-role".into(),
            principal: "svc-principal".into(),
            resource_id: r1,
        });
        h2.processor.enqueue(vec![reserved_offer("O4", stale)]).await;
        let accepts = h2.driver.accepts();
        assert_eq!(accepts.len(), 1);
        assert_eq!(op_kinds(&accepts[0].1), vec!["UNRESERVE"]);

        // one more tick clears the task record
        h2.processor.enqueue(vec![cpu_offer("O5", 0.1)]).await;
        assert!(h2.state.fetch_task("p0-1-server").await.unwrap().is_none());
        assert!(h2.state.fetch_task("p0-0-server").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn offers_gated_until_api_server_starts_and_roles_filtered() {
        let h = harness(single_task_spec("p0", 1, 1.0)).await;
        let shared: SharedClient = h.client.clone();
        let flags = Arc::new(SchedulerFlags::default());
        let framework = FrameworkScheduler::new(
            OfferProcessor::direct(
                shared.clone(),
                h.driver.clone(),
                h.raw.clone(),
                SchedulerConfig::default(),
            ),
            shared,
            h.driver.clone(),
            flags,
            "svc-role",
            SchedulerConfig::default(),
            Arc::new(|_| {}),
        );
        framework.registered("fw-1").await;

        // before the api server is up every offer is short-declined
        framework.resource_offers(vec![cpu_offer("O1", 3.0)]).await;
        assert_eq!(
            h.driver.declines(),
            vec![(OfferId("O1".into()), SchedulerConfig::default().short_refuse)]
        );
        assert!(h.driver.accepts().is_empty());

        framework.mark_api_started();
        h.driver.clear();

        // an offer with only foreign-role resources is declined, never accepted
        framework
            .resource_offers(vec![offer(
                "O2",
                "a1",
                "h1",
                vec![Resource::scalar(CPUS, 8.0, "someone-else")],
            )])
            .await;
        assert_eq!(
            h.driver.declines(),
            vec![(OfferId("O2".into()), SchedulerConfig::default().long_refuse)]
        );
        assert!(h.driver.accepts().is_empty());

        // a matching offer flows through to a launch
        h.driver.clear();
        framework.resource_offers(vec![cpu_offer("O3", 3.0)]).await;
        assert_eq!(h.driver.accepts().len(), 1);
    }

    #[tokio::test]
    async fn completed_service_suppresses_offers_and_failure_revives() {
        let h = harness(single_task_spec("p0", 1, 1.0)).await;
        h.client.lock().await.registered("fw-1", false).await;
        h.processor.enqueue(vec![cpu_offer("O1", 3.0)]).await;
        let t1 = h
            .state
            .fetch_task("p0-0-server")
            .await
            .unwrap()
            .unwrap()
            .task_id;
        h.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t1.clone(), TaskState::Running))
            .await;

        // next batch finds nothing to do and suppresses
        h.processor.enqueue(vec![cpu_offer("O2", 3.0)]).await;
        assert!(h
            .driver
            .calls()
            .iter()
            .any(|c| matches!(c, DriverCall::Suppress)));

        // a failure revives the offer stream
        h.client
            .lock()
            .await
            .handle_status(&TaskStatus::new(t1, TaskState::Failed))
            .await;
        assert!(h
            .driver
            .calls()
            .iter()
            .any(|c| matches!(c, DriverCall::Revive)));
    }
}
