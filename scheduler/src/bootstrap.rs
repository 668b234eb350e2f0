use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use kestrel_store::{ConfigStore, PersistentStore, StateStore, UNINSTALL_FLAG};
use kestrel_types::{GoalOverride, OverrideKind, ServiceSpec, TaskStatus};
use uuid::Uuid;

use crate::args::SchedulerConfig;
use crate::driver::MasterDriver;
use crate::plan::PlanManager;
use crate::plan::coordinator::PlanCoordinator;
use crate::plan::decommission::{DecommissionManager, teardowns_for};
use crate::plan::deploy::DeploymentManager;
use crate::plan::recovery::RecoveryManager;
use crate::service::DeployScheduler;
use crate::uninstall::UninstallScheduler;

/// The fatal error classes. Everything else is retried or dropped; these
/// terminate the process so the supervisor restarts it against persistent
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalKind {
    Registration,
    MasterDisconnect,
    DriverError,
    SchedulerInit,
}

pub const EXIT_GENERAL: i32 = 1;

impl FatalKind {
    pub fn exit_code(self) -> i32 {
        match self {
            FatalKind::Registration => 11,
            FatalKind::MasterDisconnect => 12,
            FatalKind::DriverError => 13,
            FatalKind::SchedulerInit => 14,
        }
    }
}

pub type FatalHandler = Arc<dyn Fn(FatalKind) + Send + Sync>;

/// The production handler: log and exit with the dedicated code.
pub fn exit_on_fatal() -> FatalHandler {
    Arc::new(|kind| {
        tracing::error!(?kind, code = kind.exit_code(), "fatal error, exiting");
        std::process::exit(kind.exit_code());
    })
}

/// The two scheduler modes. Uninstall is absorbing: once the flag is
/// persisted, every subsequent bootstrap lands here until the store is gone.
pub enum Scheduler {
    Deploy(Box<DeployScheduler>),
    Uninstall(Box<UninstallScheduler>),
}

/// Assembles a scheduler from stores, driver, and the declared spec:
/// resolves the target configuration (bumping it when the spec's identity
/// hash changed), generates the plans, and picks the mode.
pub struct SchedulerBuilder {
    spec: ServiceSpec,
    config: SchedulerConfig,
    store: Arc<dyn PersistentStore>,
    driver: Arc<dyn MasterDriver>,
}

impl SchedulerBuilder {
    pub fn new(
        spec: ServiceSpec,
        store: Arc<dyn PersistentStore>,
        driver: Arc<dyn MasterDriver>,
    ) -> Self {
        SchedulerBuilder {
            spec,
            config: SchedulerConfig::default(),
            store,
            driver,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn build(self) -> Result<Scheduler> {
        let uninstalling = match self.store.get(UNINSTALL_FLAG).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e).context("failed to read uninstall flag"),
        };
        if uninstalling {
            tracing::warn!("uninstall flag present; resuming uninstall");
            let scheduler = UninstallScheduler::new(self.config, self.store, self.driver)
                .await
                .context("failed to build uninstall scheduler")?;
            return Ok(Scheduler::Uninstall(Box::new(scheduler)));
        }

        let configs = ConfigStore::new(self.store.clone());
        let state = StateStore::new(self.store.clone());

        let target_id = resolve_target(&configs, &self.spec)
            .await
            .context("failed to resolve target configuration")?;

        let tasks = state.fetch_tasks().await.context("failed to load tasks")?;
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut overrides: HashMap<String, GoalOverride> = HashMap::new();
        for task in &tasks {
            if let Some(status) = state
                .fetch_status(&task.name)
                .await
                .context("failed to load status")?
            {
                statuses.insert(task.name.clone(), status);
            }
            overrides.insert(
                task.name.clone(),
                state
                    .fetch_goal_override(&task.name)
                    .await
                    .context("failed to load goal override")?,
            );
        }

        // Instances the new target no longer wants are decommissioned; the
        // override keeps their reservations from being defended while the
        // teardown runs.
        let teardowns = teardowns_for(&self.spec, &tasks);
        for teardown in &teardowns {
            for name in &teardown.task_names {
                let current = overrides.get(name).copied().unwrap_or_default();
                if current.kind == OverrideKind::Decommissioning {
                    continue;
                }
                let decommissioning = GoalOverride::new(OverrideKind::Decommissioning);
                match state.store_goal_override(name, decommissioning).await {
                    Ok(()) => {
                        overrides.insert(name.clone(), decommissioning);
                    }
                    Err(e) => {
                        tracing::warn!(task = %name, "could not mark decommissioning: {e}");
                    }
                }
            }
        }

        let in_use: HashSet<Uuid> = tasks.iter().filter_map(|t| t.config_id).collect();
        configs
            .prune(&in_use)
            .await
            .context("failed to prune configurations")?;

        let deploy = DeploymentManager::new(&self.spec, target_id, &tasks, &statuses, &overrides);
        let recovery = RecoveryManager::new(self.spec.clone(), target_id);
        let mut managers: Vec<Box<dyn PlanManager>> = vec![Box::new(deploy), Box::new(recovery)];
        if !teardowns.is_empty() {
            managers.push(Box::new(DecommissionManager::new(teardowns)));
        }
        let coordinator = PlanCoordinator::new(managers);

        Ok(Scheduler::Deploy(Box::new(DeployScheduler::new(
            self.spec,
            target_id,
            self.config,
            self.store,
            self.driver,
            coordinator,
        ))))
    }
}

/// Exactly one target exists at any moment: the spec blob is written first,
/// the pointer last, so a crash between the writes leaves the old target.
async fn resolve_target(configs: &ConfigStore, spec: &ServiceSpec) -> Result<Uuid> {
    if let Some(id) = configs.target().await? {
        let stored = configs.fetch(id).await?;
        if stored.identity_hash() == spec.identity_hash() {
            return Ok(id);
        }
        tracing::info!(previous = %id, "service spec changed; storing new target");
    } else {
        tracing::info!("no target configuration; storing initial spec");
    }
    let id = configs.store(spec).await?;
    configs.set_target(id).await?;
    Ok(id)
}
