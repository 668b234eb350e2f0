use kestrel_store::{StateStore, StoreError};
use kestrel_types::OfferRecommendation;
use metrics::counter;

use crate::plan::coordinator::PlanCoordinator;

/// Persists the effects of accepted recommendations before anything is sent
/// to the master. Tasks are written one at a time so a crash mid-batch
/// leaves at most one inconsistent record; reconciliation and resource-id
/// matching repair the rest on restart.
pub struct LaunchRecorder {
    state: StateStore,
}

impl LaunchRecorder {
    pub fn new(state: StateStore) -> Self {
        LaunchRecorder { state }
    }

    pub async fn record(&self, recs: &[OfferRecommendation]) -> Result<(), StoreError> {
        for rec in recs {
            let OfferRecommendation::Launch {
                task,
                should_launch: true,
                ..
            } = rec
            else {
                // Reserve/CreateVolume effects ride on the launched task's
                // resource list; they have no record of their own.
                continue;
            };
            self.state.store_task(task).await?;
            // A status left over from a previous task-id under this name
            // must not shadow the new incarnation.
            self.state.clear_status(&task.name).await?;
            counter!("launches_recorded_total").increment(1);
        }
        Ok(())
    }
}

/// Matches Unreserve/Destroy recommendations against the active
/// resource-cleanup steps and advances them toward COMPLETE.
pub struct CleanupRecorder;

impl CleanupRecorder {
    pub fn record(recs: &[OfferRecommendation], coordinator: &mut PlanCoordinator) {
        for rec in recs {
            let resource = match rec {
                OfferRecommendation::Unreserve { resource, .. }
                | OfferRecommendation::DestroyVolume { resource, .. } => resource,
                _ => continue,
            };
            let Some(id) = resource.resource_id() else {
                continue;
            };
            if !coordinator.advance_cleanup(id) {
                tracing::debug!(%id, "released resource matched no cleanup step");
            }
        }
    }
}
