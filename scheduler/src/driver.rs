use std::time::Duration;

use async_trait::async_trait;
use kestrel_types::{OfferId, OfferOperation, TaskId, TaskStatus};

/// Outbound half of the master protocol, implemented by the upstream driver
/// library. Calls are best-effort fire-and-forget; a broken driver surfaces
/// through the `error` callback, never through these return paths.
#[async_trait]
pub trait MasterDriver: Send + Sync {
    async fn accept_offers(
        &self,
        offer_ids: &[OfferId],
        operations: Vec<OfferOperation>,
        refuse: Duration,
    );

    async fn decline_offer(&self, offer_id: &OfferId, refuse: Duration);

    async fn kill_task(&self, task_id: &TaskId);

    /// Ask the master to re-send the latest status for the given tasks; an
    /// empty list requests statuses for every task it knows about.
    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>);

    async fn suppress_offers(&self);

    async fn revive_offers(&self);

    async fn stop(&self, failover: bool);
}
