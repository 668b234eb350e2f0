use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_channel::{Receiver, Sender, TrySendError};
use kestrel_store::PersistentStore;
use kestrel_types::{Offer, OfferId, OfferOperation};
use metrics::counter;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::args::SchedulerConfig;
use crate::driver::MasterDriver;
use crate::service::{ClientState, OfferEventClient, OffersResponse, SharedClient};

/// Bounded FIFO pump between the master's offer callbacks and the event
/// client. One worker drains batches and owns the client between them; when
/// the queue is full, excess batches are short-declined instead of blocking
/// the callback thread. `direct()` collapses the worker into the caller for
/// deterministic tests.
pub struct OfferProcessor {
    tx: Option<Sender<Vec<Offer>>>,
    client: SharedClient,
    driver: Arc<dyn MasterDriver>,
    store: Arc<dyn PersistentStore>,
    rescinded: Arc<Mutex<HashSet<OfferId>>>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl OfferProcessor {
    pub fn spawn(
        client: SharedClient,
        driver: Arc<dyn MasterDriver>,
        store: Arc<dyn PersistentStore>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = if config.offer_queue_depth == 0 {
            async_channel::unbounded()
        } else {
            async_channel::bounded(config.offer_queue_depth)
        };
        let rescinded = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(worker(
            client.clone(),
            driver.clone(),
            store.clone(),
            config.clone(),
            rescinded.clone(),
            rx,
            cancel.clone(),
        ));
        OfferProcessor {
            tx: Some(tx),
            client,
            driver,
            store,
            rescinded,
            config,
            cancel,
        }
    }

    /// Threading disabled: `enqueue` processes the batch on the caller.
    pub fn direct(
        client: SharedClient,
        driver: Arc<dyn MasterDriver>,
        store: Arc<dyn PersistentStore>,
        config: SchedulerConfig,
    ) -> Self {
        OfferProcessor {
            tx: None,
            client,
            driver,
            store,
            rescinded: Arc::new(Mutex::new(HashSet::new())),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn enqueue(&self, offers: Vec<Offer>) {
        match &self.tx {
            Some(tx) => match tx.try_send(offers) {
                Ok(()) => {}
                Err(TrySendError::Full(offers)) | Err(TrySendError::Closed(offers)) => {
                    tracing::warn!(
                        count = offers.len(),
                        "offer queue full; declining batch immediately"
                    );
                    counter!("offers_declined_total", "reason" => "queue_full")
                        .increment(offers.len() as u64);
                    for offer in &offers {
                        self.driver
                            .decline_offer(&offer.id, self.config.short_refuse)
                            .await;
                    }
                }
            },
            None => {
                let mut client = self.client.lock().await;
                process_batch(
                    &mut *client,
                    self.driver.as_ref(),
                    self.store.as_ref(),
                    &self.config,
                    &self.rescinded,
                    offers,
                )
                .await;
            }
        }
    }

    /// Drop the offer from the queue if it is still pending; the worker
    /// also filters it if the batch was already dequeued.
    pub fn rescind(&self, offer_id: &OfferId) {
        self.rescinded.lock().insert(offer_id.clone());
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn worker(
    client: SharedClient,
    driver: Arc<dyn MasterDriver>,
    store: Arc<dyn PersistentStore>,
    config: SchedulerConfig,
    rescinded: Arc<Mutex<HashSet<OfferId>>>,
    rx: Receiver<Vec<Offer>>,
    cancel: CancellationToken,
) {
    loop {
        let offers = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = rx.recv() => match batch {
                Ok(offers) => offers,
                Err(_) => break,
            },
        };
        let mut client = client.lock().await;
        process_batch(
            &mut *client,
            driver.as_ref(),
            store.as_ref(),
            &config,
            &rescinded,
            offers,
        )
        .await;
    }
    tracing::info!("offer processor worker stopped");
}

/// One batch, start to finish. Never propagates: every failure is handled
/// or logged here so nothing reaches the callback thread.
async fn process_batch(
    client: &mut dyn OfferEventClient,
    driver: &dyn MasterDriver,
    store: &dyn PersistentStore,
    config: &SchedulerConfig,
    rescinded: &Mutex<HashSet<OfferId>>,
    mut offers: Vec<Offer>,
) {
    {
        let mut rescinded = rescinded.lock();
        offers.retain(|o| !rescinded.remove(&o.id));
    }
    if offers.is_empty() {
        return;
    }

    match client.state() {
        ClientState::Finished => {
            for offer in &offers {
                driver.decline_offer(&offer.id, config.short_refuse).await;
            }
        }
        ClientState::Uninstalled => {
            for offer in &offers {
                driver.decline_offer(&offer.id, config.short_refuse).await;
            }
            tracing::info!("uninstall complete; stopping driver and wiping state");
            driver.stop(false).await;
            client.unregistered().await;
            if let Err(e) = store.recursive_delete("/").await {
                tracing::error!("failed to wipe persistent state: {e}");
            }
        }
        ClientState::Running => {
            let response = client.offers(&offers).await;
            let (recs, remainder_refuse) = match response {
                OffersResponse::Processed(recs) => (recs, config.long_refuse),
                OffersResponse::NotReady(recs) => (recs, config.short_refuse),
            };

            // One ACCEPT per offer, operations in production order.
            let mut order: Vec<OfferId> = Vec::new();
            let mut grouped: HashMap<OfferId, Vec<OfferOperation>> = HashMap::new();
            for rec in &recs {
                let Some(op) = rec.operation() else {
                    continue;
                };
                let id = rec.offer_id().clone();
                if !grouped.contains_key(&id) {
                    order.push(id.clone());
                }
                grouped.entry(id).or_default().push(op);
            }
            let mut consumed: HashSet<OfferId> = HashSet::new();
            for id in order {
                let ops = coalesce_launches(grouped.remove(&id).unwrap_or_default());
                for op in &ops {
                    counter!("operations_sent_total", "kind" => op.kind()).increment(1);
                }
                driver.accept_offers(&[id.clone()], ops, config.long_refuse).await;
                consumed.insert(id);
            }

            let unused: Vec<Offer> = offers
                .into_iter()
                .filter(|o| !consumed.contains(&o.id))
                .collect();

            // Reserved resources nothing accounts for get released here.
            let mut cleaned: HashSet<OfferId> = HashSet::new();
            for unexpected in client.unexpected_resources(&unused).await {
                let mut ops = Vec::new();
                let volumes: Vec<_> = unexpected
                    .resources
                    .iter()
                    .filter(|r| r.volume.is_some())
                    .cloned()
                    .collect();
                if !volumes.is_empty() {
                    ops.push(OfferOperation::Destroy { resources: volumes });
                }
                ops.push(OfferOperation::Unreserve {
                    resources: unexpected.resources.clone(),
                });
                for op in &ops {
                    counter!("operations_sent_total", "kind" => op.kind()).increment(1);
                }
                driver
                    .accept_offers(&[unexpected.offer_id.clone()], ops, config.long_refuse)
                    .await;
                cleaned.insert(unexpected.offer_id);
            }

            for offer in &unused {
                if cleaned.contains(&offer.id) {
                    continue;
                }
                counter!("offers_declined_total", "reason" => "unused").increment(1);
                driver.decline_offer(&offer.id, remainder_refuse).await;
            }
        }
    }
}

/// Tasks of one pod share an executor, so two or more launches against the
/// same offer go out as a single LAUNCH_GROUP. A lone launch stays LAUNCH.
fn coalesce_launches(ops: Vec<OfferOperation>) -> Vec<OfferOperation> {
    let launch_count = ops
        .iter()
        .filter(|op| matches!(op, OfferOperation::Launch { .. }))
        .count();
    if launch_count < 2 {
        return ops;
    }
    let mut out = Vec::with_capacity(ops.len());
    let mut group: Vec<kestrel_types::TaskInfo> = Vec::new();
    for op in ops {
        match op {
            OfferOperation::Launch { tasks } => group.extend(tasks),
            other => out.push(other),
        }
    }
    out.push(OfferOperation::LaunchGroup { tasks: group });
    out
}
