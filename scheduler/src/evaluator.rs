//! The offer evaluator: a pure function from (pending step requirement,
//! offer batch) to recommendations. No persistence, no network; every
//! decision it makes is replayable from its inputs.

use std::collections::VecDeque;

use kestrel_types::{
    GoalState, Offer, OfferRecommendation, PlacementRule, PortRange, Reservation, Resource,
    ResourceValue, SCALAR_EPSILON, TaskId, TaskInfo, UNRESERVED_ROLE, VolumeInfo,
};
use uuid::Uuid;

/// What one pod instance needs from the cluster: which tasks to launch and
/// with what resources, plus the rules constraining where they may land.
#[derive(Clone, Debug)]
pub struct PodInstanceRequirement {
    pub pod_instance: String,
    pub placement: Vec<PlacementRule>,
    pub tasks: Vec<TaskRequirement>,
    pub config_id: Option<Uuid>,
}

#[derive(Clone, Debug)]
pub struct TaskRequirement {
    pub name: String,
    pub command: String,
    pub goal: GoalState,
    /// False marks a transient placeholder: the evaluator accounts for the
    /// task's resources but the launch itself must never leave the process.
    pub should_launch: bool,
    pub resources: Vec<ResourceRequest>,
}

#[derive(Clone, Debug)]
pub struct ResourceRequest {
    pub name: String,
    pub value: ResourceValue,
    /// Reservation already held for this slot; the evaluator insists on
    /// finding it in the offer rather than reserving again.
    pub existing_id: Option<Uuid>,
    pub volume: Option<VolumeRequest>,
}

#[derive(Clone, Debug)]
pub struct VolumeRequest {
    pub container_path: String,
}

/// One evaluation verdict, kept for the diagnostics surface.
#[derive(Clone, Debug)]
pub struct OfferOutcome {
    pub offer_id: String,
    pub hostname: String,
    pub pod_instance: String,
    pub accepted: bool,
    pub reason: String,
}

/// Ring buffer of recent evaluation outcomes.
pub struct OfferOutcomeTracker {
    capacity: usize,
    outcomes: VecDeque<OfferOutcome>,
}

impl OfferOutcomeTracker {
    pub fn new(capacity: usize) -> Self {
        OfferOutcomeTracker {
            capacity: capacity.max(1),
            outcomes: VecDeque::new(),
        }
    }

    pub fn record(&mut self, outcome: OfferOutcome) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &OfferOutcome> {
        self.outcomes.iter()
    }
}

pub struct OfferEvaluator {
    pub role: String,
    pub principal: String,
}

impl OfferEvaluator {
    pub fn new(role: &str, principal: &str) -> Self {
        OfferEvaluator {
            role: role.to_string(),
            principal: principal.to_string(),
        }
    }

    /// Try each offer in arrival order; the first one that passes every
    /// placement rule and satisfies every resource slot yields the complete
    /// recommendation set for the step. The rest of the batch is left for
    /// subsequent steps.
    pub fn evaluate(
        &self,
        req: &PodInstanceRequirement,
        offers: &[Offer],
        deployed: &[TaskInfo],
        outcomes: &mut OfferOutcomeTracker,
    ) -> Vec<OfferRecommendation> {
        for offer in offers {
            let verdict = match placement_failure(req, offer, deployed) {
                Some(reason) => Err(reason),
                None => self.try_match(req, offer),
            };
            match verdict {
                Ok(recs) => {
                    outcomes.record(OfferOutcome {
                        offer_id: offer.id.0.clone(),
                        hostname: offer.hostname.clone(),
                        pod_instance: req.pod_instance.clone(),
                        accepted: true,
                        reason: String::new(),
                    });
                    return recs;
                }
                Err(reason) => {
                    tracing::debug!(
                        offer = %offer.id,
                        pod_instance = %req.pod_instance,
                        %reason,
                        "offer did not satisfy requirement"
                    );
                    outcomes.record(OfferOutcome {
                        offer_id: offer.id.0.clone(),
                        hostname: offer.hostname.clone(),
                        pod_instance: req.pod_instance.clone(),
                        accepted: false,
                        reason,
                    });
                }
            }
        }
        Vec::new()
    }

    fn try_match(
        &self,
        req: &PodInstanceRequirement,
        offer: &Offer,
    ) -> Result<Vec<OfferRecommendation>, String> {
        let mut pool = offer.resources.clone();
        let mut recs = Vec::new();

        for task in &req.tasks {
            let mut consumed = Vec::new();
            for request in &task.resources {
                let fresh = request.existing_id.is_none();
                let resource = self.take(&mut pool, request)?;
                if fresh {
                    // Freshly reserved slice: the master must be told.
                    recs.push(OfferRecommendation::Reserve {
                        offer_id: offer.id.clone(),
                        agent_id: offer.agent_id.clone(),
                        resource: resource.clone(),
                    });
                    if resource.volume.is_some() {
                        recs.push(OfferRecommendation::CreateVolume {
                            offer_id: offer.id.clone(),
                            agent_id: offer.agent_id.clone(),
                            resource: resource.clone(),
                        });
                    }
                }
                consumed.push(resource);
            }
            let task_id = if task.should_launch {
                TaskId::generate(&task.name)
            } else {
                TaskId::reservation()
            };
            recs.push(OfferRecommendation::Launch {
                offer_id: offer.id.clone(),
                agent_id: offer.agent_id.clone(),
                task: TaskInfo {
                    name: task.name.clone(),
                    task_id,
                    pod_instance: req.pod_instance.clone(),
                    agent_id: offer.agent_id.clone(),
                    hostname: offer.hostname.clone(),
                    region: offer.region.clone(),
                    zone: offer.zone.clone(),
                    attributes: offer.attributes.clone(),
                    command: task.command.clone(),
                    resources: consumed,
                    labels: Default::default(),
                    config_id: req.config_id,
                    permanently_failed: false,
                },
                should_launch: task.should_launch,
            });
        }
        Ok(recs)
    }

    /// Satisfy one resource slot from the pool. Preference order: the
    /// existing reservation matched by resource-id, then a pre-reserved role
    /// slice, then a fresh dynamic reservation carved from unreserved
    /// capacity.
    fn take(&self, pool: &mut Vec<Resource>, request: &ResourceRequest) -> Result<Resource, String> {
        if let Some(id) = request.existing_id {
            let idx = pool
                .iter()
                .position(|r| r.resource_id() == Some(id))
                .ok_or_else(|| format!("reservation {id} for {} not offered", request.name))?;
            return Ok(pool.remove(idx));
        }

        // Pre-reserved slice for our role, not yet tied to a task.
        let pre_reserved = pool.iter().position(|r| {
            r.name == request.name
                && r.role == self.role
                && r.reservation.is_none()
                && r.value.covers(&request.value)
        });
        // Fall back to unreserved capacity.
        let idx = pre_reserved
            .or_else(|| {
                pool.iter().position(|r| {
                    r.name == request.name
                        && r.role == UNRESERVED_ROLE
                        && r.value.covers(&request.value)
                })
            })
            .ok_or_else(|| format!("insufficient {}", request.name))?;

        let value = carve(&mut pool[idx], &request.value)?;
        if is_exhausted(&pool[idx].value) {
            pool.remove(idx);
        }
        Ok(Resource {
            name: request.name.clone(),
            value,
            role: self.role.clone(),
            reservation: Some(Reservation {
                role: self.role.clone(),
                principal: self.principal.clone(),
                resource_id: Uuid::new_v4(),
            }),
            volume: request.volume.as_ref().map(|v| VolumeInfo {
                container_path: v.container_path.clone(),
                persistence_id: Uuid::new_v4(),
            }),
        })
    }
}

/// Remove `want` from the pooled value, returning the concrete slice taken.
fn carve(resource: &mut Resource, want: &ResourceValue) -> Result<ResourceValue, String> {
    match (&mut resource.value, want) {
        (ResourceValue::Scalar(have), ResourceValue::Scalar(want)) => {
            *have -= want;
            Ok(ResourceValue::Scalar(*want))
        }
        (ResourceValue::Ranges(have), ResourceValue::Ranges(want)) => {
            let mut taken = Vec::new();
            for slot in want {
                let port = if slot.begin == 0 && slot.end == 0 {
                    // Dynamic request: any offered port will do.
                    have.first().map(|r| r.begin).ok_or("insufficient ports")?
                } else {
                    slot.begin
                };
                take_port(have, port).ok_or_else(|| format!("port {port} not offered"))?;
                taken.push(PortRange {
                    begin: port,
                    end: port,
                });
            }
            Ok(ResourceValue::Ranges(taken))
        }
        _ => Err(format!("resource kind mismatch for {}", resource.name)),
    }
}

fn take_port(ranges: &mut Vec<PortRange>, port: u64) -> Option<()> {
    let idx = ranges.iter().position(|r| r.contains(port))?;
    let r = ranges[idx];
    ranges.remove(idx);
    if port > r.begin {
        ranges.insert(
            idx,
            PortRange {
                begin: r.begin,
                end: port - 1,
            },
        );
    }
    if port < r.end {
        ranges.push(PortRange {
            begin: port + 1,
            end: r.end,
        });
    }
    Some(())
}

fn is_exhausted(value: &ResourceValue) -> bool {
    match value {
        ResourceValue::Scalar(v) => *v < SCALAR_EPSILON,
        ResourceValue::Ranges(r) => r.is_empty(),
    }
}

pub fn instance_index(pod_instance: &str) -> Option<u32> {
    pod_instance.rsplit('-').next()?.parse().ok()
}

fn placement_failure(
    req: &PodInstanceRequirement,
    offer: &Offer,
    deployed: &[TaskInfo],
) -> Option<String> {
    let pod_type = match req.pod_instance.rfind('-') {
        Some(i) => &req.pod_instance[..i],
        None => req.pod_instance.as_str(),
    };
    let siblings: Vec<&TaskInfo> = deployed
        .iter()
        .filter(|t| t.pod_type() == pod_type && t.pod_instance != req.pod_instance)
        .collect();

    for rule in &req.placement {
        match rule {
            PlacementRule::UniqueHostname => {
                if siblings.iter().any(|t| t.hostname == offer.hostname) {
                    return Some(format!("hostname {} already hosts {}", offer.hostname, pod_type));
                }
            }
            PlacementRule::UniqueRegion => {
                if offer.region.is_some() && siblings.iter().any(|t| t.region == offer.region) {
                    return Some(format!(
                        "region {:?} already hosts {}",
                        offer.region, pod_type
                    ));
                }
            }
            PlacementRule::UniqueZone => {
                if offer.zone.is_some() && siblings.iter().any(|t| t.zone == offer.zone) {
                    return Some(format!("zone {:?} already hosts {}", offer.zone, pod_type));
                }
            }
            PlacementRule::UniqueAttribute(key) => {
                if let Some(value) = offer.attributes.get(key)
                    && siblings
                        .iter()
                        .any(|t| t.attributes.get(key) == Some(value))
                {
                    return Some(format!("attribute {key}={value} already hosts {pod_type}"));
                }
            }
            PlacementRule::Colocate(target_pod) => {
                let Some(index) = instance_index(&req.pod_instance) else {
                    return Some(format!("cannot derive index from {}", req.pod_instance));
                };
                let target = format!("{target_pod}-{index}");
                match deployed.iter().find(|t| t.pod_instance == target) {
                    Some(t) if t.hostname == offer.hostname => {}
                    Some(t) => {
                        return Some(format!(
                            "colocation target {target} runs on {}, not {}",
                            t.hostname, offer.hostname
                        ));
                    }
                    None => return Some(format!("colocation target {target} not deployed")),
                }
            }
        }
    }
    None
}
