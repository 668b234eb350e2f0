use serde::{Deserialize, Serialize};

use crate::offer::{AgentId, OfferId};
use crate::resource::Resource;
use crate::task::TaskInfo;

/// Wire operations sent to the master inside an ACCEPT call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OfferOperation {
    Launch { tasks: Vec<TaskInfo> },
    /// Colocated tasks sharing an executor, launched as one unit.
    LaunchGroup { tasks: Vec<TaskInfo> },
    Reserve { resources: Vec<Resource> },
    Unreserve { resources: Vec<Resource> },
    Create { resources: Vec<Resource> },
    Destroy { resources: Vec<Resource> },
}

impl OfferOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            OfferOperation::Launch { .. } => "LAUNCH",
            OfferOperation::LaunchGroup { .. } => "LAUNCH_GROUP",
            OfferOperation::Reserve { .. } => "RESERVE",
            OfferOperation::Unreserve { .. } => "UNRESERVE",
            OfferOperation::Create { .. } => "CREATE",
            OfferOperation::Destroy { .. } => "DESTROY",
        }
    }
}

/// What the evaluator wants done with a slice of one offer. Each variant
/// carries the offer it applies to so recommendations from one batch can be
/// grouped per offer when building ACCEPT calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OfferRecommendation {
    Reserve {
        offer_id: OfferId,
        agent_id: AgentId,
        resource: Resource,
    },
    Unreserve {
        offer_id: OfferId,
        agent_id: AgentId,
        resource: Resource,
    },
    CreateVolume {
        offer_id: OfferId,
        agent_id: AgentId,
        resource: Resource,
    },
    DestroyVolume {
        offer_id: OfferId,
        agent_id: AgentId,
        resource: Resource,
    },
    Launch {
        offer_id: OfferId,
        agent_id: AgentId,
        task: TaskInfo,
        /// When false the launch exists only to satisfy the evaluator's own
        /// bookkeeping and must never reach the master or the stores.
        should_launch: bool,
    },
}

impl OfferRecommendation {
    pub fn offer_id(&self) -> &OfferId {
        match self {
            OfferRecommendation::Reserve { offer_id, .. }
            | OfferRecommendation::Unreserve { offer_id, .. }
            | OfferRecommendation::CreateVolume { offer_id, .. }
            | OfferRecommendation::DestroyVolume { offer_id, .. }
            | OfferRecommendation::Launch { offer_id, .. } => offer_id,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        match self {
            OfferRecommendation::Reserve { agent_id, .. }
            | OfferRecommendation::Unreserve { agent_id, .. }
            | OfferRecommendation::CreateVolume { agent_id, .. }
            | OfferRecommendation::DestroyVolume { agent_id, .. }
            | OfferRecommendation::Launch { agent_id, .. } => agent_id,
        }
    }

    /// Total mapping from recommendation to wire operation. A transient
    /// launch maps to nothing.
    pub fn operation(&self) -> Option<OfferOperation> {
        match self {
            OfferRecommendation::Reserve { resource, .. } => Some(OfferOperation::Reserve {
                resources: vec![resource.clone()],
            }),
            OfferRecommendation::Unreserve { resource, .. } => Some(OfferOperation::Unreserve {
                resources: vec![resource.clone()],
            }),
            OfferRecommendation::CreateVolume { resource, .. } => Some(OfferOperation::Create {
                resources: vec![resource.clone()],
            }),
            OfferRecommendation::DestroyVolume { resource, .. } => Some(OfferOperation::Destroy {
                resources: vec![resource.clone()],
            }),
            OfferRecommendation::Launch {
                task, should_launch, ..
            } => should_launch.then(|| OfferOperation::Launch {
                tasks: vec![task.clone()],
            }),
        }
    }
}
