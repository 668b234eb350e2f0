use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role marker for resources no one has reserved.
pub const UNRESERVED_ROLE: &str = "*";

pub const CPUS: &str = "cpus";
pub const MEM: &str = "mem";
pub const DISK: &str = "disk";
pub const PORTS: &str = "ports";

/// Tolerance for scalar resource comparisons. Offers round-trip through
/// floating point on the wire, so exact equality is not meaningful.
pub const SCALAR_EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u64,
    pub end: u64,
}

impl PortRange {
    pub fn contains(&self, port: u64) -> bool {
        port >= self.begin && port <= self.end
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResourceValue {
    Scalar(f64),
    Ranges(Vec<PortRange>),
}

impl ResourceValue {
    pub fn scalar(&self) -> Option<f64> {
        match self {
            ResourceValue::Scalar(v) => Some(*v),
            ResourceValue::Ranges(_) => None,
        }
    }

    /// Whether this value can supply `needed` in full.
    pub fn covers(&self, needed: &ResourceValue) -> bool {
        match (self, needed) {
            (ResourceValue::Scalar(have), ResourceValue::Scalar(want)) => {
                *have + SCALAR_EPSILON >= *want
            }
            (ResourceValue::Ranges(have), ResourceValue::Ranges(want)) => want
                .iter()
                .all(|w| (w.begin..=w.end).all(|p| have.iter().any(|h| h.contains(p)))),
            _ => false,
        }
    }
}

/// A dynamic reservation: the resource-id label is the durable handle tying
/// a slice of an agent's resources to a task across restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub role: String,
    pub principal: String,
    pub resource_id: Uuid,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub container_path: String,
    pub persistence_id: Uuid,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: ResourceValue,
    pub role: String,
    pub reservation: Option<Reservation>,
    pub volume: Option<VolumeInfo>,
}

impl Resource {
    pub fn scalar(name: &str, value: f64, role: &str) -> Self {
        Resource {
            name: name.to_string(),
            value: ResourceValue::Scalar(value),
            role: role.to_string(),
            reservation: None,
            volume: None,
        }
    }

    pub fn ports(ranges: Vec<PortRange>, role: &str) -> Self {
        Resource {
            name: PORTS.to_string(),
            value: ResourceValue::Ranges(ranges),
            role: role.to_string(),
            reservation: None,
            volume: None,
        }
    }

    pub fn is_unreserved(&self) -> bool {
        self.role == UNRESERVED_ROLE
    }

    /// The id of the dynamic reservation backing this resource, if any.
    pub fn resource_id(&self) -> Option<Uuid> {
        self.reservation.as_ref().map(|r| r.resource_id)
    }
}
