use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideKind {
    None,
    Paused,
    Stopped,
    Decommissioning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideProgress {
    Pending,
    InProgress,
    Complete,
}

/// A per-task directive layered over the spec's default goal. The pair
/// (kind, progress) controls whether the scheduler should relaunch the task
/// under a modified command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalOverride {
    pub kind: OverrideKind,
    pub progress: OverrideProgress,
}

impl Default for GoalOverride {
    fn default() -> Self {
        GoalOverride {
            kind: OverrideKind::None,
            progress: OverrideProgress::Complete,
        }
    }
}

impl GoalOverride {
    pub fn new(kind: OverrideKind) -> Self {
        GoalOverride {
            kind,
            progress: OverrideProgress::Pending,
        }
    }

    pub fn is_active(&self) -> bool {
        self.kind != OverrideKind::None
    }
}

/// The legal transitions of the (kind, progress) table, enumerated in one
/// place rather than scattered across components:
///
/// - identical writes are idempotent
/// - within one kind, progress only advances: PENDING -> IN_PROGRESS -> COMPLETE
/// - a new kind is entered at PENDING, and only from a COMPLETE override
/// - clearing back to the default (NONE, COMPLETE) is always legal
pub fn transition_allowed(from: GoalOverride, to: GoalOverride) -> bool {
    use OverrideProgress::*;

    if from == to {
        return true;
    }
    if to == GoalOverride::default() {
        return true;
    }
    if from.kind == to.kind {
        return matches!(
            (from.progress, to.progress),
            (Pending, InProgress) | (Pending, Complete) | (InProgress, Complete)
        );
    }
    // Kind change: only out of a settled override, entering at PENDING.
    from.progress == Complete && to.progress == Pending
}
