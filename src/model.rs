use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::units::Quantity;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub type TaskId = i64;
pub type NodeId = i64;
pub type ResourceId = i64;
pub type UserId = i64;
pub type GroupId = i64;
pub type NotificationId = i64;
pub type LimitId = i64;

/// A node/resource pair. Capacities, allocations and locks are keyed by it.
pub type PairKey = (NodeId, ResourceId);

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSpan")]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

#[derive(Deserialize)]
struct RawSpan {
    start: Ms,
    end: Ms,
}

impl TryFrom<RawSpan> for Span {
    type Error = EngineError;

    fn try_from(raw: RawSpan) -> Result<Self, Self::Error> {
        Span::new(raw.start, raw.end)
    }
}

impl Span {
    /// Zero and negative length spans are rejected.
    pub fn new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// Unchecked constructor for boundaries the caller already ordered.
    pub(crate) fn between(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The common part of two spans, `None` when they only touch or are disjoint.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::between(start, end))
    }

    /// Like [`Span::intersect`], but an empty result is an error.
    pub fn clamp_to(&self, bounds: &Span) -> Result<Span, EngineError> {
        let start = self.start.max(bounds.start);
        let end = self.end.min(bounds.end);
        Span::new(start, end)
    }
}

/// A reservation of one resource on one node for one task's window.
///
/// Allocations are never edited in place: a changed task replaces all of
/// its allocations at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    pub amount: Quantity,
    pub window: Span,
    pub owner_id: UserId,
}

impl Allocation {
    pub fn pair(&self) -> PairKey {
        (self.node_id, self.resource_id)
    }
}

/// How much of a resource a node provides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    pub total: Quantity,
}

impl ResourceCapacity {
    pub fn pair(&self) -> PairKey {
        (self.node_id, self.resource_id)
    }
}

/// Sub-interval of a query window with constant occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSegment {
    pub window: Span,
    pub occupied: Quantity,
    pub user_ids: BTreeSet<UserId>,
}

/// Outcome of a feasibility check. Rejection is a normal answer, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject { conflicts: Vec<UsageSegment> },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    pub fn conflicts(&self) -> &[UsageSegment] {
        match self {
            Verdict::Accept => &[],
            Verdict::Reject { conflicts } => conflicts,
        }
    }

    /// Every user holding capacity in a conflicting segment.
    pub fn occupying_users(&self) -> BTreeSet<UserId> {
        self.conflicts()
            .iter()
            .flat_map(|s| s.user_ids.iter().copied())
            .collect()
    }
}

/// Usage of one node/resource pair inside a [`UsagePeriod`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAvailability {
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    pub used: Quantity,
    pub free: Quantity,
    pub user_ids: BTreeSet<UserId>,
}

/// One calendar period where usage of every pair is constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub window: Span,
    pub resources: Vec<ResourceAvailability>,
}

// ── Groups and notifications ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub parent_id: Option<GroupId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    #[serde(rename = "task_start")]
    TaskStart,
    #[serde(rename = "task_end")]
    TaskEnd,
    #[serde(rename = "grafana_resource_exceedance_task")]
    GrafanaResourceExceedance,
    #[serde(rename = "grafana_resource_exceedance_general")]
    GrafanaResourceExceedanceGeneral,
    #[serde(rename = "other")]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    /// Offset relative to the triggering event, in minutes.
    #[serde(default)]
    pub time_offset: Option<i64>,
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
}

/// Notifications contributed by one level of the group chain.
/// `group_id` is `None` for notifications addressed to a user directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationScope {
    pub group_id: Option<GroupId>,
    pub group_name: Option<String>,
    pub notifications: Vec<Notification>,
}

/// Administrative cap on how much of a resource a user or group may request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub id: LimitId,
    pub name: String,
    pub amount: f64,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub resource_id: ResourceId,
    /// Nodes the limit applies to; empty means every node.
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
}

impl Limit {
    pub fn applies_to(&self, node_id: NodeId, resource_id: ResourceId) -> bool {
        self.resource_id == resource_id
            && (self.node_ids.is_empty() || self.node_ids.contains(&node_id))
    }
}
