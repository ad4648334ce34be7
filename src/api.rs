//! JSON request/response shapes. Timestamps cross this boundary as RFC 3339
//! strings and become unix milliseconds inside.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, EngineError, EngineOptions, ResourceRequest};
use crate::groups::{resolve_for_group, resolve_for_user, GroupDirectory, InMemoryDirectory};
use crate::model::*;
use crate::quota::{applicable_limits, check_limits, LimitViolation};
use crate::units::{floor_base, to_base, Quantity, UnitKind};

pub fn parse_timestamp(value: &str) -> Result<Ms, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| EngineError::InvalidRequest(format!("invalid timestamp {value:?}: {e}")))
}

pub fn format_timestamp(ms: Ms) -> Result<String, EngineError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))
}

pub fn parse_window(start_time: &str, end_time: &str) -> Result<Span, EngineError> {
    Span::new(parse_timestamp(start_time)?, parse_timestamp(end_time)?)
}

// ── Requests ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub exclude_task_id: Option<TaskId>,
}

impl ScheduleRequest {
    pub fn window(&self) -> Result<Span, EngineError> {
        parse_window(&self.start_time, &self.end_time)
    }
}

/// A proposed allocation. `amount` is in base units unless `label` names a
/// display unit of `unit` (e.g. `1.5` with `"GiB"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub task_id: TaskId,
    pub owner_id: UserId,
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    pub amount: f64,
    #[serde(default)]
    pub unit: UnitKind,
    #[serde(default)]
    pub label: Option<String>,
    pub start_time: String,
    pub end_time: String,
    /// Task being edited; its current allocations are ignored.
    #[serde(default)]
    pub exclude_task_id: Option<TaskId>,
}

impl CheckRequest {
    pub fn to_allocation(&self) -> Result<Allocation, EngineError> {
        let amount = match &self.label {
            Some(label) => to_base(self.amount, label, self.unit),
            None => floor_base(self.amount),
        };
        Ok(Allocation {
            task_id: self.task_id,
            node_id: self.node_id,
            resource_id: self.resource_id,
            amount: Quantity::new(amount, self.unit),
            window: parse_window(&self.start_time, &self.end_time)?,
            owner_id: self.owner_id,
        })
    }
}

/// Exactly one of `user_id` and `group_id` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationsRequest {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub requests: Vec<ResourceRequest>,
}

// ── Responses ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSegmentDto {
    pub start_time: String,
    pub end_time: String,
    pub occupied: Quantity,
    /// Human readable occupied amount, e.g. `"1.5 GiB"`.
    pub display: String,
    pub user_ids: BTreeSet<UserId>,
}

impl TryFrom<&UsageSegment> for UsageSegmentDto {
    type Error = EngineError;

    fn try_from(seg: &UsageSegment) -> Result<Self, Self::Error> {
        Ok(Self {
            start_time: format_timestamp(seg.window.start)?,
            end_time: format_timestamp(seg.window.end)?,
            occupied: seg.occupied,
            display: seg.occupied.to_string(),
            user_ids: seg.user_ids.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictResponse {
    pub accepted: bool,
    pub conflicts: Vec<UsageSegmentDto>,
    pub occupying_users: BTreeSet<UserId>,
}

impl TryFrom<&Verdict> for VerdictResponse {
    type Error = EngineError;

    fn try_from(verdict: &Verdict) -> Result<Self, Self::Error> {
        Ok(Self {
            accepted: verdict.is_accept(),
            conflicts: verdict
                .conflicts()
                .iter()
                .map(UsageSegmentDto::try_from)
                .collect::<Result<_, _>>()?,
            occupying_users: verdict.occupying_users(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePeriodDto {
    pub start_time: String,
    pub end_time: String,
    pub resources: Vec<ResourceAvailability>,
}

impl TryFrom<&UsagePeriod> for UsagePeriodDto {
    type Error = EngineError;

    fn try_from(period: &UsagePeriod) -> Result<Self, Self::Error> {
        Ok(Self {
            start_time: format_timestamp(period.window.start)?,
            end_time: format_timestamp(period.window.end)?,
            resources: period.resources.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsResponse {
    pub applicable: Vec<Limit>,
    pub violations: Vec<LimitViolation>,
}

// ── State document ──────────────────────────────────────────────

/// An allocation with RFC 3339 window bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationDto {
    pub task_id: TaskId,
    pub owner_id: UserId,
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    pub amount: Quantity,
    pub start_time: String,
    pub end_time: String,
}

impl TryFrom<&AllocationDto> for Allocation {
    type Error = EngineError;

    fn try_from(dto: &AllocationDto) -> Result<Self, Self::Error> {
        Ok(Allocation {
            task_id: dto.task_id,
            node_id: dto.node_id,
            resource_id: dto.resource_id,
            amount: dto.amount.floored(),
            window: parse_window(&dto.start_time, &dto.end_time)?,
            owner_id: dto.owner_id,
        })
    }
}

/// Everything a single request is evaluated against.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub capacities: Vec<ResourceCapacity>,
    #[serde(default)]
    pub allocations: Vec<AllocationDto>,
    #[serde(default)]
    pub directory: InMemoryDirectory,
    #[serde(default)]
    pub limits: Vec<Limit>,
}

impl StateDocument {
    /// Engine holding the document's capacities and allocations.
    pub async fn build_engine(&self, options: EngineOptions) -> Result<Engine, EngineError> {
        let engine = Engine::new(options);
        for capacity in &self.capacities {
            engine
                .set_capacity(ResourceCapacity {
                    total: capacity.total.floored(),
                    ..*capacity
                })
                .await?;
        }
        let allocations = self
            .allocations
            .iter()
            .map(Allocation::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        engine.import_allocations(&allocations).await?;
        Ok(engine)
    }
}

/// A request together with the state it runs against.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<R> {
    #[serde(default)]
    pub state: StateDocument,
    pub request: R,
}

// ── Handlers ────────────────────────────────────────────────────

pub async fn schedule(
    engine: &Engine,
    request: &ScheduleRequest,
) -> Result<Vec<UsagePeriodDto>, EngineError> {
    let periods = engine
        .resource_schedule(request.window()?, request.exclude_task_id)
        .await?;
    periods.iter().map(UsagePeriodDto::try_from).collect()
}

pub async fn check(engine: &Engine, request: &CheckRequest) -> Result<VerdictResponse, EngineError> {
    let proposed = request.to_allocation()?;
    let verdict = engine.check(&proposed, request.exclude_task_id).await?;
    VerdictResponse::try_from(&verdict)
}

pub fn notifications<D: GroupDirectory + ?Sized>(
    directory: &D,
    request: &NotificationsRequest,
) -> Result<Vec<NotificationScope>, EngineError> {
    match (request.user_id, request.group_id) {
        (Some(user_id), None) => resolve_for_user(directory, user_id),
        (None, Some(group_id)) => resolve_for_group(directory, group_id),
        _ => Err(EngineError::InvalidRequest(
            "exactly one of user_id and group_id is required".into(),
        )),
    }
}

pub fn limits<D: GroupDirectory + ?Sized>(
    directory: &D,
    limits: &[Limit],
    request: &LimitsRequest,
) -> Result<LimitsResponse, EngineError> {
    let applicable = applicable_limits(directory, limits, request.user_id)?
        .into_iter()
        .cloned()
        .collect();
    let requests: Vec<ResourceRequest> = request
        .requests
        .iter()
        .map(|r| ResourceRequest {
            amount: r.amount.floored(),
            ..*r
        })
        .collect();
    let violations = check_limits(directory, limits, request.user_id, &requests)?;
    Ok(LimitsResponse {
        applicable,
        violations,
    })
}
