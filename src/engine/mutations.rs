use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::groups::GroupDirectory;
use crate::limits::*;
use crate::model::*;
use crate::observability::RESERVATIONS_TOTAL;
use crate::quota::{check_limits, LimitViolation};
use crate::units::Quantity;

use super::availability::group_by_pair;
use super::conflict::{check_feasibility, validate_window};
use super::store::PairState;
use super::{Engine, EngineError};

/// One resource a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    pub amount: Quantity,
}

/// The complete set of allocations a task should hold after the call.
/// Whatever the task held before is replaced, not merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReservation {
    pub task_id: TaskId,
    pub owner_id: UserId,
    pub window: Span,
    pub requests: Vec<ResourceRequest>,
}

impl TaskReservation {
    /// Requests with fractional base units dropped.
    fn floored(mut self) -> Self {
        for request in &mut self.requests {
            request.amount = request.amount.floored();
        }
        self
    }

    fn allocation_for(&self, request: &ResourceRequest) -> Allocation {
        Allocation {
            task_id: self.task_id,
            node_id: request.node_id,
            resource_id: request.resource_id,
            amount: request.amount,
            window: self.window,
            owner_id: self.owner_id,
        }
    }
}

/// Conflicting segments on one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConflict {
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    pub segments: Vec<UsageSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReservationOutcome {
    Committed { allocations: Vec<Allocation> },
    Rejected { conflicts: Vec<PairConflict> },
    LimitViolated { violations: Vec<LimitViolation> },
}

impl ReservationOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ReservationOutcome::Committed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            ReservationOutcome::Committed { .. } => "committed",
            ReservationOutcome::Rejected { .. } => "rejected",
            ReservationOutcome::LimitViolated { .. } => "limit_violated",
        }
    }
}

impl Engine {
    /// Define or replace how much of a resource a node provides.
    ///
    /// Shrinking below current usage is allowed: existing bookings stay, new
    /// ones are rejected until usage drops. Changing the unit kind is refused
    /// while allocations exist, since their amounts would change meaning.
    pub async fn set_capacity(&self, capacity: ResourceCapacity) -> Result<(), EngineError> {
        if capacity.total.amount < 0.0 || capacity.total.amount.is_nan() {
            return Err(EngineError::InvalidRequest(format!(
                "capacity must be non-negative, got {}",
                capacity.total.amount
            )));
        }
        let key = capacity.pair();
        loop {
            let (state, created) = self
                .store
                .get_or_insert_pair(key, || PairState::new(capacity));
            if created {
                break;
            }
            let mut guard = state.write().await;
            // Removed while we waited; the next lookup creates a fresh pair.
            if guard.retired {
                continue;
            }
            if let Some(existing) = guard.allocations.first() {
                capacity.total.ensure_same_unit(&existing.amount)?;
            }
            guard.capacity = capacity;
            break;
        }
        self.bump_generation();
        tracing::info!(
            "node {} resource {} capacity set to {}",
            capacity.node_id,
            capacity.resource_id,
            capacity.total
        );
        Ok(())
    }

    pub async fn remove_capacity(
        &self,
        node_id: NodeId,
        resource_id: ResourceId,
    ) -> Result<(), EngineError> {
        let state = self.get_pair_state(node_id, resource_id)?;
        let mut guard = state.write().await;
        if guard.retired {
            return Err(EngineError::UnknownPair {
                node_id,
                resource_id,
            });
        }
        if !guard.allocations.is_empty() {
            return Err(EngineError::HasAllocations {
                node_id,
                resource_id,
            });
        }
        guard.retired = true;
        self.store.remove_pair(&(node_id, resource_id));
        drop(guard);
        self.bump_generation();
        tracing::info!("node {node_id} resource {resource_id} removed");
        Ok(())
    }

    /// Check and commit every allocation of a task in one step. All-or-nothing:
    /// if any request does not fit, nothing changes.
    ///
    /// Calls for the same task are serialised, so the set of pairs the task
    /// holds cannot change between reading it and committing. Write locks on
    /// every touched pair are then taken in sorted order (no deadlocks between
    /// overlapping reservations) and held from the check through the commit.
    /// The task's previous allocations are excluded from the check and
    /// replaced on success; a zero-amount request just clears the task from
    /// that pair. Fractional base amounts are floored first.
    pub async fn reserve_task(
        &self,
        reservation: TaskReservation,
    ) -> Result<ReservationOutcome, EngineError> {
        validate_window(&reservation.window, MAX_SPAN_DURATION_MS)?;
        if reservation.requests.len() > MAX_REQUESTS_PER_TASK {
            return Err(EngineError::LimitExceeded("too many resource requests"));
        }
        let reservation = reservation.floored();
        let task_id = reservation.task_id;

        let mut requested: BTreeMap<PairKey, ResourceRequest> = BTreeMap::new();
        for request in &reservation.requests {
            let key = (request.node_id, request.resource_id);
            if requested.insert(key, *request).is_some() {
                return Err(EngineError::InvalidRequest(format!(
                    "resource {} on node {} requested twice",
                    request.resource_id, request.node_id
                )));
            }
        }

        let task_guard = self.store.lock_task(task_id).await;
        let result = self.replace_task(&reservation, &requested).await;
        self.store.unlock_task(task_id, task_guard);

        let outcome = result?;
        metrics::counter!(RESERVATIONS_TOTAL, "status" => outcome.label()).increment(1);
        match &outcome {
            ReservationOutcome::Committed { .. } => {
                tracing::info!("task {task_id} reserved on {} pair(s)", requested.len())
            }
            _ => tracing::info!("task {task_id} rejected: capacity exceeded"),
        }
        Ok(outcome)
    }

    /// Body of [`Engine::reserve_task`]; the caller holds the task lock.
    async fn replace_task(
        &self,
        reservation: &TaskReservation,
        requested: &BTreeMap<PairKey, ResourceRequest>,
    ) -> Result<ReservationOutcome, EngineError> {
        let task_id = reservation.task_id;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut lock_keys: BTreeSet<PairKey> = self.store.pairs_for_task(&task_id);
        lock_keys.extend(requested.keys().copied());

        let mut guards = BTreeMap::new();
        for key in &lock_keys {
            let guard = match self.store.get_pair(key) {
                Some(state) => Some(state.write_owned().await).filter(|g| !g.retired),
                None => None,
            };
            match guard {
                Some(guard) => {
                    guards.insert(*key, guard);
                }
                None if requested.contains_key(key) => {
                    return Err(EngineError::UnknownPair {
                        node_id: key.0,
                        resource_id: key.1,
                    });
                }
                // Stale index entry for a pair that no longer exists
                None => {}
            }
        }

        // Phase 1: validate every request against the locked state.
        let mut conflicts = Vec::new();
        for (key, request) in requested {
            let guard = &guards[key];
            let proposed = reservation.allocation_for(request);
            let current: Vec<Allocation> = guard.overlapping(&proposed.window).cloned().collect();
            if guard.allocations.len() >= MAX_ALLOCATIONS_PER_PAIR && !guard.has_task(task_id) {
                return Err(EngineError::LimitExceeded("too many allocations on pair"));
            }
            if let Verdict::Reject { conflicts: segments } =
                check_feasibility(&guard.capacity, &current, &proposed, Some(task_id))?
            {
                conflicts.push(PairConflict {
                    node_id: key.0,
                    resource_id: key.1,
                    segments,
                });
            }
        }
        if !conflicts.is_empty() {
            return Ok(ReservationOutcome::Rejected { conflicts });
        }

        // Phase 2: all validated, replace the task's allocations.
        let mut committed = Vec::new();
        for (key, guard) in guards.iter_mut() {
            guard.remove_task(task_id);
            match requested.get(key) {
                Some(request) if request.amount.amount > 0.0 => {
                    let allocation = reservation.allocation_for(request);
                    guard.insert_allocation(allocation.clone());
                    committed.push(allocation);
                    self.store.map_task(task_id, *key);
                }
                _ => self.store.unmap_task(&task_id, key),
            }
        }
        self.bump_generation();
        Ok(ReservationOutcome::Committed {
            allocations: committed,
        })
    }

    /// [`Engine::reserve_task`] preceded by the owner's limit check. Limits are
    /// evaluated before any lock is taken; a violation commits nothing.
    pub async fn reserve_task_with_limits<D: GroupDirectory + ?Sized>(
        &self,
        reservation: TaskReservation,
        directory: &D,
        limits: &[Limit],
    ) -> Result<ReservationOutcome, EngineError> {
        let reservation = reservation.floored();
        let violations = check_limits(directory, limits, reservation.owner_id, &reservation.requests)?;
        if !violations.is_empty() {
            let outcome = ReservationOutcome::LimitViolated { violations };
            metrics::counter!(RESERVATIONS_TOTAL, "status" => outcome.label()).increment(1);
            tracing::info!("task {} rejected: limit exceeded", reservation.task_id);
            return Ok(outcome);
        }
        self.reserve_task(reservation).await
    }

    /// Load existing allocations without a feasibility check, e.g. when
    /// restoring state that was accepted earlier. Pairs must exist and units
    /// must match; zero amounts are skipped. Returns how many were stored.
    ///
    /// All-or-nothing: every touched task and pair is locked up front and
    /// nothing is written unless the whole batch validates. Overcommitted
    /// input is kept as is and shows up in usage queries.
    pub async fn import_allocations(&self, allocations: &[Allocation]) -> Result<usize, EngineError> {
        for allocation in allocations {
            validate_window(&allocation.window, MAX_SPAN_DURATION_MS)?;
            if allocation.amount.amount < 0.0 || allocation.amount.amount.is_nan() {
                return Err(EngineError::InvalidRequest(format!(
                    "allocation of task {} has invalid amount {}",
                    allocation.task_id, allocation.amount.amount
                )));
            }
        }
        let grouped = group_by_pair(allocations);

        // Task locks before pair locks, both in sorted order.
        let task_ids: BTreeSet<TaskId> = allocations.iter().map(|a| a.task_id).collect();
        let mut task_guards = Vec::with_capacity(task_ids.len());
        for task_id in &task_ids {
            task_guards.push((*task_id, self.store.lock_task(*task_id).await));
        }
        let result = self.import_locked(grouped).await;
        for (task_id, guard) in task_guards {
            self.store.unlock_task(task_id, guard);
        }

        let stored = result?;
        tracing::info!("imported {stored} allocation(s)");
        Ok(stored)
    }

    async fn import_locked(
        &self,
        grouped: BTreeMap<PairKey, Vec<Allocation>>,
    ) -> Result<usize, EngineError> {
        let mut guards = BTreeMap::new();
        for key in grouped.keys() {
            let unknown = || EngineError::UnknownPair {
                node_id: key.0,
                resource_id: key.1,
            };
            let state = self.store.get_pair(key).ok_or_else(unknown)?;
            let guard = state.write_owned().await;
            if guard.retired {
                return Err(unknown());
            }
            guards.insert(*key, guard);
        }

        for (key, allocations) in &grouped {
            let guard = &guards[key];
            for allocation in allocations {
                guard.capacity.total.ensure_same_unit(&allocation.amount)?;
            }
            if guard.allocations.len() + allocations.len() > MAX_ALLOCATIONS_PER_PAIR {
                return Err(EngineError::LimitExceeded("too many allocations on pair"));
            }
        }

        let mut stored = 0;
        for (key, allocations) in grouped {
            let guard = guards.get_mut(&key).ok_or(EngineError::UnknownPair {
                node_id: key.0,
                resource_id: key.1,
            })?;
            for allocation in allocations.into_iter().filter(|a| a.amount.amount > 0.0) {
                self.store.map_task(allocation.task_id, key);
                guard.insert_allocation(allocation);
                stored += 1;
            }
        }
        self.bump_generation();
        Ok(stored)
    }

    /// Remove every allocation of a task. Returns how many were removed.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<usize, EngineError> {
        let task_guard = self.store.lock_task(task_id).await;
        let keys = self.store.pairs_for_task(&task_id);
        let mut removed = 0;
        for key in &keys {
            if let Some(state) = self.store.get_pair(key) {
                removed += state.write().await.remove_task(task_id);
            }
            self.store.unmap_task(&task_id, key);
        }
        self.store.unlock_task(task_id, task_guard);

        if keys.is_empty() {
            return Err(EngineError::UnknownTask(task_id));
        }
        self.bump_generation();
        tracing::info!("task {task_id} cancelled, {removed} allocation(s) released");
        Ok(removed)
    }
}
