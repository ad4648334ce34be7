use std::sync::Arc;
use std::time::Instant;

use crate::limits::*;
use crate::model::*;
use crate::observability::{CHECKS_TOTAL, CHECK_DURATION_SECONDS};

use super::availability::{schedule_periods, usage_segments};
use super::cache::ScheduleKey;
use super::conflict::{check_feasibility, validate_window};
use super::{Engine, EngineError};

impl Engine {
    /// Usage of one pair over `window`, tiled into constant-occupancy segments.
    pub async fn usage(
        &self,
        node_id: NodeId,
        resource_id: ResourceId,
        window: Span,
        exclude_task_id: Option<TaskId>,
    ) -> Result<Vec<UsageSegment>, EngineError> {
        validate_window(&window, self.options.max_query_window_ms)?;
        let state = self.get_pair_state(node_id, resource_id)?;
        let snap = state.read().await.snapshot(&window);
        usage_segments(&snap.capacity, &snap.allocations, &window, exclude_task_id)
    }

    /// Feasibility of a single allocation against current state.
    ///
    /// Advisory only: nothing is held after this returns. Use
    /// [`Engine::reserve_task`] to check and commit atomically.
    pub async fn check(
        &self,
        proposed: &Allocation,
        exclude_task_id: Option<TaskId>,
    ) -> Result<Verdict, EngineError> {
        validate_window(&proposed.window, MAX_SPAN_DURATION_MS)?;
        let started = Instant::now();
        let state = self.get_pair_state(proposed.node_id, proposed.resource_id)?;
        let snap = state.read().await.snapshot(&proposed.window);
        let verdict = check_feasibility(&snap.capacity, &snap.allocations, proposed, exclude_task_id)?;

        let label = if verdict.is_accept() { "accept" } else { "reject" };
        metrics::counter!(CHECKS_TOTAL, "verdict" => label).increment(1);
        metrics::histogram!(CHECK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        tracing::debug!(
            "check task {} on node {} resource {}: {label}",
            proposed.task_id,
            proposed.node_id,
            proposed.resource_id
        );
        Ok(verdict)
    }

    /// Calendar view of every pair over `window`, served from the schedule
    /// cache when nothing changed since it was computed.
    ///
    /// Pairs are snapshotted one after another, so the view is consistent per
    /// pair but not across pairs under concurrent writes.
    pub async fn resource_schedule(
        &self,
        window: Span,
        exclude_task_id: Option<TaskId>,
    ) -> Result<Arc<Vec<UsagePeriod>>, EngineError> {
        validate_window(&window, self.options.max_query_window_ms)?;
        let key = ScheduleKey {
            window,
            exclude_task_id,
        };
        let generation = self.generation();
        if let Some(periods) = self.cache.get(&key, generation) {
            return Ok(periods);
        }

        let keys = self.store.pair_keys();
        if keys.len() > MAX_PAIRS_PER_SCHEDULE {
            return Err(EngineError::LimitExceeded("too many node/resource pairs"));
        }
        let mut pairs = Vec::with_capacity(keys.len());
        for key in &keys {
            // Pair removed since the key listing: skip it
            let Some(state) = self.store.get_pair(key) else {
                continue;
            };
            let snap = state.read().await.snapshot(&window);
            pairs.push((snap.capacity, snap.allocations));
        }

        let periods = Arc::new(schedule_periods(&window, &pairs, exclude_task_id)?);
        self.cache.insert(key, generation, periods.clone());
        Ok(periods)
    }

    pub async fn capacity(
        &self,
        node_id: NodeId,
        resource_id: ResourceId,
    ) -> Result<ResourceCapacity, EngineError> {
        let state = self.get_pair_state(node_id, resource_id)?;
        let guard = state.read().await;
        Ok(guard.capacity)
    }

    pub async fn list_capacities(&self) -> Vec<ResourceCapacity> {
        let mut out = Vec::new();
        for key in self.store.pair_keys() {
            if let Some(state) = self.store.get_pair(&key) {
                out.push(state.read().await.capacity);
            }
        }
        out
    }

    /// Current allocations of a task, ordered by pair.
    pub async fn task_allocations(&self, task_id: TaskId) -> Vec<Allocation> {
        let mut out = Vec::new();
        for key in self.store.pairs_for_task(&task_id) {
            if let Some(state) = self.store.get_pair(&key) {
                let guard = state.read().await;
                out.extend(guard.allocations.iter().filter(|a| a.task_id == task_id).cloned());
            }
        }
        out
    }
}
