mod availability;
mod cache;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{coalesce_segments, group_by_pair, schedule_periods, usage_segments};
pub use cache::{ScheduleCache, ScheduleKey};
pub use conflict::check_feasibility;
pub use error::EngineError;
pub use mutations::{PairConflict, ReservationOutcome, ResourceRequest, TaskReservation};
pub use store::{
    check_from_source, InMemoryStore, PairSnapshot, PairState, SharedPairState, SnapshotSource,
};

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Number of schedules kept in the LRU cache.
    pub cache_capacity: usize,
    /// Widest window accepted by usage and schedule queries.
    pub max_query_window_ms: Ms,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 32,
            max_query_window_ms: MAX_QUERY_WINDOW_MS,
        }
    }
}

/// In-memory scheduling engine.
///
/// Reads (`usage`, `check`, `resource_schedule`) work on snapshots taken
/// under a per-pair read lock. `reserve_task` holds write locks on every
/// pair it touches from the feasibility check through the commit, so two
/// concurrent reservations can never both accept against the same state.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) cache: ScheduleCache,
    /// Bumped on every write; cached schedules from older generations are stale.
    generation: AtomicU64,
    pub(super) options: EngineOptions,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            store: InMemoryStore::new(),
            cache: ScheduleCache::new(options.cache_capacity),
            generation: AtomicU64::new(0),
            options,
        }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(super) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn get_pair_state(
        &self,
        node_id: NodeId,
        resource_id: ResourceId,
    ) -> Result<SharedPairState, EngineError> {
        self.store
            .get_pair(&(node_id, resource_id))
            .ok_or(EngineError::UnknownPair {
                node_id,
                resource_id,
            })
    }
}

#[async_trait]
impl SnapshotSource for Engine {
    async fn snapshot(
        &self,
        node_id: NodeId,
        resource_id: ResourceId,
        window: &Span,
    ) -> Result<PairSnapshot, EngineError> {
        self.store.snapshot(node_id, resource_id, window).await
    }
}
