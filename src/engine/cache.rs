use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::model::{Span, TaskId, UsagePeriod};
use crate::observability::SCHEDULE_CACHE_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleKey {
    pub window: Span,
    pub exclude_task_id: Option<TaskId>,
}

struct CachedSchedule {
    generation: u64,
    periods: Arc<Vec<UsagePeriod>>,
}

/// LRU of computed schedules keyed by `(window, exclude_task_id)`.
///
/// Entries remember the store generation they were computed at; any write
/// to the store bumps the generation, so a stale entry is dropped on lookup
/// instead of being served. A capacity of 1 gives a single-slot cache.
pub struct ScheduleCache {
    entries: Mutex<LruCache<ScheduleKey, CachedSchedule>>,
}

impl ScheduleCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, key: &ScheduleKey, generation: u64) -> Option<Arc<Vec<UsagePeriod>>> {
        let mut entries = self.entries.lock();
        let fresh = match entries.peek(key).map(|c| c.generation == generation) {
            Some(true) => entries.get(key).map(|c| c.periods.clone()),
            Some(false) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        let result = if fresh.is_some() { "hit" } else { "miss" };
        metrics::counter!(SCHEDULE_CACHE_TOTAL, "result" => result).increment(1);
        fresh
    }

    pub fn insert(&self, key: ScheduleKey, generation: u64, periods: Arc<Vec<UsagePeriod>>) {
        self.entries
            .lock()
            .put(key, CachedSchedule { generation, periods });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
