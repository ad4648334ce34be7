use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::model::*;

use super::conflict::check_feasibility;
use super::EngineError;

pub type SharedPairState = Arc<RwLock<PairState>>;

/// Live state of one node/resource pair.
#[derive(Debug, Clone)]
pub struct PairState {
    pub capacity: ResourceCapacity,
    /// Sorted by `window.start`.
    pub allocations: Vec<Allocation>,
    /// Set when the pair is removed; writers that raced the removal and
    /// still hold the old state must not commit into it.
    pub retired: bool,
}

impl PairState {
    pub fn new(capacity: ResourceCapacity) -> Self {
        Self {
            capacity,
            allocations: Vec::new(),
            retired: false,
        }
    }

    /// Insert allocation maintaining sort order by window.start.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&allocation.window.start, |a| a.window.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    /// Drop every allocation of `task_id`, returning how many were removed.
    pub fn remove_task(&mut self, task_id: TaskId) -> usize {
        let before = self.allocations.len();
        self.allocations.retain(|a| a.task_id != task_id);
        before - self.allocations.len()
    }

    pub fn has_task(&self, task_id: TaskId) -> bool {
        self.allocations.iter().any(|a| a.task_id == task_id)
    }

    /// Return only allocations whose window overlaps the query window.
    /// Uses binary search to skip allocations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.window.start < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.window.end > query.start)
    }

    /// Owned copy of everything relevant to `query`.
    pub fn snapshot(&self, query: &Span) -> PairSnapshot {
        PairSnapshot {
            capacity: self.capacity,
            allocations: self.overlapping(query).cloned().collect(),
        }
    }
}

/// Immutable view of a pair handed to the pure aggregator and checker.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSnapshot {
    pub capacity: ResourceCapacity,
    pub allocations: Vec<Allocation>,
}

/// Repository seam for persistence layers: load a snapshot of one pair,
/// restricted to allocations overlapping `window`.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(
        &self,
        node_id: NodeId,
        resource_id: ResourceId,
        window: &Span,
    ) -> Result<PairSnapshot, EngineError>;
}

/// Feasibility check against any snapshot source.
///
/// Reads only. The caller owns the transaction or lock that must span this
/// check and the write that follows an `Accept`.
pub async fn check_from_source<S: SnapshotSource + ?Sized>(
    source: &S,
    proposed: &Allocation,
    exclude_task_id: Option<TaskId>,
) -> Result<Verdict, EngineError> {
    let snap = source
        .snapshot(proposed.node_id, proposed.resource_id, &proposed.window)
        .await?;
    check_feasibility(&snap.capacity, &snap.allocations, proposed, exclude_task_id)
}

pub struct InMemoryStore {
    pairs: DashMap<PairKey, SharedPairState>,
    task_to_pairs: DashMap<TaskId, BTreeSet<PairKey>>,
    /// Held by whoever is rewriting a task, from the index read to the commit.
    task_locks: DashMap<TaskId, Arc<Mutex<()>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            pairs: DashMap::new(),
            task_to_pairs: DashMap::new(),
            task_locks: DashMap::new(),
        }
    }

    // ── Pair CRUD ────────────────────────────────────────────

    pub fn get_pair(&self, key: &PairKey) -> Option<SharedPairState> {
        self.pairs.get(key).map(|e| e.value().clone())
    }

    /// The pair's state, built from `make` when the pair does not exist yet.
    /// The flag tells whether this call created it. Creation happens under
    /// the map's shard lock, so concurrent callers share one state.
    pub fn get_or_insert_pair(
        &self,
        key: PairKey,
        make: impl FnOnce() -> PairState,
    ) -> (SharedPairState, bool) {
        let mut created = false;
        let state = self
            .pairs
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Arc::new(RwLock::new(make()))
            })
            .value()
            .clone();
        (state, created)
    }

    pub fn remove_pair(&self, key: &PairKey) -> Option<(PairKey, SharedPairState)> {
        self.pairs.remove(key)
    }

    /// All pair keys, sorted. Sorted order is also the lock order.
    pub fn pair_keys(&self) -> Vec<PairKey> {
        let mut keys: Vec<PairKey> = self.pairs.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        keys
    }

    // ── Task index ───────────────────────────────────────────

    pub fn pairs_for_task(&self, task_id: &TaskId) -> BTreeSet<PairKey> {
        self.task_to_pairs
            .get(task_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn map_task(&self, task_id: TaskId, key: PairKey) {
        self.task_to_pairs.entry(task_id).or_default().insert(key);
    }

    pub fn unmap_task(&self, task_id: &TaskId, key: &PairKey) {
        let now_empty = self.task_to_pairs.get_mut(task_id).is_some_and(|mut pairs| {
            pairs.remove(key);
            pairs.is_empty()
        });
        if now_empty {
            self.task_to_pairs.remove_if(task_id, |_, pairs| pairs.is_empty());
        }
    }

    // ── Task locks ───────────────────────────────────────────

    /// Exclusive right to rewrite `task_id`. Taken before any pair lock.
    pub async fn lock_task(&self, task_id: TaskId) -> OwnedMutexGuard<()> {
        let lock = self.task_locks.entry(task_id).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Release a guard from [`InMemoryStore::lock_task`]. The entry is dropped
    /// once nobody else holds or waits on it.
    pub fn unlock_task(&self, task_id: TaskId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.task_locks
            .remove_if(&task_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[async_trait]
impl SnapshotSource for InMemoryStore {
    async fn snapshot(
        &self,
        node_id: NodeId,
        resource_id: ResourceId,
        window: &Span,
    ) -> Result<PairSnapshot, EngineError> {
        let state = self
            .get_pair(&(node_id, resource_id))
            .ok_or(EngineError::UnknownPair {
                node_id,
                resource_id,
            })?;
        let guard = state.read().await;
        Ok(guard.snapshot(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{Quantity, UnitKind};

    fn capacity(total: f64) -> ResourceCapacity {
        ResourceCapacity {
            node_id: 1,
            resource_id: 7,
            total: Quantity::new(total, UnitKind::None),
        }
    }

    fn alloc(task_id: TaskId, start: Ms, end: Ms) -> Allocation {
        Allocation {
            task_id,
            node_id: 1,
            resource_id: 7,
            amount: Quantity::new(1.0, UnitKind::None),
            window: Span::new(start, end).unwrap(),
            owner_id: 100,
        }
    }

    #[test]
    fn allocations_kept_sorted() {
        let mut ps = PairState::new(capacity(4.0));
        ps.insert_allocation(alloc(1, 300, 400));
        ps.insert_allocation(alloc(2, 100, 200));
        ps.insert_allocation(alloc(3, 200, 300));
        let starts: Vec<Ms> = ps.allocations.iter().map(|a| a.window.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_task_drops_all_of_its_allocations() {
        let mut ps = PairState::new(capacity(4.0));
        ps.insert_allocation(alloc(1, 100, 200));
        ps.insert_allocation(alloc(2, 150, 250));
        ps.insert_allocation(alloc(1, 300, 400));
        assert_eq!(ps.remove_task(1), 2);
        assert!(!ps.has_task(1));
        assert!(ps.has_task(2));
        assert_eq!(ps.remove_task(42), 0);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ps = PairState::new(capacity(4.0));
        ps.insert_allocation(alloc(1, 100, 200));
        ps.insert_allocation(alloc(2, 450, 600));
        ps.insert_allocation(alloc(3, 1000, 1100));
        let query = Span::new(500, 800).unwrap();
        let hits: Vec<TaskId> = ps.overlapping(&query).map(|a| a.task_id).collect();
        assert_eq!(hits, vec![2]);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ps = PairState::new(capacity(4.0));
        ps.insert_allocation(alloc(1, 100, 200));
        let query = Span::new(200, 300).unwrap();
        assert_eq!(ps.overlapping(&query).count(), 0);
    }

    #[test]
    fn task_index_cleans_up() {
        let store = InMemoryStore::new();
        store.map_task(1, (1, 7));
        store.map_task(1, (2, 7));
        assert_eq!(store.pairs_for_task(&1).len(), 2);
        store.unmap_task(&1, &(1, 7));
        store.unmap_task(&1, &(2, 7));
        assert!(store.pairs_for_task(&1).is_empty());
        // Unknown task is a no-op
        store.unmap_task(&9, &(1, 7));
    }

    #[test]
    fn pair_keys_sorted() {
        let store = InMemoryStore::new();
        for key in [(2, 1), (1, 9), (1, 2)] {
            let mut cap = capacity(1.0);
            (cap.node_id, cap.resource_id) = key;
            store.get_or_insert_pair(key, || PairState::new(cap));
        }
        assert_eq!(store.pair_keys(), vec![(1, 2), (1, 9), (2, 1)]);
    }

    #[tokio::test]
    async fn existing_pair_is_never_replaced() {
        let store = InMemoryStore::new();
        let (first, created) = store.get_or_insert_pair((1, 7), || PairState::new(capacity(2.0)));
        assert!(created);
        first.write().await.insert_allocation(alloc(1, 0, 100));

        let (second, created) = store.get_or_insert_pair((1, 7), || PairState::new(capacity(9.0)));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.read().await.allocations.len(), 1);
        assert_eq!(second.read().await.capacity.total.amount, 2.0);
    }

    #[tokio::test]
    async fn task_lock_is_exclusive_and_cleaned_up() {
        let store = InMemoryStore::new();
        let guard = store.lock_task(1).await;
        let lock = store.task_locks.get(&1).unwrap().value().clone();
        assert!(lock.try_lock().is_err());
        drop(lock);
        // Other tasks are independent
        let other = store.lock_task(2).await;
        store.unlock_task(2, other);

        store.unlock_task(1, guard);
        assert!(store.task_locks.is_empty());
    }

    #[tokio::test]
    async fn snapshot_of_unknown_pair_fails() {
        let store = InMemoryStore::new();
        let result = store.snapshot(1, 7, &Span::new(0, 10).unwrap()).await;
        assert!(matches!(result, Err(EngineError::UnknownPair { .. })));
    }

    #[tokio::test]
    async fn snapshot_is_detached_copy() {
        let store = InMemoryStore::new();
        let (state, _) = store.get_or_insert_pair((1, 7), || PairState::new(capacity(2.0)));
        state.write().await.insert_allocation(alloc(1, 0, 100));

        let window = Span::new(0, 100).unwrap();
        let snap = store.snapshot(1, 7, &window).await.unwrap();
        state.write().await.insert_allocation(alloc(2, 0, 100));

        assert_eq!(snap.allocations.len(), 1);
        assert_eq!(store.snapshot(1, 7, &window).await.unwrap().allocations.len(), 2);
    }

    #[tokio::test]
    async fn check_from_any_source() {
        let store = InMemoryStore::new();
        let (state, _) = store.get_or_insert_pair((1, 7), || PairState::new(capacity(1.0)));
        state.write().await.insert_allocation(alloc(1, 0, 100));

        let verdict = check_from_source(&store, &alloc(2, 50, 150), None).await.unwrap();
        assert!(!verdict.is_accept());
        let verdict = check_from_source(&store, &alloc(1, 50, 150), Some(1)).await.unwrap();
        assert!(verdict.is_accept());
    }
}
