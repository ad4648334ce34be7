use std::collections::{BTreeMap, BTreeSet};

use crate::model::*;
use crate::units::Quantity;

use super::EngineError;

// ── Availability Algorithm ────────────────────────────────────────

/// An allocation that counts against a query, clamped to the query window.
struct ActiveAlloc {
    span: Span,
    amount: f64,
    owner: UserId,
}

/// Keep allocations of the capacity's pair that overlap `query`, minus the
/// excluded task. Zero amounts occupy nothing and are dropped.
fn active_allocations(
    capacity: &ResourceCapacity,
    allocations: &[Allocation],
    query: &Span,
    exclude_task_id: Option<TaskId>,
) -> Result<Vec<ActiveAlloc>, EngineError> {
    let mut active = Vec::new();
    for alloc in allocations {
        if alloc.pair() != capacity.pair() || Some(alloc.task_id) == exclude_task_id {
            continue;
        }
        capacity.total.ensure_same_unit(&alloc.amount)?;
        if alloc.amount.amount <= 0.0 {
            continue;
        }
        if let Some(span) = alloc.window.intersect(query) {
            active.push(ActiveAlloc {
                span,
                amount: alloc.amount.amount,
                owner: alloc.owner_id,
            });
        }
    }
    Ok(active)
}

/// Partition `query` into consecutive segments where the set of running
/// allocations does not change.
///
/// Sweep line over allocation endpoints: boundaries are the query ends plus
/// every clamped allocation endpoint, sorted and deduplicated. The returned
/// segments tile `query` exactly, in order, without gaps or overlaps.
/// Segments with nothing running are included with a zero amount.
pub fn usage_segments(
    capacity: &ResourceCapacity,
    allocations: &[Allocation],
    query: &Span,
    exclude_task_id: Option<TaskId>,
) -> Result<Vec<UsageSegment>, EngineError> {
    let unit = capacity.total.unit;
    let active = active_allocations(capacity, allocations, query, exclude_task_id)?;

    let mut bounds: Vec<Ms> = Vec::with_capacity(active.len() * 2 + 2);
    bounds.push(query.start);
    bounds.push(query.end);
    // (time, is_start, index); ends sort before starts at the same instant
    let mut events: Vec<(Ms, bool, usize)> = Vec::with_capacity(active.len() * 2);
    for (i, a) in active.iter().enumerate() {
        bounds.push(a.span.start);
        bounds.push(a.span.end);
        events.push((a.span.start, true, i));
        events.push((a.span.end, false, i));
    }
    bounds.sort_unstable();
    bounds.dedup();
    events.sort_unstable_by_key(|&(t, is_start, _)| (t, is_start));

    let mut live: BTreeSet<usize> = BTreeSet::new();
    let mut next_event = 0;
    let mut segments = Vec::with_capacity(bounds.len() - 1);

    for pair in bounds.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        while next_event < events.len() && events[next_event].0 <= from {
            let (_, is_start, idx) = events[next_event];
            if is_start {
                live.insert(idx);
            } else {
                live.remove(&idx);
            }
            next_event += 1;
        }

        // Summed from the live set rather than a running total so that
        // fractional amounts never leave residue in idle segments.
        let occupied = live.iter().fold(0.0, |acc, &i| acc + active[i].amount);
        let user_ids = live.iter().map(|&i| active[i].owner).collect();
        segments.push(UsageSegment {
            window: Span::between(from, to),
            occupied: Quantity::new(occupied, unit),
            user_ids,
        });
    }

    Ok(segments)
}

/// Merge neighbouring segments whose occupancy is identical.
pub fn coalesce_segments(segments: Vec<UsageSegment>) -> Vec<UsageSegment> {
    let mut merged: Vec<UsageSegment> = Vec::with_capacity(segments.len());
    for seg in segments {
        if let Some(last) = merged.last_mut()
            && last.window.end == seg.window.start
            && last.occupied == seg.occupied
            && last.user_ids == seg.user_ids {
                last.window.end = seg.window.end;
                continue;
            }
        merged.push(seg);
    }
    merged
}

/// Calendar view across many node/resource pairs: the query window cut at
/// every point where usage of any pair changes.
///
/// Each pair contributes its own tiling from [`usage_segments`]; the union
/// of all segment boundaries defines the periods. Free capacity never goes
/// below zero in the view, even if an administrator shrank a capacity under
/// existing bookings.
pub fn schedule_periods(
    query: &Span,
    pairs: &[(ResourceCapacity, Vec<Allocation>)],
    exclude_task_id: Option<TaskId>,
) -> Result<Vec<UsagePeriod>, EngineError> {
    let mut per_pair = Vec::with_capacity(pairs.len());
    let mut bounds: Vec<Ms> = vec![query.start, query.end];
    for (capacity, allocations) in pairs {
        let segments = coalesce_segments(usage_segments(
            capacity,
            allocations,
            query,
            exclude_task_id,
        )?);
        bounds.extend(segments.iter().map(|s| s.window.start));
        per_pair.push((capacity, segments));
    }
    bounds.sort_unstable();
    bounds.dedup();

    let mut cursors = vec![0usize; per_pair.len()];
    let mut periods: Vec<UsagePeriod> = Vec::with_capacity(bounds.len() - 1);

    for pair in bounds.windows(2) {
        let window = Span::between(pair[0], pair[1]);
        let mut resources = Vec::with_capacity(per_pair.len());
        for ((capacity, segments), cursor) in per_pair.iter().zip(cursors.iter_mut()) {
            while segments[*cursor].window.end <= window.start {
                *cursor += 1;
            }
            let seg = &segments[*cursor];
            let total = capacity.total;
            resources.push(ResourceAvailability {
                node_id: capacity.node_id,
                resource_id: capacity.resource_id,
                used: seg.occupied,
                free: Quantity::new((total.amount - seg.occupied.amount).max(0.0), total.unit),
                user_ids: seg.user_ids.clone(),
            });
        }

        if let Some(last) = periods.last_mut()
            && last.resources == resources {
                last.window.end = window.end;
                continue;
            }
        periods.push(UsagePeriod { window, resources });
    }

    Ok(periods)
}

/// Collect the groups of allocations keyed by pair, in pair order.
pub fn group_by_pair(allocations: &[Allocation]) -> BTreeMap<PairKey, Vec<Allocation>> {
    let mut grouped: BTreeMap<PairKey, Vec<Allocation>> = BTreeMap::new();
    for alloc in allocations {
        grouped.entry(alloc.pair()).or_default().push(alloc.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitKind;

    const H: Ms = 3_600_000;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end).unwrap()
    }

    fn capacity(total: f64) -> ResourceCapacity {
        ResourceCapacity {
            node_id: 1,
            resource_id: 7,
            total: Quantity::new(total, UnitKind::None),
        }
    }

    fn alloc(task_id: TaskId, owner_id: UserId, amount: f64, start: Ms, end: Ms) -> Allocation {
        Allocation {
            task_id,
            node_id: 1,
            resource_id: 7,
            amount: Quantity::new(amount, UnitKind::None),
            window: span(start, end),
            owner_id,
        }
    }

    fn assert_tiles(segments: &[UsageSegment], query: &Span) {
        assert_eq!(segments.first().unwrap().window.start, query.start);
        assert_eq!(segments.last().unwrap().window.end, query.end);
        for w in segments.windows(2) {
            assert_eq!(w[0].window.end, w[1].window.start);
        }
        let total: Ms = segments.iter().map(|s| s.window.duration_ms()).sum();
        assert_eq!(total, query.duration_ms());
    }

    // ── usage_segments ────────────────────────────────────

    #[test]
    fn no_allocations_single_idle_segment() {
        let query = span(0, 24 * H);
        let segs = usage_segments(&capacity(10.0), &[], &query, None).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].window, query);
        assert_eq!(segs[0].occupied.amount, 0.0);
        assert!(segs[0].user_ids.is_empty());
    }

    #[test]
    fn overlapping_allocations_split_window() {
        let allocs = vec![alloc(1, 100, 6.0, 10 * H, 12 * H), alloc(2, 200, 3.0, 11 * H, 13 * H)];
        let query = span(9 * H, 14 * H);
        let segs = usage_segments(&capacity(10.0), &allocs, &query, None).unwrap();
        assert_tiles(&segs, &query);

        let summary: Vec<(Span, f64, Vec<UserId>)> = segs
            .iter()
            .map(|s| (s.window, s.occupied.amount, s.user_ids.iter().copied().collect()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (span(9 * H, 10 * H), 0.0, vec![]),
                (span(10 * H, 11 * H), 6.0, vec![100]),
                (span(11 * H, 12 * H), 9.0, vec![100, 200]),
                (span(12 * H, 13 * H), 3.0, vec![200]),
                (span(13 * H, 14 * H), 0.0, vec![]),
            ]
        );
    }

    #[test]
    fn allocations_clamped_to_query() {
        let allocs = vec![alloc(1, 100, 4.0, 0, 20 * H)];
        let query = span(10 * H, 11 * H);
        let segs = usage_segments(&capacity(10.0), &allocs, &query, None).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].window, query);
        assert_eq!(segs[0].occupied.amount, 4.0);
    }

    #[test]
    fn adjacent_allocation_does_not_leak() {
        // Ends exactly at query start: half-open, so not running
        let allocs = vec![alloc(1, 100, 4.0, 8 * H, 10 * H)];
        let query = span(10 * H, 11 * H);
        let segs = usage_segments(&capacity(10.0), &allocs, &query, None).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].occupied.amount, 0.0);
    }

    #[test]
    fn back_to_back_allocations_same_boundary() {
        let allocs = vec![alloc(1, 100, 2.0, 0, 5 * H), alloc(2, 200, 3.0, 5 * H, 10 * H)];
        let query = span(0, 10 * H);
        let segs = usage_segments(&capacity(10.0), &allocs, &query, None).unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].occupied.amount, 2.0);
        assert_eq!(segs[1].occupied.amount, 3.0);
        assert_eq!(segs[1].user_ids, BTreeSet::from([200]));
    }

    #[test]
    fn excluded_task_is_invisible() {
        let allocs = vec![alloc(1, 100, 6.0, 0, 24 * H), alloc(2, 200, 1.0, 5 * H, 6 * H)];
        let query = span(4 * H, 8 * H);
        let segs = usage_segments(&capacity(10.0), &allocs, &query, Some(1)).unwrap();
        assert_tiles(&segs, &query);
        assert!(segs.iter().all(|s| !s.user_ids.contains(&100)));
        assert_eq!(segs.iter().map(|s| s.occupied.amount).fold(0.0, f64::max), 1.0);
    }

    #[test]
    fn other_pairs_ignored() {
        let mut foreign = alloc(1, 100, 6.0, 0, 24 * H);
        foreign.resource_id = 8;
        let query = span(0, 24 * H);
        let segs = usage_segments(&capacity(10.0), &[foreign], &query, None).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].occupied.amount, 0.0);
    }

    #[test]
    fn same_user_twice_counted_once_in_users() {
        let allocs = vec![alloc(1, 100, 1.0, 0, 10 * H), alloc(2, 100, 2.0, 0, 10 * H)];
        let query = span(0, 10 * H);
        let segs = usage_segments(&capacity(10.0), &allocs, &query, None).unwrap();
        assert_eq!(segs[0].occupied.amount, 3.0);
        assert_eq!(segs[0].user_ids, BTreeSet::from([100]));
    }

    #[test]
    fn zero_amount_allocation_occupies_nothing() {
        let allocs = vec![alloc(1, 100, 0.0, 0, 10 * H)];
        let query = span(0, 10 * H);
        let segs = usage_segments(&capacity(10.0), &allocs, &query, None).unwrap();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].user_ids.is_empty());
    }

    #[test]
    fn unit_mismatch_is_an_error() {
        let mut a = alloc(1, 100, 1024.0, 0, 10 * H);
        a.amount.unit = UnitKind::BytesIec;
        let result = usage_segments(&capacity(10.0), &[a], &span(0, 10 * H), None);
        assert!(matches!(result, Err(EngineError::UnitMismatch { .. })));
    }

    #[test]
    fn fractional_amounts_leave_no_residue() {
        let allocs = vec![
            alloc(1, 100, 0.1, 0, 2 * H),
            alloc(2, 200, 0.2, H, 3 * H),
        ];
        let query = span(0, 4 * H);
        let segs = usage_segments(&capacity(1.0), &allocs, &query, None).unwrap();
        assert_eq!(segs.last().unwrap().occupied.amount, 0.0);
    }

    // ── coalesce_segments ────────────────────────────────

    #[test]
    fn coalesce_merges_identical_neighbours() {
        // Two tasks of the same user hand over at 5h with the same amount
        let allocs = vec![alloc(1, 100, 2.0, 0, 5 * H), alloc(2, 100, 2.0, 5 * H, 10 * H)];
        let query = span(0, 10 * H);
        let segs = usage_segments(&capacity(10.0), &allocs, &query, None).unwrap();
        assert_eq!(segs.len(), 2);
        let merged = coalesce_segments(segs);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].window, query);
    }

    #[test]
    fn coalesce_keeps_different_occupants() {
        let allocs = vec![alloc(1, 100, 2.0, 0, 5 * H), alloc(2, 200, 2.0, 5 * H, 10 * H)];
        let query = span(0, 10 * H);
        let merged = coalesce_segments(usage_segments(&capacity(10.0), &allocs, &query, None).unwrap());
        assert_eq!(merged.len(), 2);
    }

    // ── schedule_periods ─────────────────────────────────

    #[test]
    fn schedule_periods_cut_at_every_pair_change() {
        let gpu = capacity(4.0);
        let mut cpu = capacity(64.0);
        cpu.resource_id = 8;
        let mut cpu_alloc = alloc(2, 200, 16.0, 2 * H, 6 * H);
        cpu_alloc.resource_id = 8;

        let pairs = vec![
            (gpu, vec![alloc(1, 100, 1.0, 0, 4 * H)]),
            (cpu, vec![cpu_alloc]),
        ];
        let query = span(0, 8 * H);
        let periods = schedule_periods(&query, &pairs, None).unwrap();

        let windows: Vec<Span> = periods.iter().map(|p| p.window).collect();
        assert_eq!(
            windows,
            vec![span(0, 2 * H), span(2 * H, 4 * H), span(4 * H, 6 * H), span(6 * H, 8 * H)]
        );
        let at_3h = &periods[1].resources;
        assert_eq!(at_3h[0].free.amount, 3.0);
        assert_eq!(at_3h[1].free.amount, 48.0);
        assert_eq!(at_3h[1].user_ids, BTreeSet::from([200]));
        assert_eq!(periods[3].resources[0].used.amount, 0.0);
    }

    #[test]
    fn schedule_periods_without_pairs() {
        let query = span(0, H);
        let periods = schedule_periods(&query, &[], None).unwrap();
        assert_eq!(periods.len(), 1);
        assert!(periods[0].resources.is_empty());
    }

    #[test]
    fn schedule_free_never_negative() {
        let pairs = vec![(capacity(2.0), vec![alloc(1, 100, 5.0, 0, H)])];
        let periods = schedule_periods(&span(0, H), &pairs, None).unwrap();
        assert_eq!(periods[0].resources[0].free.amount, 0.0);
        assert_eq!(periods[0].resources[0].used.amount, 5.0);
    }

    #[test]
    fn group_by_pair_orders_keys() {
        let mut a = alloc(1, 100, 1.0, 0, H);
        a.node_id = 2;
        let b = alloc(2, 100, 1.0, 0, H);
        let grouped = group_by_pair(&[a, b]);
        let keys: Vec<PairKey> = grouped.keys().copied().collect();
        assert_eq!(keys, vec![(1, 7), (2, 7)]);
    }
}
