use crate::limits::*;
use crate::model::*;

use super::availability::{coalesce_segments, usage_segments};
use super::EngineError;

pub(crate) fn validate_window(span: &Span, max_width: Ms) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > max_width {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// Decide whether `proposed` fits next to `allocations` on its pair.
///
/// Pure predicate over the snapshot it is given: an `Accept` reserves
/// nothing. Callers that persist the allocation afterwards must hold a lock
/// on the pair across check and write, or two checks against the same
/// snapshot can both accept and overcommit.
///
/// A zero amount is always accepted (it clears a reservation upstream).
/// Otherwise every segment of the proposed window where
/// `occupied + proposed > total` is returned, coalesced, in the rejection.
pub fn check_feasibility(
    capacity: &ResourceCapacity,
    allocations: &[Allocation],
    proposed: &Allocation,
    exclude_task_id: Option<TaskId>,
) -> Result<Verdict, EngineError> {
    if proposed.pair() != capacity.pair() {
        return Err(EngineError::UnknownPair {
            node_id: proposed.node_id,
            resource_id: proposed.resource_id,
        });
    }
    capacity.total.ensure_same_unit(&proposed.amount)?;
    let requested = proposed.amount.amount;
    if requested < 0.0 || requested.is_nan() {
        return Err(EngineError::InvalidRequest(format!(
            "allocation amount must be non-negative, got {requested}"
        )));
    }
    if requested == 0.0 {
        return Ok(Verdict::Accept);
    }

    let total = capacity.total.amount;
    let conflicts: Vec<UsageSegment> =
        usage_segments(capacity, allocations, &proposed.window, exclude_task_id)?
            .into_iter()
            .filter(|seg| seg.occupied.amount + requested > total)
            .collect();

    if conflicts.is_empty() {
        Ok(Verdict::Accept)
    } else {
        Ok(Verdict::Reject {
            conflicts: coalesce_segments(conflicts),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::units::{Quantity, UnitKind};

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

    #[test]
    fn overcommit_rejected_with_conflicting_segment() {
        let existing = vec![alloc(1, 100, 6.0, 10 * H, 12 * H)];
        let proposed = alloc(2, 200, 5.0, 11 * H, 13 * H);
        let verdict = check_feasibility(&capacity(10.0), &existing, &proposed, None).unwrap();
        match verdict {
            Verdict::Reject { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].window, span(11 * H, 12 * H));
                assert_eq!(conflicts[0].occupied.amount, 6.0);
                assert_eq!(conflicts[0].user_ids, BTreeSet::from([100]));
            }
            Verdict::Accept => panic!("expected rejection"),
        }
    }

    #[test]
    fn filling_to_exact_capacity_accepted() {
        let existing = vec![alloc(1, 100, 6.0, 10 * H, 12 * H)];
        let proposed = alloc(2, 200, 4.0, 11 * H, 13 * H);
        let verdict = check_feasibility(&capacity(10.0), &existing, &proposed, None).unwrap();
        assert!(verdict.is_accept());
    }

    #[test]
    fn window_outside_existing_allocations_accepted() {
        let existing = vec![alloc(1, 100, 10.0, 10 * H, 12 * H)];
        let proposed = alloc(2, 200, 10.0, 12 * H, 14 * H);
        assert!(check_feasibility(&capacity(10.0), &existing, &proposed, None)
            .unwrap()
            .is_accept());
    }

    #[test]
    fn zero_amount_always_accepted() {
        let existing = vec![alloc(1, 100, 10.0, 10 * H, 12 * H)];
        let proposed = alloc(2, 200, 0.0, 10 * H, 12 * H);
        assert!(check_feasibility(&capacity(10.0), &existing, &proposed, None)
            .unwrap()
            .is_accept());
        // Even when the pair is already overcommitted
        assert!(check_feasibility(&capacity(1.0), &existing, &proposed, None)
            .unwrap()
            .is_accept());
    }

    #[test]
    fn request_larger_than_capacity_rejected_on_empty_pair() {
        let proposed = alloc(2, 200, 11.0, 10 * H, 12 * H);
        let verdict = check_feasibility(&capacity(10.0), &[], &proposed, None).unwrap();
        assert_eq!(verdict.conflicts().len(), 1);
        assert_eq!(verdict.conflicts()[0].window, span(10 * H, 12 * H));
        assert!(verdict.occupying_users().is_empty());
    }

    #[test]
    fn edit_does_not_conflict_with_itself() {
        let existing = vec![alloc(1, 100, 8.0, 10 * H, 12 * H)];
        // Task 1 moved by one hour, same amount
        let proposed = alloc(1, 100, 8.0, 11 * H, 13 * H);
        assert!(!check_feasibility(&capacity(10.0), &existing, &proposed, None)
            .unwrap()
            .is_accept());
        assert!(check_feasibility(&capacity(10.0), &existing, &proposed, Some(1))
            .unwrap()
            .is_accept());
    }

    #[test]
    fn every_conflicting_range_reported() {
        let existing = vec![
            alloc(1, 100, 6.0, 0, 2 * H),
            alloc(2, 200, 6.0, 4 * H, 6 * H),
            alloc(3, 300, 1.0, 2 * H, 4 * H),
        ];
        let proposed = alloc(9, 900, 5.0, 0, 6 * H);
        let verdict = check_feasibility(&capacity(10.0), &existing, &proposed, None).unwrap();
        let windows: Vec<Span> = verdict.conflicts().iter().map(|s| s.window).collect();
        assert_eq!(windows, vec![span(0, 2 * H), span(4 * H, 6 * H)]);
        assert_eq!(verdict.occupying_users(), BTreeSet::from([100, 200]));
    }

    #[test]
    fn adjacent_conflicts_with_same_occupancy_coalesced() {
        let existing = vec![alloc(1, 100, 6.0, 0, 2 * H), alloc(2, 100, 6.0, 2 * H, 4 * H)];
        let proposed = alloc(9, 900, 5.0, 0, 4 * H);
        let verdict = check_feasibility(&capacity(10.0), &existing, &proposed, None).unwrap();
        assert_eq!(verdict.conflicts().len(), 1);
        assert_eq!(verdict.conflicts()[0].window, span(0, 4 * H));
    }

    #[test]
    fn mismatched_pair_is_an_error() {
        let mut proposed = alloc(2, 200, 1.0, 0, H);
        proposed.node_id = 2;
        let result = check_feasibility(&capacity(10.0), &[], &proposed, None);
        assert!(matches!(result, Err(EngineError::UnknownPair { node_id: 2, resource_id: 7 })));
    }

    #[test]
    fn negative_amount_is_an_error() {
        let proposed = alloc(2, 200, -1.0, 0, H);
        let result = check_feasibility(&capacity(10.0), &[], &proposed, None);
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }

    #[test]
    fn bytes_compared_in_base_units() {
        let cap = ResourceCapacity {
            node_id: 1,
            resource_id: 7,
            total: Quantity::new(16.0 * 1024f64.powi(3), UnitKind::BytesIec),
        };
        let mut existing = alloc(1, 100, 0.0, 0, H);
        existing.amount = Quantity::new(12.0 * 1024f64.powi(3), UnitKind::BytesIec);
        let mut proposed = alloc(2, 200, 0.0, 0, H);
        proposed.amount = Quantity::new(4.0 * 1024f64.powi(3), UnitKind::BytesIec);
        assert!(check_feasibility(&cap, std::slice::from_ref(&existing), &proposed, None)
            .unwrap()
            .is_accept());
        proposed.amount.amount += 1.0;
        assert!(!check_feasibility(&cap, &[existing], &proposed, None)
            .unwrap()
            .is_accept());
    }

    #[test]
    fn window_validation() {
        assert!(validate_window(&span(0, H), MAX_QUERY_WINDOW_MS).is_ok());
        assert!(matches!(
            validate_window(&span(-H, H), MAX_QUERY_WINDOW_MS),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_window(&span(0, MAX_QUERY_WINDOW_MS + 1), MAX_QUERY_WINDOW_MS),
            Err(EngineError::LimitExceeded("window too wide"))
        ));
    }
}
