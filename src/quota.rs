use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, ResourceRequest};
use crate::groups::{group_chain, GroupDirectory};
use crate::model::*;

/// A request that asks for more than a limit allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitViolation {
    pub limit_id: LimitId,
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    /// Base units.
    pub requested: f64,
    pub allowed: f64,
}

/// Limits that bind `user_id`: the user's own, then those of each group in
/// the user's chain, leaf first.
pub fn applicable_limits<'a, D: GroupDirectory + ?Sized>(
    directory: &D,
    limits: &'a [Limit],
    user_id: UserId,
) -> Result<Vec<&'a Limit>, EngineError> {
    let mut out: Vec<&Limit> = limits
        .iter()
        .filter(|l| l.user_id == Some(user_id))
        .collect();
    if let Some(group_id) = directory.group_of_user(user_id)? {
        for id in group_chain(directory, group_id)? {
            out.extend(limits.iter().filter(|l| l.group_id == Some(id)));
        }
    }
    Ok(out)
}

/// Every violation of the user's applicable limits by `requests`.
///
/// A limit caps the amount of one allocation on a matching node. All
/// applicable limits are checked, so the strictest one always shows up.
/// Zero-amount requests never violate.
pub fn check_limits<D: GroupDirectory + ?Sized>(
    directory: &D,
    limits: &[Limit],
    user_id: UserId,
    requests: &[ResourceRequest],
) -> Result<Vec<LimitViolation>, EngineError> {
    let applicable = applicable_limits(directory, limits, user_id)?;
    let mut violations = Vec::new();
    for request in requests.iter().filter(|r| r.amount.amount > 0.0) {
        for limit in &applicable {
            if limit.applies_to(request.node_id, request.resource_id)
                && request.amount.amount > limit.amount
            {
                violations.push(LimitViolation {
                    limit_id: limit.id,
                    node_id: request.node_id,
                    resource_id: request.resource_id,
                    requested: request.amount.amount,
                    allowed: limit.amount,
                });
            }
        }
    }
    if !violations.is_empty() {
        tracing::debug!("user {user_id}: {} limit violation(s)", violations.len());
    }
    Ok(violations)
}
