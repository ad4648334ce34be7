use crate::model::{GroupId, Ms, NodeId, ResourceId, TaskId, UserId};
use crate::units::UnitKind;

#[derive(Debug)]
pub enum EngineError {
    InvalidInterval {
        start: Ms,
        end: Ms,
    },
    UnknownPair {
        node_id: NodeId,
        resource_id: ResourceId,
    },
    UnknownTask(TaskId),
    UnknownUser(UserId),
    UnknownGroup(GroupId),
    UnitMismatch {
        expected: UnitKind,
        found: UnitKind,
    },
    /// A group is its own ancestor; the hierarchy needs administrative repair.
    ConfigurationError {
        group_id: GroupId,
    },
    HasAllocations {
        node_id: NodeId,
        resource_id: ResourceId,
    },
    LimitExceeded(&'static str),
    InvalidRequest(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::UnknownPair {
                node_id,
                resource_id,
            } => write!(f, "node {node_id} does not provide resource {resource_id}"),
            EngineError::UnknownTask(id) => write!(f, "task not found: {id}"),
            EngineError::UnknownUser(id) => write!(f, "user not found: {id}"),
            EngineError::UnknownGroup(id) => write!(f, "group not found: {id}"),
            EngineError::UnitMismatch { expected, found } => {
                write!(f, "unit mismatch: expected {expected}, found {found}")
            }
            EngineError::ConfigurationError { group_id } => {
                write!(f, "group hierarchy cycle detected at group {group_id}")
            }
            EngineError::HasAllocations {
                node_id,
                resource_id,
            } => write!(
                f,
                "cannot remove resource {resource_id} from node {node_id}: allocations exist"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
