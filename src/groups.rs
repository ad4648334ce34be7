use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::engine::EngineError;
use crate::limits::MAX_GROUP_DEPTH;
use crate::model::*;

/// Lookups the scope resolver needs. Implementations own storage access;
/// the resolver itself never does I/O.
pub trait GroupDirectory: Send + Sync {
    /// Parent of `group_id`, or `None` for a root group.
    /// Unknown groups are `EngineError::UnknownGroup`.
    fn parent_of(&self, group_id: GroupId) -> Result<Option<GroupId>, EngineError>;

    /// Notifications assigned directly to `group_id`.
    fn notifications_for_group(&self, group_id: GroupId) -> Vec<Notification>;

    fn group_name(&self, _group_id: GroupId) -> Option<String> {
        None
    }

    /// Group a user belongs to, `None` for users outside any group.
    fn group_of_user(&self, user_id: UserId) -> Result<Option<GroupId>, EngineError> {
        Err(EngineError::UnknownUser(user_id))
    }

    fn notifications_for_user(&self, _user_id: UserId) -> Vec<Notification> {
        Vec::new()
    }
}

/// Adapts a parent lookup and a per-group notification lookup.
/// Knows nothing about users.
pub struct FnDirectory<P, N> {
    parent: P,
    notifications: N,
}

impl<P, N> FnDirectory<P, N>
where
    P: Fn(GroupId) -> Option<GroupId> + Send + Sync,
    N: Fn(GroupId) -> Vec<Notification> + Send + Sync,
{
    pub fn new(parent: P, notifications: N) -> Self {
        Self {
            parent,
            notifications,
        }
    }
}

impl<P, N> GroupDirectory for FnDirectory<P, N>
where
    P: Fn(GroupId) -> Option<GroupId> + Send + Sync,
    N: Fn(GroupId) -> Vec<Notification> + Send + Sync,
{
    fn parent_of(&self, group_id: GroupId) -> Result<Option<GroupId>, EngineError> {
        Ok((self.parent)(group_id))
    }

    fn notifications_for_group(&self, group_id: GroupId) -> Vec<Notification> {
        (self.notifications)(group_id)
    }
}

/// User membership as it appears in a directory document.
#[derive(Debug, Clone, Deserialize)]
pub struct UserMembership {
    pub id: UserId,
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

/// A notification together with its receiver lists.
#[derive(Debug, Clone, Deserialize)]
pub struct AssignedNotification {
    #[serde(flatten)]
    pub notification: Notification,
    #[serde(default)]
    pub receivers_users: Vec<UserId>,
    #[serde(default)]
    pub receivers_groups: Vec<GroupId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryDocument {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub users: Vec<UserMembership>,
    #[serde(default)]
    pub notifications: Vec<AssignedNotification>,
}

/// Directory held in memory, loadable from a JSON document of groups,
/// users and notifications with their receivers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "DirectoryDocument")]
pub struct InMemoryDirectory {
    groups: HashMap<GroupId, Group>,
    user_groups: HashMap<UserId, Option<GroupId>>,
    group_notifications: HashMap<GroupId, Vec<Notification>>,
    user_notifications: HashMap<UserId, Vec<Notification>>,
}

impl From<DirectoryDocument> for InMemoryDirectory {
    fn from(doc: DirectoryDocument) -> Self {
        let mut dir = InMemoryDirectory::new();
        for group in doc.groups {
            dir.add_group(group);
        }
        for user in doc.users {
            dir.add_user(user.id, user.group_id);
        }
        for assigned in doc.notifications {
            for group_id in &assigned.receivers_groups {
                dir.assign_to_group(*group_id, assigned.notification.clone());
            }
            for user_id in &assigned.receivers_users {
                dir.assign_to_user(*user_id, assigned.notification.clone());
            }
        }
        dir
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: Group) {
        self.groups.insert(group.id, group);
    }

    pub fn add_user(&mut self, user_id: UserId, group_id: Option<GroupId>) {
        self.user_groups.insert(user_id, group_id);
    }

    pub fn assign_to_group(&mut self, group_id: GroupId, notification: Notification) {
        self.group_notifications
            .entry(group_id)
            .or_default()
            .push(notification);
    }

    pub fn assign_to_user(&mut self, user_id: UserId, notification: Notification) {
        self.user_notifications
            .entry(user_id)
            .or_default()
            .push(notification);
    }

    pub fn group(&self, group_id: GroupId) -> Option<&Group> {
        self.groups.get(&group_id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl GroupDirectory for InMemoryDirectory {
    fn parent_of(&self, group_id: GroupId) -> Result<Option<GroupId>, EngineError> {
        self.groups
            .get(&group_id)
            .map(|g| g.parent_id)
            .ok_or(EngineError::UnknownGroup(group_id))
    }

    fn notifications_for_group(&self, group_id: GroupId) -> Vec<Notification> {
        self.group_notifications
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    fn group_name(&self, group_id: GroupId) -> Option<String> {
        self.groups.get(&group_id).map(|g| g.name.clone())
    }

    fn group_of_user(&self, user_id: UserId) -> Result<Option<GroupId>, EngineError> {
        self.user_groups
            .get(&user_id)
            .copied()
            .ok_or(EngineError::UnknownUser(user_id))
    }

    fn notifications_for_user(&self, user_id: UserId) -> Vec<Notification> {
        self.user_notifications
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Ids from `start` up to its root, leaf first.
///
/// A group met twice is a cycle and fails with `ConfigurationError`; chains
/// longer than `MAX_GROUP_DEPTH` fail with `LimitExceeded`.
pub fn group_chain<D: GroupDirectory + ?Sized>(
    directory: &D,
    start: GroupId,
) -> Result<Vec<GroupId>, EngineError> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(start);

    while let Some(group_id) = current {
        if !visited.insert(group_id) {
            tracing::warn!("group hierarchy cycle at group {group_id}");
            return Err(EngineError::ConfigurationError { group_id });
        }
        if chain.len() >= MAX_GROUP_DEPTH {
            return Err(EngineError::LimitExceeded("group hierarchy too deep"));
        }
        chain.push(group_id);
        current = directory.parent_of(group_id)?;
    }
    Ok(chain)
}

/// Notification scopes of a group and its ancestors, leaf first. A
/// notification assigned at several levels is kept at the lowest one.
pub fn resolve_for_group<D: GroupDirectory + ?Sized>(
    directory: &D,
    group_id: GroupId,
) -> Result<Vec<NotificationScope>, EngineError> {
    let mut seen = HashSet::new();
    chain_scopes(directory, group_id, &mut seen)
}

/// Scopes for a user: notifications addressed to the user directly come
/// first (`group_id: None`), then the user's group chain, leaf first.
pub fn resolve_for_user<D: GroupDirectory + ?Sized>(
    directory: &D,
    user_id: UserId,
) -> Result<Vec<NotificationScope>, EngineError> {
    let group_id = directory.group_of_user(user_id)?;
    let mut seen = HashSet::new();

    let mut scopes = vec![NotificationScope {
        group_id: None,
        group_name: None,
        notifications: dedup_into(directory.notifications_for_user(user_id), &mut seen),
    }];
    if let Some(group_id) = group_id {
        scopes.extend(chain_scopes(directory, group_id, &mut seen)?);
    }
    Ok(scopes)
}

fn chain_scopes<D: GroupDirectory + ?Sized>(
    directory: &D,
    group_id: GroupId,
    seen: &mut HashSet<NotificationId>,
) -> Result<Vec<NotificationScope>, EngineError> {
    let chain = group_chain(directory, group_id)?;
    Ok(chain
        .into_iter()
        .map(|id| NotificationScope {
            group_id: Some(id),
            group_name: directory.group_name(id),
            notifications: dedup_into(directory.notifications_for_group(id), seen),
        })
        .collect())
}

fn dedup_into(
    notifications: Vec<Notification>,
    seen: &mut HashSet<NotificationId>,
) -> Vec<Notification> {
    notifications
        .into_iter()
        .filter(|n| seen.insert(n.id))
        .collect()
}
