use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use klinik_core::constants::SUPERUSER_ROLE_ID;

use super::{AuthzStore, RouteMapping, check_revision};
use crate::error::{DbError, DbResult};
use crate::model::grant::{GrantSyncOutcome, MembershipSnapshot, reachable_roles};
use crate::model::group::Group;
use crate::model::resource::{
    ResourceNode, ResourceNodeInput, child_level, child_path, expand_with_descendants,
    subtree_lineage, would_create_cycle,
};
use crate::model::role::Role;
use crate::model::user::User;

#[derive(Debug, Default)]
struct Inner {
    next_resource_id: i32,
    next_role_id: i32,
    next_group_id: i32,
    resources: BTreeMap<i32, ResourceNode>,
    roles: BTreeMap<i32, Role>,
    groups: BTreeMap<i32, Group>,
    users: HashMap<Uuid, User>,
    role_grants: BTreeSet<(i32, i32)>,
    role_parents: BTreeSet<(i32, i32)>,
    group_roles: BTreeSet<(i32, i32)>,
    user_roles: BTreeSet<(Uuid, i32)>,
    user_groups: BTreeSet<(Uuid, i32)>,
}

impl Inner {
    fn live_resources(&self) -> Vec<ResourceNode> {
        self.resources
            .values()
            .filter(|n| !n.is_deleted())
            .cloned()
            .collect()
    }

    fn live_resource(&self, id: i32) -> DbResult<&ResourceNode> {
        self.resources
            .get(&id)
            .filter(|n| !n.is_deleted())
            .ok_or_else(|| DbError::NotFound(format!("resource node {id}")))
    }

    fn live_role(&self, id: i32) -> DbResult<&Role> {
        self.roles
            .get(&id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or_else(|| DbError::NotFound(format!("role {id}")))
    }

    fn live_group(&self, id: i32) -> DbResult<&Group> {
        self.groups
            .get(&id)
            .filter(|g| g.deleted_at.is_none())
            .ok_or_else(|| DbError::NotFound(format!("group {id}")))
    }

    fn live_user(&self, id: Uuid) -> DbResult<&User> {
        self.users
            .get(&id)
            .filter(|u| u.deleted_at.is_none())
            .ok_or_else(|| DbError::NotFound(format!("user {id}")))
    }

    fn check_route_free(&self, input: &ResourceNodeInput, except: Option<i32>) -> DbResult<()> {
        let (Some(path), Some(method)) = (&input.route_path, &input.route_method) else {
            return Ok(());
        };
        let taken = self.resources.values().any(|n| {
            !n.is_deleted()
                && Some(n.id) != except
                && n.route() == Some((path.as_str(), method.as_str()))
        });
        if taken {
            return Err(DbError::Conflict(format!(
                "route {method} {path} is already mapped"
            )));
        }
        Ok(())
    }

    fn check_parent(&self, parent_id: Option<i32>) -> DbResult<Option<&ResourceNode>> {
        parent_id.map(|id| self.live_resource(id)).transpose()
    }

    fn grants_of(&self, role_id: i32) -> Vec<ResourceNode> {
        self.role_grants
            .iter()
            .filter(|(role, _)| *role == role_id)
            .filter_map(|(_, resource)| self.resources.get(resource))
            .filter(|n| !n.is_deleted())
            .cloned()
            .collect()
    }
}

/// In-process `AuthzStore`. A single lock around all tables gives each call
/// transaction semantics.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store seeded with the superuser role.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        let mut inner = Inner {
            next_resource_id: 1,
            next_role_id: SUPERUSER_ROLE_ID + 1,
            next_group_id: 1,
            ..Inner::default()
        };
        inner.roles.insert(
            SUPERUSER_ROLE_ID,
            Role {
                id: SUPERUSER_ROLE_ID,
                name: "superuser".to_string(),
                policy_revision: 0,
                created_by: None,
                updated_by: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            },
        );
        Self {
            inner: RwLock::new(inner),
        }
    }
}

#[async_trait]
impl AuthzStore for MemoryStore {
    async fn list_resources(&self) -> DbResult<Vec<ResourceNode>> {
        Ok(self.inner.read().await.live_resources())
    }

    async fn get_resource(&self, id: i32) -> DbResult<ResourceNode> {
        self.inner.read().await.live_resource(id).cloned()
    }

    async fn create_resource(
        &self,
        input: &ResourceNodeInput,
        actor: Option<Uuid>,
    ) -> DbResult<ResourceNode> {
        let mut inner = self.inner.write().await;
        inner.check_route_free(input, None)?;
        let parent = inner.check_parent(input.parent_id)?;
        let (parent_level, parent_path) =
            (parent.and_then(|p| p.level), parent.and_then(|p| p.path.clone()));

        let id = inner.next_resource_id;
        inner.next_resource_id += 1;
        let now = Utc::now();
        let node = ResourceNode {
            id,
            label: input.label.clone(),
            resource_key: input.resource_key.clone(),
            action: input.action.clone(),
            parent_id: input.parent_id,
            view: input.view.clone(),
            data: input.data.clone(),
            level: Some(child_level(parent_level)),
            path: Some(child_path(parent_path.as_deref(), id)),
            route_path: input.route_path.clone(),
            route_method: input.route_method.clone(),
            created_by: actor,
            updated_by: actor,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.resources.insert(id, node.clone());
        Ok(node)
    }

    async fn update_resource(
        &self,
        id: i32,
        input: &ResourceNodeInput,
        actor: Option<Uuid>,
    ) -> DbResult<ResourceNode> {
        let mut inner = self.inner.write().await;
        let current = inner.live_resource(id)?.clone();
        inner.check_route_free(input, Some(id))?;
        inner.check_parent(input.parent_id)?;

        let reparented = current.parent_id != input.parent_id;
        if reparented && would_create_cycle(&inner.live_resources(), id, input.parent_id) {
            return Err(DbError::CoreError(
                klinik_core::error::CoreError::InvalidInput(format!(
                    "moving node {id} under {:?} would create a cycle",
                    input.parent_id
                )),
            ));
        }

        let updated = ResourceNode {
            label: input.label.clone(),
            resource_key: input.resource_key.clone(),
            action: input.action.clone(),
            parent_id: input.parent_id,
            view: input.view.clone(),
            data: input.data.clone(),
            route_path: input.route_path.clone(),
            route_method: input.route_method.clone(),
            updated_by: actor,
            updated_at: Utc::now(),
            ..current
        };
        inner.resources.insert(id, updated);

        if reparented {
            let snapshot: Vec<ResourceNode> = inner.resources.values().cloned().collect();
            for (node_id, level, path) in subtree_lineage(&snapshot, id) {
                if let Some(node) = inner.resources.get_mut(&node_id) {
                    node.level = Some(level);
                    node.path = Some(path);
                }
            }
        }

        inner.live_resource(id).cloned()
    }

    async fn soft_delete_resource(&self, id: i32, actor: Option<Uuid>) -> DbResult<Vec<i32>> {
        let mut inner = self.inner.write().await;
        inner.live_resource(id)?;
        let affected = expand_with_descendants(&inner.live_resources(), &[id]);
        let now = Utc::now();
        for node_id in &affected {
            if let Some(node) = inner.resources.get_mut(node_id) {
                node.deleted_at = Some(now);
                node.updated_by = actor;
                node.updated_at = now;
            }
        }
        Ok(affected)
    }

    async fn route_mappings(&self) -> DbResult<Vec<RouteMapping>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .filter_map(RouteMapping::from_node)
            .collect())
    }

    async fn route_mappings_for_key(&self, resource_key: &str) -> DbResult<Vec<RouteMapping>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .filter(|n| n.resource_key == resource_key)
            .filter_map(RouteMapping::from_node)
            .collect())
    }

    async fn list_roles(&self) -> DbResult<Vec<Role>> {
        let inner = self.inner.read().await;
        Ok(inner
            .roles
            .values()
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn get_role(&self, id: i32) -> DbResult<Role> {
        self.inner.read().await.live_role(id).cloned()
    }

    async fn create_role(&self, name: &str, actor: Option<Uuid>) -> DbResult<Role> {
        let mut inner = self.inner.write().await;
        if inner
            .roles
            .values()
            .any(|r| r.deleted_at.is_none() && r.name == name)
        {
            return Err(DbError::Conflict(format!("role {name:?} already exists")));
        }
        let id = inner.next_role_id;
        inner.next_role_id += 1;
        let now = Utc::now();
        let role = Role {
            id,
            name: name.to_string(),
            policy_revision: 0,
            created_by: actor,
            updated_by: actor,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.roles.insert(id, role.clone());
        Ok(role)
    }

    async fn rename_role(&self, id: i32, name: &str, actor: Option<Uuid>) -> DbResult<Role> {
        let mut inner = self.inner.write().await;
        inner.live_role(id)?;
        if inner
            .roles
            .values()
            .any(|r| r.deleted_at.is_none() && r.id != id && r.name == name)
        {
            return Err(DbError::Conflict(format!("role {name:?} already exists")));
        }
        let role = inner
            .roles
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("role {id}")))?;
        role.name = name.to_string();
        role.updated_by = actor;
        role.updated_at = Utc::now();
        Ok(role.clone())
    }

    async fn soft_delete_role(&self, id: i32, actor: Option<Uuid>) -> DbResult<Role> {
        let mut inner = self.inner.write().await;
        inner.live_role(id)?;
        inner.role_grants.retain(|(role, _)| *role != id);
        inner
            .role_parents
            .retain(|(role, parent)| *role != id && *parent != id);
        inner.group_roles.retain(|(_, role)| *role != id);
        inner.user_roles.retain(|(_, role)| *role != id);
        let role = inner
            .roles
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("role {id}")))?;
        let now = Utc::now();
        role.deleted_at = Some(now);
        role.updated_by = actor;
        role.updated_at = now;
        role.policy_revision += 1;
        Ok(role.clone())
    }

    async fn role_grants(&self, role_id: i32) -> DbResult<Vec<ResourceNode>> {
        let inner = self.inner.read().await;
        inner.live_role(role_id)?;
        Ok(inner.grants_of(role_id))
    }

    async fn replace_role_grants(
        &self,
        role_id: i32,
        resource_ids: &[i32],
        _actor: Option<Uuid>,
        expected_revision: Option<i64>,
    ) -> DbResult<GrantSyncOutcome> {
        let mut inner = self.inner.write().await;
        let revision = inner.live_role(role_id)?.policy_revision;
        check_revision(role_id, revision, expected_revision)?;
        for id in resource_ids {
            inner.live_resource(*id)?;
        }

        let desired = expand_with_descendants(&inner.live_resources(), resource_ids);
        let desired_set: BTreeSet<i32> = desired.iter().copied().collect();
        let current: BTreeSet<i32> = inner
            .role_grants
            .iter()
            .filter(|(role, _)| *role == role_id)
            .map(|(_, resource)| *resource)
            .collect();

        let removed_ids: Vec<i32> = current.difference(&desired_set).copied().collect();
        let added_ids: Vec<i32> = desired_set.difference(&current).copied().collect();
        for id in &removed_ids {
            inner.role_grants.remove(&(role_id, *id));
        }
        for id in &added_ids {
            inner.role_grants.insert((role_id, *id));
        }

        let role = inner
            .roles
            .get_mut(&role_id)
            .ok_or_else(|| DbError::NotFound(format!("role {role_id}")))?;
        role.policy_revision += 1;
        role.updated_at = Utc::now();
        let revision = role.policy_revision;

        Ok(GrantSyncOutcome {
            role_id,
            revision,
            expanded_ids: desired,
            added_ids,
            removed_ids,
            granted: inner.grants_of(role_id),
        })
    }

    async fn roles_granting(&self, resource_ids: &[i32]) -> DbResult<Vec<i32>> {
        let inner = self.inner.read().await;
        let roles: BTreeSet<i32> = inner
            .role_grants
            .iter()
            .filter(|(_, resource)| resource_ids.contains(resource))
            .map(|(role, _)| *role)
            .collect();
        Ok(roles.into_iter().collect())
    }

    async fn replace_role_parents(
        &self,
        role_id: i32,
        parent_ids: &[i32],
        _actor: Option<Uuid>,
    ) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        inner.live_role(role_id)?;
        for parent in parent_ids {
            inner.live_role(*parent)?;
        }
        inner.role_parents.retain(|(role, _)| *role != role_id);
        for parent in parent_ids {
            inner.role_parents.insert((role_id, *parent));
        }
        Ok(())
    }

    async fn list_groups(&self) -> DbResult<Vec<Group>> {
        let inner = self.inner.read().await;
        Ok(inner
            .groups
            .values()
            .filter(|g| g.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn create_group(&self, name: &str, actor: Option<Uuid>) -> DbResult<Group> {
        let mut inner = self.inner.write().await;
        if inner
            .groups
            .values()
            .any(|g| g.deleted_at.is_none() && g.name == name)
        {
            return Err(DbError::Conflict(format!("group {name:?} already exists")));
        }
        let id = inner.next_group_id;
        inner.next_group_id += 1;
        let now = Utc::now();
        let group = Group {
            id,
            name: name.to_string(),
            created_by: actor,
            updated_by: actor,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.groups.insert(id, group.clone());
        Ok(group)
    }

    async fn get_group(&self, id: i32) -> DbResult<Group> {
        let inner = self.inner.read().await;
        inner.live_group(id).cloned()
    }

    async fn rename_group(&self, id: i32, name: &str, actor: Option<Uuid>) -> DbResult<Group> {
        let mut inner = self.inner.write().await;
        inner.live_group(id)?;
        if inner
            .groups
            .values()
            .any(|g| g.deleted_at.is_none() && g.id != id && g.name == name)
        {
            return Err(DbError::Conflict(format!("group {name:?} already exists")));
        }
        let group = inner
            .groups
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("group {id}")))?;
        group.name = name.to_string();
        group.updated_by = actor;
        group.updated_at = Utc::now();
        Ok(group.clone())
    }

    async fn soft_delete_group(&self, id: i32, actor: Option<Uuid>) -> DbResult<Group> {
        let mut inner = self.inner.write().await;
        inner.live_group(id)?;
        inner.group_roles.retain(|(group, _)| *group != id);
        inner.user_groups.retain(|(_, group)| *group != id);
        let group = inner
            .groups
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("group {id}")))?;
        let now = Utc::now();
        group.deleted_at = Some(now);
        group.updated_by = actor;
        group.updated_at = now;
        Ok(group.clone())
    }

    async fn replace_group_roles(
        &self,
        group_id: i32,
        role_ids: &[i32],
        _actor: Option<Uuid>,
    ) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        inner.live_group(group_id)?;
        for role in role_ids {
            inner.live_role(*role)?;
        }
        inner.group_roles.retain(|(group, _)| *group != group_id);
        for role in role_ids {
            inner.group_roles.insert((group_id, *role));
        }
        Ok(())
    }

    async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> DbResult<User> {
        let mut inner = self.inner.write().await;
        if inner
            .users
            .values()
            .any(|u| u.deleted_at.is_none() && u.username == username)
        {
            return Err(DbError::Conflict(format!(
                "username {username:?} already exists"
            )));
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::now_v7(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            password_hash: password_hash.to_string(),
            refresh_token: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> DbResult<User> {
        self.inner.read().await.live_user(id).cloned()
    }

    async fn find_user_by_username(&self, username: &str) -> DbResult<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.deleted_at.is_none() && u.username == username)
            .cloned())
    }

    async fn set_refresh_token(&self, user_id: Uuid, token: Option<&str>) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .filter(|u| u.deleted_at.is_none())
            .ok_or_else(|| DbError::NotFound(format!("user {user_id}")))?;
        user.refresh_token = token.map(str::to_string);
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn user_roles(&self, user_id: Uuid) -> DbResult<Vec<i32>> {
        let inner = self.inner.read().await;
        inner.live_user(user_id)?;
        Ok(inner
            .user_roles
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, role)| *role)
            .collect())
    }

    async fn replace_user_roles(
        &self,
        user_id: Uuid,
        role_ids: &[i32],
        _actor: Option<Uuid>,
    ) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        inner.live_user(user_id)?;
        for role in role_ids {
            inner.live_role(*role)?;
        }
        inner.user_roles.retain(|(user, _)| *user != user_id);
        for role in role_ids {
            inner.user_roles.insert((user_id, *role));
        }
        Ok(())
    }

    async fn replace_user_groups(
        &self,
        user_id: Uuid,
        group_ids: &[i32],
        _actor: Option<Uuid>,
    ) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        inner.live_user(user_id)?;
        for group in group_ids {
            inner.live_group(*group)?;
        }
        inner.user_groups.retain(|(user, _)| *user != user_id);
        for group in group_ids {
            inner.user_groups.insert((user_id, *group));
        }
        Ok(())
    }

    async fn memberships(&self) -> DbResult<MembershipSnapshot> {
        let inner = self.inner.read().await;
        Ok(MembershipSnapshot {
            user_roles: inner.user_roles.iter().copied().collect(),
            user_groups: inner.user_groups.iter().copied().collect(),
            group_roles: inner.group_roles.iter().copied().collect(),
            role_parents: inner.role_parents.iter().copied().collect(),
        })
    }

    async fn all_grants(&self) -> DbResult<Vec<(i32, ResourceNode)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .role_grants
            .iter()
            .filter(|(role, _)| inner.live_role(*role).is_ok())
            .filter_map(|(role, resource)| {
                inner
                    .resources
                    .get(resource)
                    .filter(|n| !n.is_deleted())
                    .map(|n| (*role, n.clone()))
            })
            .collect())
    }

    async fn effective_role_ids(&self, user_id: Uuid) -> DbResult<Vec<i32>> {
        let inner = self.inner.read().await;
        inner.live_user(user_id)?;
        let direct: Vec<i32> = inner
            .user_roles
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, role)| *role)
            .collect();
        let groups: Vec<i32> = inner
            .user_groups
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, group)| *group)
            .collect();
        let group_roles: Vec<(i32, i32)> = inner.group_roles.iter().copied().collect();
        let role_parents: Vec<(i32, i32)> = inner.role_parents.iter().copied().collect();
        Ok(reachable_roles(&direct, &groups, &group_roles, &role_parents))
    }

    async fn resources_for_roles(&self, role_ids: &[i32]) -> DbResult<Vec<ResourceNode>> {
        let inner = self.inner.read().await;
        let ids: BTreeSet<i32> = inner
            .role_grants
            .iter()
            .filter(|(role, _)| role_ids.contains(role))
            .map(|(_, resource)| *resource)
            .collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| inner.resources.get(&id))
            .filter(|n| !n.is_deleted())
            .cloned()
            .collect())
    }
}
