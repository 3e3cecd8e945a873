use std::collections::BTreeSet;

use async_trait::async_trait;
use diesel_async::scoped_futures::ScopedFutureExt;
use uuid::Uuid;

use klinik_core::error::CoreError;

use super::{AuthzStore, RouteMapping, check_revision};
use crate::db::connection::DbPool;
use crate::db::query::{membership, resource, role, user};
use crate::db::transaction::with_transaction;
use crate::db::DbProvider;
use crate::error::{DbError, DbResult};
use crate::model::grant::{GrantSyncOutcome, MembershipSnapshot, NewRoleGrant, reachable_roles};
use crate::model::group::{Group, NewGroup, NewGroupRole};
use crate::model::resource::{
    NewResourceNode, ResourceNode, ResourceNodeInput, ResourceNodeUpdate, child_level,
    child_path, expand_with_descendants, subtree_lineage, would_create_cycle,
};
use crate::model::role::{NewRole, NewRoleParent, Role};
use crate::model::user::{NewUser, NewUserGroup, NewUserRole, User};

fn missing(what: String) -> impl FnOnce(diesel::result::Error) -> DbError {
    move |err| DbError::not_found_or(err, || what)
}

/// Postgres-backed `AuthzStore` over the shared bb8 pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthzStore for PgStore {
    async fn list_resources(&self) -> DbResult<Vec<ResourceNode>> {
        let mut conn = self.pool.get_connection().await?;
        Ok(resource::list_live(&mut conn).await?)
    }

    async fn get_resource(&self, id: i32) -> DbResult<ResourceNode> {
        let mut conn = self.pool.get_connection().await?;
        resource::find_live(&mut conn, id)
            .await
            .map_err(missing(format!("resource node {id}")))
    }

    #[tracing::instrument(skip(self, input), fields(resource_key = %input.resource_key))]
    async fn create_resource(
        &self,
        input: &ResourceNodeInput,
        actor: Option<Uuid>,
    ) -> DbResult<ResourceNode> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                let parent = match input.parent_id {
                    Some(parent_id) => Some(
                        resource::find_live(tx, parent_id)
                            .await
                            .map_err(missing(format!("parent resource node {parent_id}")))?,
                    ),
                    None => None,
                };
                let level = child_level(parent.as_ref().and_then(|p| p.level));
                let mut node = resource::insert(tx, &NewResourceNode::from_input(input, level, actor))
                    .await
                    .map_err(missing("resource node".to_string()))?;

                let path = child_path(parent.as_ref().and_then(|p| p.path.as_deref()), node.id);
                resource::set_lineage(tx, node.id, level, &path).await?;
                node.path = Some(path);
                Ok(node)
            }
            .scope_boxed()
        })
        .await
    }

    #[tracing::instrument(skip(self, input))]
    async fn update_resource(
        &self,
        id: i32,
        input: &ResourceNodeInput,
        actor: Option<Uuid>,
    ) -> DbResult<ResourceNode> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                let current = resource::find_live(tx, id)
                    .await
                    .map_err(missing(format!("resource node {id}")))?;
                if let Some(parent_id) = input.parent_id {
                    resource::find_live(tx, parent_id)
                        .await
                        .map_err(missing(format!("parent resource node {parent_id}")))?;
                }

                let reparented = current.parent_id != input.parent_id;
                if reparented {
                    let nodes = resource::list_live(tx).await?;
                    if would_create_cycle(&nodes, id, input.parent_id) {
                        return Err(CoreError::InvalidInput(format!(
                            "moving node {id} under {:?} would create a cycle",
                            input.parent_id
                        ))
                        .into());
                    }
                }

                resource::update(tx, id, &ResourceNodeUpdate::from_input(input, actor))
                    .await
                    .map_err(missing(format!("resource node {id}")))?;

                if reparented {
                    let nodes = resource::list_live(tx).await?;
                    for (node_id, level, path) in subtree_lineage(&nodes, id) {
                        resource::set_lineage(tx, node_id, level, &path).await?;
                    }
                }
                Ok(resource::find_live(tx, id).await?)
            }
            .scope_boxed()
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn soft_delete_resource(&self, id: i32, actor: Option<Uuid>) -> DbResult<Vec<i32>> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                resource::find_live(tx, id)
                    .await
                    .map_err(missing(format!("resource node {id}")))?;
                let nodes = resource::list_live(tx).await?;
                let affected = expand_with_descendants(&nodes, &[id]);
                resource::soft_delete(tx, &affected, actor).await?;
                Ok(affected)
            }
            .scope_boxed()
        })
        .await
    }

    async fn route_mappings(&self) -> DbResult<Vec<RouteMapping>> {
        let mut conn = self.pool.get_connection().await?;
        let nodes = resource::routed(&mut conn, None).await?;
        Ok(nodes.iter().filter_map(RouteMapping::from_node).collect())
    }

    async fn route_mappings_for_key(&self, resource_key: &str) -> DbResult<Vec<RouteMapping>> {
        let mut conn = self.pool.get_connection().await?;
        let nodes = resource::routed(&mut conn, Some(resource_key)).await?;
        Ok(nodes.iter().filter_map(RouteMapping::from_node).collect())
    }

    async fn list_roles(&self) -> DbResult<Vec<Role>> {
        let mut conn = self.pool.get_connection().await?;
        Ok(role::list_live(&mut conn).await?)
    }

    async fn get_role(&self, id: i32) -> DbResult<Role> {
        let mut conn = self.pool.get_connection().await?;
        role::find_live(&mut conn, id)
            .await
            .map_err(missing(format!("role {id}")))
    }

    async fn create_role(&self, name: &str, actor: Option<Uuid>) -> DbResult<Role> {
        let mut conn = self.pool.get_connection().await?;
        let new_role = NewRole {
            name,
            created_by: actor,
            updated_by: actor,
        };
        role::insert(&mut conn, &new_role)
            .await
            .map_err(missing(format!("role {name:?}")))
    }

    async fn rename_role(&self, id: i32, name: &str, actor: Option<Uuid>) -> DbResult<Role> {
        let mut conn = self.pool.get_connection().await?;
        role::rename(&mut conn, id, name, actor)
            .await
            .map_err(missing(format!("role {id}")))
    }

    #[tracing::instrument(skip(self))]
    async fn soft_delete_role(&self, id: i32, actor: Option<Uuid>) -> DbResult<Role> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                let deleted = role::soft_delete(tx, id, actor)
                    .await
                    .map_err(missing(format!("role {id}")))?;
                role::delete_all_grants(tx, id).await?;
                role::delete_parent_edges(tx, id).await?;
                membership::detach_role(tx, id).await?;
                Ok(deleted)
            }
            .scope_boxed()
        })
        .await
    }

    async fn role_grants(&self, role_id: i32) -> DbResult<Vec<ResourceNode>> {
        let mut conn = self.pool.get_connection().await?;
        role::find_live(&mut conn, role_id)
            .await
            .map_err(missing(format!("role {role_id}")))?;
        Ok(role::granted_nodes(&mut conn, role_id).await?)
    }

    #[tracing::instrument(skip(self, resource_ids), fields(requested = resource_ids.len()))]
    async fn replace_role_grants(
        &self,
        role_id: i32,
        resource_ids: &[i32],
        actor: Option<Uuid>,
        expected_revision: Option<i64>,
    ) -> DbResult<GrantSyncOutcome> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                let locked = role::lock_live(tx, role_id)
                    .await
                    .map_err(missing(format!("role {role_id}")))?;
                check_revision(role_id, locked.policy_revision, expected_revision)?;

                let nodes = resource::list_live(tx).await?;
                if let Some(unknown) = resource_ids
                    .iter()
                    .find(|id| !nodes.iter().any(|n| n.id == **id))
                {
                    return Err(DbError::NotFound(format!("resource node {unknown}")));
                }

                let desired = expand_with_descendants(&nodes, resource_ids);
                let desired_set: BTreeSet<i32> = desired.iter().copied().collect();
                let current: BTreeSet<i32> = role::grant_ids(tx, role_id).await?.into_iter().collect();

                let removed_ids: Vec<i32> = current.difference(&desired_set).copied().collect();
                let added_ids: Vec<i32> = desired_set.difference(&current).copied().collect();

                if !removed_ids.is_empty() {
                    role::delete_grants(tx, role_id, &removed_ids).await?;
                }
                let rows: Vec<NewRoleGrant> = added_ids
                    .iter()
                    .map(|resource_id| NewRoleGrant {
                        role_id,
                        resource_id: *resource_id,
                        created_by: actor,
                    })
                    .collect();
                role::insert_grants(tx, &rows).await?;

                let revision = role::bump_revision(tx, role_id).await?;
                let granted = role::granted_nodes(tx, role_id).await?;

                tracing::debug!(
                    role_id,
                    revision,
                    added = added_ids.len(),
                    removed = removed_ids.len(),
                    "Role grants replaced"
                );

                Ok(GrantSyncOutcome {
                    role_id,
                    revision,
                    expanded_ids: desired,
                    added_ids,
                    removed_ids,
                    granted,
                })
            }
            .scope_boxed()
        })
        .await
    }

    async fn roles_granting(&self, resource_ids: &[i32]) -> DbResult<Vec<i32>> {
        let mut conn = self.pool.get_connection().await?;
        Ok(role::roles_granting(&mut conn, resource_ids).await?)
    }

    async fn replace_role_parents(
        &self,
        role_id: i32,
        parent_ids: &[i32],
        actor: Option<Uuid>,
    ) -> DbResult<()> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                role::find_live(tx, role_id)
                    .await
                    .map_err(missing(format!("role {role_id}")))?;
                for parent in parent_ids {
                    role::find_live(tx, *parent)
                        .await
                        .map_err(missing(format!("role {parent}")))?;
                }
                let rows: Vec<NewRoleParent> = parent_ids
                    .iter()
                    .map(|parent| NewRoleParent {
                        role_id,
                        parent_role_id: *parent,
                        created_by: actor,
                    })
                    .collect();
                role::replace_parents(tx, role_id, &rows).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_groups(&self) -> DbResult<Vec<Group>> {
        let mut conn = self.pool.get_connection().await?;
        Ok(membership::list_groups(&mut conn).await?)
    }

    async fn create_group(&self, name: &str, actor: Option<Uuid>) -> DbResult<Group> {
        let mut conn = self.pool.get_connection().await?;
        membership::insert_group(
            &mut conn,
            &NewGroup {
                name,
                created_by: actor,
                updated_by: actor,
            },
        )
        .await
        .map_err(missing(format!("group {name:?}")))
    }

    async fn get_group(&self, id: i32) -> DbResult<Group> {
        let mut conn = self.pool.get_connection().await?;
        membership::find_group(&mut conn, id)
            .await
            .map_err(missing(format!("group {id}")))
    }

    async fn rename_group(&self, id: i32, name: &str, actor: Option<Uuid>) -> DbResult<Group> {
        let mut conn = self.pool.get_connection().await?;
        membership::rename_group(&mut conn, id, name, actor)
            .await
            .map_err(missing(format!("group {id}")))
    }

    #[tracing::instrument(skip(self))]
    async fn soft_delete_group(&self, id: i32, actor: Option<Uuid>) -> DbResult<Group> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                let deleted = membership::soft_delete_group(tx, id, actor)
                    .await
                    .map_err(missing(format!("group {id}")))?;
                membership::detach_group(tx, id).await?;
                Ok(deleted)
            }
            .scope_boxed()
        })
        .await
    }

    async fn replace_group_roles(
        &self,
        group_id: i32,
        role_ids: &[i32],
        actor: Option<Uuid>,
    ) -> DbResult<()> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                membership::find_group(tx, group_id)
                    .await
                    .map_err(missing(format!("group {group_id}")))?;
                for role_id in role_ids {
                    role::find_live(tx, *role_id)
                        .await
                        .map_err(missing(format!("role {role_id}")))?;
                }
                let rows: Vec<NewGroupRole> = role_ids
                    .iter()
                    .map(|role_id| NewGroupRole {
                        group_id,
                        role_id: *role_id,
                        created_by: actor,
                    })
                    .collect();
                membership::replace_group_roles(tx, group_id, &rows).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> DbResult<User> {
        let mut conn = self.pool.get_connection().await?;
        let new_user = NewUser {
            id: Uuid::now_v7(),
            username,
            display_name,
            password_hash,
        };
        user::insert(&mut conn, &new_user)
            .await
            .map_err(missing(format!("user {username:?}")))
    }

    async fn get_user(&self, id: Uuid) -> DbResult<User> {
        let mut conn = self.pool.get_connection().await?;
        user::find_live(&mut conn, id)
            .await
            .map_err(missing(format!("user {id}")))
    }

    async fn find_user_by_username(&self, username: &str) -> DbResult<Option<User>> {
        let mut conn = self.pool.get_connection().await?;
        Ok(user::find_by_username(&mut conn, username).await?)
    }

    async fn set_refresh_token(&self, user_id: Uuid, token: Option<&str>) -> DbResult<()> {
        let mut conn = self.pool.get_connection().await?;
        let updated = user::set_refresh_token(&mut conn, user_id, token).await?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn user_roles(&self, user_id: Uuid) -> DbResult<Vec<i32>> {
        let mut conn = self.pool.get_connection().await?;
        user::find_live(&mut conn, user_id)
            .await
            .map_err(missing(format!("user {user_id}")))?;
        Ok(membership::roles_of_user(&mut conn, user_id).await?)
    }

    async fn replace_user_roles(
        &self,
        user_id: Uuid,
        role_ids: &[i32],
        actor: Option<Uuid>,
    ) -> DbResult<()> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                user::find_live(tx, user_id)
                    .await
                    .map_err(missing(format!("user {user_id}")))?;
                for role_id in role_ids {
                    role::find_live(tx, *role_id)
                        .await
                        .map_err(missing(format!("role {role_id}")))?;
                }
                let rows: Vec<NewUserRole> = role_ids
                    .iter()
                    .map(|role_id| NewUserRole {
                        user_id,
                        role_id: *role_id,
                        created_by: actor,
                    })
                    .collect();
                membership::replace_user_roles(tx, user_id, &rows).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn replace_user_groups(
        &self,
        user_id: Uuid,
        group_ids: &[i32],
        actor: Option<Uuid>,
    ) -> DbResult<()> {
        let mut conn = self.pool.get_connection().await?;
        with_transaction(&mut conn, |tx| {
            async move {
                user::find_live(tx, user_id)
                    .await
                    .map_err(missing(format!("user {user_id}")))?;
                for group_id in group_ids {
                    membership::find_group(tx, *group_id)
                        .await
                        .map_err(missing(format!("group {group_id}")))?;
                }
                let rows: Vec<NewUserGroup> = group_ids
                    .iter()
                    .map(|group_id| NewUserGroup {
                        user_id,
                        group_id: *group_id,
                        created_by: actor,
                    })
                    .collect();
                membership::replace_user_groups(tx, user_id, &rows).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn memberships(&self) -> DbResult<MembershipSnapshot> {
        let mut conn = self.pool.get_connection().await?;
        Ok(MembershipSnapshot {
            user_roles: membership::user_role_edges(&mut conn).await?,
            user_groups: membership::user_group_edges(&mut conn).await?,
            group_roles: membership::group_role_edges(&mut conn).await?,
            role_parents: role::parent_edges(&mut conn).await?,
        })
    }

    async fn all_grants(&self) -> DbResult<Vec<(i32, ResourceNode)>> {
        let mut conn = self.pool.get_connection().await?;
        Ok(role::all_grants(&mut conn).await?)
    }

    async fn effective_role_ids(&self, user_id: Uuid) -> DbResult<Vec<i32>> {
        let mut conn = self.pool.get_connection().await?;
        user::find_live(&mut conn, user_id)
            .await
            .map_err(missing(format!("user {user_id}")))?;
        let direct = membership::roles_of_user(&mut conn, user_id).await?;
        let groups = membership::groups_of_user(&mut conn, user_id).await?;
        let group_roles = membership::group_role_edges(&mut conn).await?;
        let role_parents = role::parent_edges(&mut conn).await?;
        Ok(reachable_roles(&direct, &groups, &group_roles, &role_parents))
    }

    async fn resources_for_roles(&self, role_ids: &[i32]) -> DbResult<Vec<ResourceNode>> {
        let mut conn = self.pool.get_connection().await?;
        Ok(role::resources_for_roles(&mut conn, role_ids).await?)
    }
}
