//! The durable store behind the authorization core.
//!
//! `AuthzStore` is the only way the service layer touches persisted RBAC
//! state. [`pg::PgStore`] backs it with Postgres; [`memory::MemoryStore`]
//! keeps the same semantics in process for tests and local runs.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::model::grant::{GrantSyncOutcome, MembershipSnapshot};
use crate::model::group::Group;
use crate::model::resource::{ResourceNode, ResourceNodeInput};
use crate::model::role::Role;
use crate::model::user::User;

/// A `(path, method) -> (resource key, action)` row derived from a live
/// resource node carrying route metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMapping {
    pub path: String,
    pub method: String,
    pub resource_key: String,
    pub action: String,
}

impl RouteMapping {
    #[must_use]
    pub fn from_node(node: &ResourceNode) -> Option<Self> {
        if node.is_deleted() {
            return None;
        }
        let (path, method) = node.route()?;
        Some(Self {
            path: path.to_string(),
            method: method.to_string(),
            resource_key: node.resource_key.clone(),
            action: node.action.clone(),
        })
    }
}

/// Optimistic revision check shared by both stores.
pub(crate) fn check_revision(role_id: i32, stored: i64, expected: Option<i64>) -> DbResult<()> {
    match expected {
        Some(expected) if expected != stored => Err(DbError::Conflict(format!(
            "role {role_id} is at revision {stored}, expected {expected}"
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
pub trait AuthzStore: Send + Sync {
    // Resource catalogue

    /// Live nodes ordered by id.
    async fn list_resources(&self) -> DbResult<Vec<ResourceNode>>;
    async fn get_resource(&self, id: i32) -> DbResult<ResourceNode>;
    /// Input must already be validated.
    async fn create_resource(
        &self,
        input: &ResourceNodeInput,
        actor: Option<Uuid>,
    ) -> DbResult<ResourceNode>;
    async fn update_resource(
        &self,
        id: i32,
        input: &ResourceNodeInput,
        actor: Option<Uuid>,
    ) -> DbResult<ResourceNode>;
    /// Soft-deletes the node and its live descendants; returns the affected ids.
    async fn soft_delete_resource(&self, id: i32, actor: Option<Uuid>) -> DbResult<Vec<i32>>;
    async fn route_mappings(&self) -> DbResult<Vec<RouteMapping>>;
    async fn route_mappings_for_key(&self, resource_key: &str) -> DbResult<Vec<RouteMapping>>;

    // Roles and grants

    async fn list_roles(&self) -> DbResult<Vec<Role>>;
    async fn get_role(&self, id: i32) -> DbResult<Role>;
    async fn create_role(&self, name: &str, actor: Option<Uuid>) -> DbResult<Role>;
    async fn rename_role(&self, id: i32, name: &str, actor: Option<Uuid>) -> DbResult<Role>;
    /// Soft-deletes the role and drops its grants and memberships.
    async fn soft_delete_role(&self, id: i32, actor: Option<Uuid>) -> DbResult<Role>;

    /// Live resource nodes granted to the role, ordered by id.
    async fn role_grants(&self, role_id: i32) -> DbResult<Vec<ResourceNode>>;

    /// ## Summary
    /// Replaces the role's grant set in one transaction: expands the requested
    /// ids with live descendants, deletes stale grants, inserts missing ones,
    /// bumps `policy_revision` and reads the final grant set back.
    ///
    /// ## Errors
    /// `Conflict` when `expected_revision` differs from the stored revision,
    /// `NotFound` for an unknown role or a requested id that is not a live node.
    async fn replace_role_grants(
        &self,
        role_id: i32,
        resource_ids: &[i32],
        actor: Option<Uuid>,
        expected_revision: Option<i64>,
    ) -> DbResult<GrantSyncOutcome>;

    /// Roles holding a grant on any of the given nodes.
    async fn roles_granting(&self, resource_ids: &[i32]) -> DbResult<Vec<i32>>;

    async fn replace_role_parents(
        &self,
        role_id: i32,
        parent_ids: &[i32],
        actor: Option<Uuid>,
    ) -> DbResult<()>;

    // Groups

    async fn list_groups(&self) -> DbResult<Vec<Group>>;
    async fn get_group(&self, id: i32) -> DbResult<Group>;
    async fn create_group(&self, name: &str, actor: Option<Uuid>) -> DbResult<Group>;
    async fn rename_group(&self, id: i32, name: &str, actor: Option<Uuid>) -> DbResult<Group>;
    /// Soft-deletes the group and drops its role grants and memberships.
    async fn soft_delete_group(&self, id: i32, actor: Option<Uuid>) -> DbResult<Group>;
    async fn replace_group_roles(
        &self,
        group_id: i32,
        role_ids: &[i32],
        actor: Option<Uuid>,
    ) -> DbResult<()>;

    // Users

    async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> DbResult<User>;
    async fn get_user(&self, id: Uuid) -> DbResult<User>;
    async fn find_user_by_username(&self, username: &str) -> DbResult<Option<User>>;
    async fn set_refresh_token(&self, user_id: Uuid, token: Option<&str>) -> DbResult<()>;
    async fn user_roles(&self, user_id: Uuid) -> DbResult<Vec<i32>>;
    async fn replace_user_roles(
        &self,
        user_id: Uuid,
        role_ids: &[i32],
        actor: Option<Uuid>,
    ) -> DbResult<()>;
    async fn replace_user_groups(
        &self,
        user_id: Uuid,
        group_ids: &[i32],
        actor: Option<Uuid>,
    ) -> DbResult<()>;

    // Projections

    /// Every membership edge between live users, groups and roles.
    async fn memberships(&self) -> DbResult<MembershipSnapshot>;

    /// Live grants of every live role as `(role id, node)`.
    async fn all_grants(&self) -> DbResult<Vec<(i32, ResourceNode)>>;

    /// Roles reachable from the user directly, via groups, and via role parents.
    async fn effective_role_ids(&self, user_id: Uuid) -> DbResult<Vec<i32>>;

    /// Distinct live nodes granted to any of the roles, ordered by id.
    async fn resources_for_roles(&self, role_ids: &[i32]) -> DbResult<Vec<ResourceNode>>;
}
