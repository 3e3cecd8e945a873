use salvo::writing::Json;
use salvo::{Depot, Request, Router, handler};
use serde::{Deserialize, Serialize};

use klinik_db::model::role::Role;
use klinik_service::authz::sync::SyncReport;

use super::{actor, context, drop_cached_views, id_param};
use crate::error::AppResult;

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub name: String,
}

/// ## Summary
/// Replacement grant set for a role. `expected_revision`, when given, must
/// match the role's current policy revision.
#[derive(Debug, Deserialize)]
pub struct RolePoliciesRequest {
    pub resource_ids: Vec<i32>,
    #[serde(default)]
    pub expected_revision: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RoleParentsRequest {
    pub parent_ids: Vec<i32>,
}

#[derive(Debug, Serialize)]
pub struct RoleDetail {
    #[serde(flatten)]
    pub role: Role,
    pub resource_ids: Vec<i32>,
}

#[derive(Debug, Serialize)]
pub struct RoleDeleted {
    pub deleted: i32,
}

#[handler]
async fn create_role(req: &mut Request, depot: &mut Depot) -> AppResult<Json<Role>> {
    let body: RoleRequest = req.parse_json().await?;
    let name = validated_name(&body.name)?;
    Ok(Json(context(depot)?.store.create_role(name, actor(depot)).await?))
}

#[handler]
async fn list_roles(depot: &mut Depot) -> AppResult<Json<Vec<Role>>> {
    Ok(Json(context(depot)?.store.list_roles().await?))
}

/// ## Summary
/// GET /api/users/roles/{id} - Role with its granted node ids
#[handler]
async fn get_role(req: &mut Request, depot: &mut Depot) -> AppResult<Json<RoleDetail>> {
    let id = id_param(req)?;
    let context = context(depot)?;
    let role = context.store.get_role(id).await?;
    let resource_ids = context
        .store
        .role_grants(id)
        .await?
        .into_iter()
        .map(|n| n.id)
        .collect();
    Ok(Json(RoleDetail { role, resource_ids }))
}

#[handler]
async fn rename_role(req: &mut Request, depot: &mut Depot) -> AppResult<Json<Role>> {
    let id = id_param(req)?;
    let body: RoleRequest = req.parse_json().await?;
    let name = validated_name(&body.name)?;
    Ok(Json(context(depot)?.store.rename_role(id, name, actor(depot)).await?))
}

/// ## Summary
/// DELETE /api/users/roles/{id} - Soft-delete a role and drop its engine state
#[handler]
async fn delete_role(req: &mut Request, depot: &mut Depot) -> AppResult<Json<RoleDeleted>> {
    let id = id_param(req)?;
    let context = context(depot)?;
    context.sync.delete_role(id, actor(depot)).await?;
    drop_cached_views(&context).await;
    Ok(Json(RoleDeleted { deleted: id }))
}

/// ## Summary
/// PUT /api/users/roles/policies/{id} - Replace the role's grant set and
/// synchronize the enforcement engine
///
/// ## Errors
/// Returns HTTP 409 when `expected_revision` is stale, and HTTP 500 with the
/// role and resource ids when the engine could not be brought in line.
#[handler]
async fn sync_policies(req: &mut Request, depot: &mut Depot) -> AppResult<Json<SyncReport>> {
    let id = id_param(req)?;
    let body: RolePoliciesRequest = req.parse_json().await?;
    let context = context(depot)?;

    let report = context
        .sync
        .sync_role_policies(id, &body.resource_ids, actor(depot), body.expected_revision)
        .await?;
    drop_cached_views(&context).await;
    Ok(Json(report))
}

/// ## Summary
/// PUT /api/users/roles/{id}/parents - Replace the roles this role inherits from
#[handler]
async fn set_parents(req: &mut Request, depot: &mut Depot) -> AppResult<Json<RoleDetail>> {
    let id = id_param(req)?;
    let body: RoleParentsRequest = req.parse_json().await?;
    let context = context(depot)?;

    context
        .sync
        .set_role_parents(id, &body.parent_ids, actor(depot))
        .await?;
    drop_cached_views(&context).await;

    let role = context.store.get_role(id).await?;
    let resource_ids = context
        .store
        .role_grants(id)
        .await?
        .into_iter()
        .map(|n| n.id)
        .collect();
    Ok(Json(RoleDetail { role, resource_ids }))
}

pub(super) fn validated_name(name: &str) -> AppResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(crate::error::AppError::BadRequest("name must not be empty".into()));
    }
    Ok(name)
}

#[must_use]
pub fn routes() -> Router {
    Router::with_path("users/roles")
        .post(create_role)
        .get(list_roles)
        .push(Router::with_path("policies/{id:num}").put(sync_policies))
        .push(Router::with_path("{id:num}/parents").put(set_parents))
        .push(
            Router::with_path("{id:num}")
                .get(get_role)
                .put(rename_role)
                .delete(delete_role),
        )
}
