use salvo::writing::Json;
use salvo::{Depot, Request, Router, handler};
use serde::{Deserialize, Serialize};

use klinik_db::model::group::Group;

use super::roles::validated_name;
use super::{actor, context, drop_cached_views, id_param};
use crate::error::AppResult;

#[derive(Debug, Deserialize)]
pub struct GroupRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupRolesRequest {
    pub role_ids: Vec<i32>,
}

#[handler]
async fn create_group(req: &mut Request, depot: &mut Depot) -> AppResult<Json<Group>> {
    let body: GroupRequest = req.parse_json().await?;
    let name = validated_name(&body.name)?;
    Ok(Json(context(depot)?.store.create_group(name, actor(depot)).await?))
}

#[derive(Debug, Serialize)]
pub struct GroupDetail {
    #[serde(flatten)]
    pub group: Group,
    pub role_ids: Vec<i32>,
}

#[derive(Debug, Serialize)]
pub struct GroupDeleted {
    pub deleted: i32,
}

#[handler]
async fn list_groups(depot: &mut Depot) -> AppResult<Json<Vec<Group>>> {
    Ok(Json(context(depot)?.store.list_groups().await?))
}

/// ## Summary
/// GET /api/users/groups/{id} - Group with the roles it confers
#[handler]
async fn get_group(req: &mut Request, depot: &mut Depot) -> AppResult<Json<GroupDetail>> {
    let id = id_param(req)?;
    let context = context(depot)?;
    let group = context.store.get_group(id).await?;
    let role_ids = context
        .store
        .memberships()
        .await?
        .group_roles
        .into_iter()
        .filter(|(group_id, _)| *group_id == id)
        .map(|(_, role_id)| role_id)
        .collect();
    Ok(Json(GroupDetail { group, role_ids }))
}

#[handler]
async fn rename_group(req: &mut Request, depot: &mut Depot) -> AppResult<Json<Group>> {
    let id = id_param(req)?;
    let body: GroupRequest = req.parse_json().await?;
    let name = validated_name(&body.name)?;
    Ok(Json(context(depot)?.store.rename_group(id, name, actor(depot)).await?))
}

/// ## Summary
/// DELETE /api/users/groups/{id} - Soft-delete a group; its members lose the
/// roles they held through it
#[handler]
async fn delete_group(req: &mut Request, depot: &mut Depot) -> AppResult<Json<GroupDeleted>> {
    let id = id_param(req)?;
    let context = context(depot)?;
    context.sync.delete_group(id, actor(depot)).await?;
    drop_cached_views(&context).await;
    Ok(Json(GroupDeleted { deleted: id }))
}

/// ## Summary
/// PUT /api/users/groups/{id}/roles - Replace the roles a group confers
#[handler]
async fn set_group_roles(req: &mut Request, depot: &mut Depot) -> AppResult<Json<Vec<i32>>> {
    let id = id_param(req)?;
    let body: GroupRolesRequest = req.parse_json().await?;
    let context = context(depot)?;

    context
        .sync
        .assign_group_roles(id, &body.role_ids, actor(depot))
        .await?;
    drop_cached_views(&context).await;
    Ok(Json(body.role_ids))
}

#[must_use]
pub fn routes() -> Router {
    Router::with_path("users/groups")
        .post(create_group)
        .get(list_groups)
        .push(Router::with_path("{id:num}/roles").put(set_group_roles))
        .push(
            Router::with_path("{id:num}")
                .get(get_group)
                .put(rename_group)
                .delete(delete_group),
        )
}
