use salvo::writing::Json;
use salvo::{Depot, Request, Router, handler};
use serde::Serialize;

use klinik_db::model::resource::{ResourceNode, ResourceNodeInput};
use klinik_service::authz::MenuNode;
use klinik_service::authz::depot::identity_from_depot;

use super::{actor, context, drop_cached_views, id_param};
use crate::error::AppResult;

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted_ids: Vec<i32>,
}

/// ## Summary
/// GET /api/permissions/tree - Full resource forest
#[handler]
async fn tree(depot: &mut Depot) -> AppResult<Json<Vec<MenuNode>>> {
    Ok(Json(context(depot)?.authorizer.resource_tree().await?))
}

/// ## Summary
/// GET /api/permissions/users - Menu of the calling user
#[handler]
async fn own_view(depot: &mut Depot) -> AppResult<Json<Vec<MenuNode>>> {
    let user_id = identity_from_depot(depot)?.user_id;
    Ok(Json(context(depot)?.sessions.user_view(user_id).await?))
}

/// ## Summary
/// GET /api/permissions/role/{id} - Menu granted to a role
#[handler]
async fn role_view(req: &mut Request, depot: &mut Depot) -> AppResult<Json<Vec<MenuNode>>> {
    let role_id = id_param(req)?;
    Ok(Json(context(depot)?.authorizer.role_menu(role_id).await?))
}

#[handler]
async fn list_nodes(depot: &mut Depot) -> AppResult<Json<Vec<ResourceNode>>> {
    Ok(Json(context(depot)?.store.list_resources().await?))
}

#[handler]
async fn get_node(req: &mut Request, depot: &mut Depot) -> AppResult<Json<ResourceNode>> {
    let id = id_param(req)?;
    Ok(Json(context(depot)?.store.get_resource(id).await?))
}

/// ## Summary
/// POST /api/permissions - Create a resource node
///
/// ## Side Effects
/// Marks the node's resource key for a route cache reload.
#[handler]
async fn create_node(req: &mut Request, depot: &mut Depot) -> AppResult<Json<ResourceNode>> {
    let input = req.parse_json::<ResourceNodeInput>().await?.validate()?;
    let context = context(depot)?;

    let node = context.store.create_resource(&input, actor(depot)).await?;
    context
        .sync
        .resources_changed(&[node.id], std::slice::from_ref(&node.resource_key))
        .await?;
    drop_cached_views(&context).await;

    tracing::info!(id = node.id, resource_key = %node.resource_key, "Resource node created");
    Ok(Json(node))
}

/// ## Summary
/// PUT /api/permissions/{id} - Replace a resource node
///
/// ## Side Effects
/// Resyncs every role granted the node and invalidates routes of both the
/// old and the new resource key.
#[handler]
async fn update_node(req: &mut Request, depot: &mut Depot) -> AppResult<Json<ResourceNode>> {
    let id = id_param(req)?;
    let input = req.parse_json::<ResourceNodeInput>().await?.validate()?;
    let context = context(depot)?;

    let before = context.store.get_resource(id).await?;
    let node = context.store.update_resource(id, &input, actor(depot)).await?;

    let mut keys = vec![before.resource_key];
    if node.resource_key != keys[0] {
        keys.push(node.resource_key.clone());
    }
    context.sync.resources_changed(&[id], &keys).await?;
    drop_cached_views(&context).await;

    Ok(Json(node))
}

/// ## Summary
/// DELETE /api/permissions/{id} - Soft-delete a node and its subtree
#[handler]
async fn delete_node(req: &mut Request, depot: &mut Depot) -> AppResult<Json<DeleteResponse>> {
    let id = id_param(req)?;
    let context = context(depot)?;

    let before = context.store.list_resources().await?;
    let deleted_ids = context.store.soft_delete_resource(id, actor(depot)).await?;
    let keys: Vec<String> = before
        .into_iter()
        .filter(|n| deleted_ids.contains(&n.id))
        .map(|n| n.resource_key)
        .collect();
    context.sync.resources_changed(&deleted_ids, &keys).await?;
    drop_cached_views(&context).await;

    tracing::info!(id, deleted = deleted_ids.len(), "Resource subtree deleted");
    Ok(Json(DeleteResponse { deleted_ids }))
}

/// Routes open to any authenticated caller.
#[must_use]
pub fn self_routes() -> Router {
    Router::with_path("permissions/users").get(own_view)
}

#[must_use]
pub fn routes() -> Router {
    Router::with_path("permissions")
        .post(create_node)
        .get(list_nodes)
        .push(Router::with_path("tree").get(tree))
        .push(Router::with_path("role/{id:num}").get(role_view))
        .push(
            Router::with_path("{id:num}")
                .get(get_node)
                .put(update_node)
                .delete(delete_node),
        )
}
