use salvo::writing::Json;
use salvo::{Depot, Request, Router, handler};
use serde::{Deserialize, Serialize};

use klinik_db::model::user::User;
use klinik_service::password::hash_password;

use super::{actor, context, drop_cached_views, uuid_param};
use crate::error::{AppError, AppResult};

/// ## Summary
/// User creation payload
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub display_name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct UserRolesRequest {
    pub role_ids: Vec<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UserGroupsRequest {
    pub group_ids: Vec<i32>,
}

#[derive(Debug, Serialize)]
pub struct UserRolesResponse {
    /// Roles assigned to the user directly.
    pub direct: Vec<i32>,
    /// Roles reachable directly, through groups and through role parents.
    pub effective: Vec<i32>,
}

/// ## Summary
/// POST /api/users - Create a user with an Argon2 password hash
///
/// ## Errors
/// Returns HTTP 400 for empty fields and HTTP 409 for a taken username.
#[handler]
async fn create_user(req: &mut Request, depot: &mut Depot) -> AppResult<Json<User>> {
    let body: CreateUserRequest = req.parse_json().await?;
    let username = body.username.trim();
    if username.is_empty() || body.display_name.trim().is_empty() || body.password.is_empty() {
        return Err(AppError::BadRequest(
            "username, display_name and password are required".into(),
        ));
    }

    let password_hash = hash_password(&body.password)?;
    let user = context(depot)?
        .store
        .create_user(username, body.display_name.trim(), &password_hash)
        .await?;
    tracing::info!(user_id = %user.id, "User created");
    Ok(Json(user))
}

/// ## Summary
/// GET /api/users/{id}/roles - Direct and effective roles of a user
#[handler]
async fn user_roles(req: &mut Request, depot: &mut Depot) -> AppResult<Json<UserRolesResponse>> {
    let user_id = uuid_param(req)?;
    let context = context(depot)?;
    Ok(Json(UserRolesResponse {
        direct: context.store.user_roles(user_id).await?,
        effective: context.store.effective_role_ids(user_id).await?,
    }))
}

/// ## Summary
/// PUT /api/users/{id}/roles - Replace the roles assigned to a user
#[handler]
async fn set_user_roles(req: &mut Request, depot: &mut Depot) -> AppResult<Json<Vec<i32>>> {
    let user_id = uuid_param(req)?;
    let body: UserRolesRequest = req.parse_json().await?;
    let context = context(depot)?;

    context
        .sync
        .assign_user_roles(user_id, &body.role_ids, actor(depot))
        .await?;
    drop_cached_views(&context).await;
    Ok(Json(context.store.user_roles(user_id).await?))
}

/// ## Summary
/// PUT /api/users/{id}/groups - Replace the groups a user belongs to
#[handler]
async fn set_user_groups(req: &mut Request, depot: &mut Depot) -> AppResult<Json<Vec<i32>>> {
    let user_id = uuid_param(req)?;
    let body: UserGroupsRequest = req.parse_json().await?;
    let context = context(depot)?;

    context
        .sync
        .set_user_groups(user_id, &body.group_ids, actor(depot))
        .await?;
    drop_cached_views(&context).await;
    Ok(Json(body.group_ids))
}

#[must_use]
pub fn routes() -> Router {
    Router::with_path("users")
        .post(create_user)
        .push(
            Router::with_path("{id}/roles")
                .get(user_roles)
                .put(set_user_roles),
        )
        .push(Router::with_path("{id}/groups").put(set_user_groups))
}
