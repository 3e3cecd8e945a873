mod admin;
mod auth;
mod groups;
mod healthcheck;
mod permissions;
mod roles;
mod users;

use std::sync::Arc;

use salvo::{Depot, Request, Router};

use klinik_service::authz::depot::identity_from_depot;
use klinik_service::context::{AuthzContext, get_context_from_depot};

use crate::error::{AppError, AppResult};
use crate::middleware::{auth::AuthMiddleware, rbac::RbacMiddleware};

pub use klinik_core::constants::{API_ROUTE_COMPONENT, API_ROUTE_PREFIX};

/// ## Summary
/// Constructs the API router.
///
/// Login, refresh and the healthcheck are public. Logout and the caller's own
/// menu view need a valid access token. Everything else also passes the RBAC
/// middleware.
#[must_use]
pub fn routes() -> Router {
    Router::with_path(API_ROUTE_COMPONENT)
        .push(healthcheck::routes())
        .push(auth::routes())
        .push(
            Router::new()
                .hoop(AuthMiddleware)
                .push(permissions::self_routes()),
        )
        .push(
            Router::new()
                .hoop(AuthMiddleware)
                .hoop(RbacMiddleware)
                .push(permissions::routes())
                .push(roles::routes())
                .push(groups::routes())
                .push(users::routes())
                .push(admin::routes()),
        )
}

fn context(depot: &Depot) -> AppResult<Arc<AuthzContext>> {
    Ok(get_context_from_depot(depot)?)
}

/// The authenticated caller, recorded as the actor on audited writes.
fn actor(depot: &Depot) -> Option<uuid::Uuid> {
    identity_from_depot(depot).ok().map(|identity| identity.user_id)
}

fn id_param(req: &Request) -> AppResult<i32> {
    req.param::<i32>("id")
        .ok_or_else(|| AppError::BadRequest("path parameter `id` must be an integer".into()))
}

fn uuid_param(req: &Request) -> AppResult<uuid::Uuid> {
    req.param::<uuid::Uuid>("id")
        .ok_or_else(|| AppError::BadRequest("path parameter `id` must be a UUID".into()))
}

/// Cached menu views go stale after grant or membership edits.
async fn drop_cached_views(context: &AuthzContext) {
    if let Err(e) = context.sessions.invalidate_views().await {
        tracing::warn!(error = %e, "Failed to drop cached user views");
    }
}
