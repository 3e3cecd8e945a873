use salvo::writing::Json;
use salvo::{Depot, Request, Router, handler};
use serde::Serialize;

use klinik_service::authz::sync::{SyncTarget, VerifyReport};

use super::{context, drop_cached_views, id_param};
use crate::error::AppResult;

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub policy_count: usize,
    pub grouping_count: usize,
    pub routes: usize,
}

/// ## Summary
/// POST /api/admin/reload - Rebuild the engine from durable grants and rewarm
/// the route cache
#[handler]
async fn reload(depot: &mut Depot) -> AppResult<Json<ReloadResponse>> {
    let context = context(depot)?;
    let stats = context.sync.resync_all().await?;
    let routes = context.routes.rewarm().await?;
    drop_cached_views(&context).await;

    tracing::info!(
        policy_count = stats.policy_count,
        grouping_count = stats.grouping_count,
        routes,
        "Administrative reload complete"
    );
    Ok(Json(ReloadResponse {
        policy_count: stats.policy_count,
        grouping_count: stats.grouping_count,
        routes,
    }))
}

/// ## Summary
/// GET /api/admin/verify/{id} - Compare a role's engine tuples with its
/// durable grants
#[handler]
async fn verify(req: &mut Request, depot: &mut Depot) -> AppResult<Json<VerifyReport>> {
    let role_id = id_param(req)?;
    Ok(Json(context(depot)?.sync.verify_role(role_id).await?))
}

/// ## Summary
/// GET /api/admin/pending - Engine targets awaiting reconciliation
#[handler]
async fn pending(depot: &mut Depot) -> AppResult<Json<Vec<SyncTarget>>> {
    Ok(Json(context(depot)?.sync.pending_targets()))
}

#[must_use]
pub fn routes() -> Router {
    Router::with_path("admin")
        .push(Router::with_path("reload").post(reload))
        .push(Router::with_path("verify/{id:num}").get(verify))
        .push(Router::with_path("pending").get(pending))
}
