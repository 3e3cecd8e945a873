use salvo::Depot;

use klinik_service::authz::depot::{identity_from_depot, inject_route_target};
use klinik_service::context::get_context_from_depot;
use klinik_service::error::ServiceError;

use crate::error::{AppError, AppResult, render_error};

/// ## Summary
/// Route-based authorization middleware. Resolves `(method, path)` to a
/// resource key and action through the route cache, then asks the authorizer.
/// Must run after [`super::auth::AuthMiddleware`].
///
/// Fails closed: an unmapped route, a denial, a timeout and an engine error
/// all stop the request.
#[salvo::async_trait]
impl salvo::Handler for RbacMiddleware {
    #[tracing::instrument(skip(self, req, depot, res, ctrl), fields(
        method = %req.method(),
        path = %req.uri().path()
    ))]
    async fn handle(
        &self,
        req: &mut salvo::Request,
        depot: &mut Depot,
        res: &mut salvo::Response,
        ctrl: &mut salvo::FlowCtrl,
    ) {
        if let Err(e) = authorize(req, depot).await {
            render_error(res, &e);
            ctrl.skip_rest();
        }
    }
}

async fn authorize(req: &salvo::Request, depot: &mut Depot) -> AppResult<()> {
    let context = get_context_from_depot(depot)?;
    let subject = identity_from_depot(depot)?.subject();

    let method = req.method().as_str();
    let path = req.uri().path();
    let Some(target) = context.routes.lookup(method, path).await? else {
        return Err(AppError::ServiceError(ServiceError::NotConfigured {
            method: method.to_string(),
            path: path.to_string(),
        }));
    };

    context
        .authorizer
        .check(subject, &target.resource_key, &target.action, None)
        .await?
        .require(&target.resource_key, &target.action)?;

    tracing::trace!(
        resource_key = %target.resource_key,
        action = %target.action,
        "Route authorized"
    );
    inject_route_target(depot, target);
    Ok(())
}

/// ## Summary
/// Middleware handler for route authorization.
pub struct RbacMiddleware;
