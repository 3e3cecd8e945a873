use salvo::Depot;
use salvo::http::header::AUTHORIZATION;

use klinik_service::authz::depot::inject_identity;
use klinik_service::context::get_context_from_depot;
use klinik_service::error::ServiceError;
use klinik_service::session::TokenError;

use crate::error::{AppError, render_error};

/// Returns the bearer token of the request, if any.
#[must_use]
pub fn bearer_token(req: &salvo::Request) -> Option<&str> {
    parse_bearer(req.headers().get(AUTHORIZATION)?.to_str().ok()?)
}

fn parse_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// ## Summary
/// Authentication middleware. Validates the bearer access token and stores the
/// request identity in the depot.
///
/// ## Errors
/// Responds 401 with the token failure code (`token_expired`, `token_revoked`,
/// ...) when the token is missing or invalid.
#[salvo::async_trait]
impl salvo::Handler for AuthMiddleware {
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
        tracing::trace!("Authenticating request");

        let context = match get_context_from_depot(depot) {
            Ok(context) => context,
            Err(e) => {
                render_error(res, &AppError::from(e));
                ctrl.skip_rest();
                return;
            }
        };

        let Some(token) = bearer_token(req) else {
            render_error(res, &ServiceError::Token(TokenError::Missing).into());
            ctrl.skip_rest();
            return;
        };

        match context.sessions.validate_access(token).await {
            Ok(identity) => {
                tracing::debug!(user_id = %identity.user_id, "Request authenticated");
                inject_identity(depot, identity);
            }
            Err(e) => {
                render_error(res, &AppError::from(e));
                ctrl.skip_rest();
            }
        }
    }
}

/// ## Summary
/// Middleware handler for authentication.
/// Use this as a hoop on routes that require a valid access token.
pub struct AuthMiddleware;
