use salvo::writing::Json;
use salvo::{Depot, Request, Router, handler};
use serde::{Deserialize, Serialize};

use klinik_core::constants::AUTH_ROUTE_COMPONENT;
use klinik_service::authz::depot::identity_from_depot;
use klinik_service::error::ServiceError;
use klinik_service::password::authenticate;
use klinik_service::session::{IssuedTokens, TokenError};

use super::context;
use crate::error::AppResult;
use crate::middleware::auth::{AuthMiddleware, bearer_token};

/// ## Summary
/// Login request payload
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// ## Summary
/// Refresh request payload, used when the token is not sent as a bearer header.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub revoked_sessions: usize,
}

/// ## Summary
/// POST /api/auth/login - Verify credentials and start a session
///
/// ## Errors
/// Returns HTTP 401 for unknown users or wrong passwords.
#[handler]
async fn login(req: &mut Request, depot: &mut Depot) -> AppResult<Json<IssuedTokens>> {
    let body: LoginRequest = req.parse_json().await?;
    let context = context(depot)?;

    let identity = authenticate(context.store.as_ref(), &body.username, &body.password).await?;
    let tokens = context.sessions.issue(&identity).await?;
    Ok(Json(tokens))
}

/// ## Summary
/// GET|POST /api/auth/refresh - Exchange a refresh token for a new token pair.
/// The refresh token is read from the bearer header, or from a JSON body.
///
/// ## Errors
/// Returns HTTP 401 with the token failure code when the token is rejected.
#[handler]
async fn refresh(req: &mut Request, depot: &mut Depot) -> AppResult<Json<IssuedTokens>> {
    let bearer = bearer_token(req).map(str::to_string);
    let token = match bearer {
        Some(token) => token,
        None if req.method() == salvo::http::Method::POST => {
            req.parse_json::<RefreshRequest>().await?.refresh_token
        }
        None => return Err(ServiceError::Token(TokenError::Missing).into()),
    };
    let context = context(depot)?;
    Ok(Json(context.sessions.refresh(&token).await?))
}

/// ## Summary
/// DELETE /api/auth/logout - End every session of the caller
#[handler]
async fn logout(depot: &mut Depot) -> AppResult<Json<LogoutResponse>> {
    let user_id = identity_from_depot(depot)?.user_id;
    let context = context(depot)?;
    let revoked_sessions = context.sessions.revoke(user_id).await?;
    Ok(Json(LogoutResponse { revoked_sessions }))
}

#[must_use]
pub fn routes() -> Router {
    Router::with_path(AUTH_ROUTE_COMPONENT)
        .push(Router::with_path("login").post(login))
        .push(Router::with_path("refresh").get(refresh).post(refresh))
        .push(
            Router::with_path("logout")
                .hoop(AuthMiddleware)
                .delete(logout),
        )
}
