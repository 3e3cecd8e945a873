//! Depot helpers for carrying the authenticated identity and the resolved
//! route target through a Salvo request.

use crate::error::{ServiceError, ServiceResult};
use crate::session::identity::RequestIdentity;

use super::route_cache::RouteTarget;

pub mod depot_keys {
    pub const AUTHENTICATED_IDENTITY: &str = "__authenticated_identity";
    pub const ROUTE_TARGET: &str = "__route_target";
}

pub fn inject_identity(depot: &mut salvo::Depot, identity: RequestIdentity) {
    depot.insert(depot_keys::AUTHENTICATED_IDENTITY, identity);
}

/// Get the authenticated identity from the depot.
///
/// ## Errors
///
/// Returns `NotAuthenticated` if the authentication middleware did not run or
/// rejected the request.
pub fn identity_from_depot(depot: &salvo::Depot) -> ServiceResult<&RequestIdentity> {
    depot
        .get::<RequestIdentity>(depot_keys::AUTHENTICATED_IDENTITY)
        .map_err(|_e| ServiceError::NotAuthenticated)
}

/// Check if the request carries an authenticated identity.
#[must_use]
pub fn is_authenticated(depot: &salvo::Depot) -> bool {
    depot
        .get::<RequestIdentity>(depot_keys::AUTHENTICATED_IDENTITY)
        .is_ok()
}

pub fn inject_route_target(depot: &mut salvo::Depot, target: RouteTarget) {
    depot.insert(depot_keys::ROUTE_TARGET, target);
}

/// Get the route target resolved by the RBAC middleware.
///
/// ## Errors
/// Returns `InvariantViolation` if the RBAC middleware did not run.
pub fn route_target_from_depot(depot: &salvo::Depot) -> ServiceResult<&RouteTarget> {
    depot
        .get::<RouteTarget>(depot_keys::ROUTE_TARGET)
        .map_err(|_e| ServiceError::InvariantViolation("Route target not found in depot"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_depot() {
        let mut depot = salvo::Depot::new();
        assert!(!is_authenticated(&depot));
        assert!(matches!(
            identity_from_depot(&depot),
            Err(ServiceError::NotAuthenticated)
        ));

        let identity = RequestIdentity {
            user_id: uuid::Uuid::now_v7(),
            username: "siti".into(),
            display_name: "Siti".into(),
            session_id: uuid::Uuid::now_v7(),
            expires_at: chrono::Utc::now(),
        };
        inject_identity(&mut depot, identity.clone());

        assert!(is_authenticated(&depot));
        assert_eq!(identity_from_depot(&depot).unwrap(), &identity);
    }
}
