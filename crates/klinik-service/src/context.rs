use std::sync::Arc;

use salvo::async_trait;

use klinik_core::config::{AuthzConfig, JwtConfig};
use klinik_db::store::AuthzStore;

use crate::authz::engine::PolicyEngine;
use crate::authz::route_cache::RouteCache;
use crate::authz::service::Authorizer;
use crate::authz::sync::PolicySynchronizer;
use crate::cache::KvStore;
use crate::error::{ServiceError, ServiceResult};
use crate::session::manager::SessionManager;
use crate::session::token::TokenCodec;

/// Everything a request needs to authenticate and authorize, wired once at
/// startup and shared through the depot.
pub struct AuthzContext {
    pub store: Arc<dyn AuthzStore>,
    pub kv: Arc<dyn KvStore>,
    pub sync: Arc<PolicySynchronizer>,
    pub authorizer: Arc<Authorizer>,
    pub routes: Arc<RouteCache>,
    pub sessions: Arc<SessionManager>,
}

impl AuthzContext {
    /// ## Summary
    /// Wires the components, loads the engine from durable grants and warms
    /// the route cache.
    ///
    /// ## Errors
    /// Invalid JWT settings, or store, engine or cache failures during startup.
    #[tracing::instrument(skip_all)]
    pub async fn build(
        store: Arc<dyn AuthzStore>,
        engine: Arc<dyn PolicyEngine>,
        kv: Arc<dyn KvStore>,
        jwt: &JwtConfig,
        authz: &AuthzConfig,
    ) -> ServiceResult<Self> {
        let codec = TokenCodec::new(jwt)?;
        let routes = Arc::new(RouteCache::new(kv.clone(), store.clone()));
        let sync = Arc::new(PolicySynchronizer::new(
            store.clone(),
            engine,
            routes.clone(),
            authz.clone(),
        ));
        let authorizer = Arc::new(Authorizer::new(
            sync.clone(),
            store.clone(),
            authz.decision_timeout(),
        ));
        let sessions = Arc::new(SessionManager::new(
            codec,
            jwt.session_ttl(),
            kv.clone(),
            store.clone(),
            authorizer.clone(),
        ));

        let stats = sync.resync_all().await?;
        let routes_loaded = routes.warm().await?;
        tracing::info!(
            policy_count = stats.policy_count,
            grouping_count = stats.grouping_count,
            routes = routes_loaded,
            "Authorization context ready"
        );

        Ok(Self {
            store,
            kv,
            sync,
            authorizer,
            routes,
            sessions,
        })
    }
}

pub struct AuthzContextHandler {
    pub context: Arc<AuthzContext>,
}

#[async_trait]
impl salvo::Handler for AuthzContextHandler {
    #[tracing::instrument(skip(self, _req, depot, _res, _ctrl))]
    async fn handle(
        &self,
        _req: &mut salvo::Request,
        depot: &mut salvo::Depot,
        _res: &mut salvo::Response,
        _ctrl: &mut salvo::FlowCtrl,
    ) {
        depot.inject(self.context.clone());
    }
}

/// ## Summary
/// Retrieves the authorization context from the depot.
///
/// ## Errors
/// Returns an error if the context is not found in the depot.
pub fn get_context_from_depot(depot: &salvo::Depot) -> ServiceResult<Arc<AuthzContext>> {
    depot
        .obtain::<Arc<AuthzContext>>()
        .cloned()
        .map_err(|_err| ServiceError::InvariantViolation("Authorization context not found in depot"))
}
