//! Session lifecycle: issue, validate, refresh and revoke.
//!
//! A session is an access token plus a marker `session:v1:{user}:{sid}` in the
//! key-value cache that lives as long as the access token is accepted,
//! leeway included. The refresh token is persisted on the user row; a refresh
//! is honoured only for the stored token and rotates it. Refresh and revoke
//! for one user are serialized on a per-user lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use klinik_core::constants::{SESSION_KEY_PREFIX, VIEW_KEY_PREFIX};
use klinik_db::error::DbError;
use klinik_db::store::AuthzStore;

use crate::authz::service::Authorizer;
use crate::authz::tree::MenuNode;
use crate::cache::KvStore;
use crate::error::ServiceResult;

use super::identity::{RequestIdentity, VerifiedIdentity};
use super::token::{TokenCodec, TokenError, TokenKind};

/// Token pair handed to the client at login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub session_id: uuid::Uuid,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

fn session_key(user_id: uuid::Uuid, session_id: uuid::Uuid) -> String {
    format!("{SESSION_KEY_PREFIX}{user_id}:{session_id}")
}

fn view_key(user_id: uuid::Uuid) -> String {
    format!("{VIEW_KEY_PREFIX}{user_id}")
}

pub struct SessionManager {
    codec: TokenCodec,
    kv: Arc<dyn KvStore>,
    store: Arc<dyn AuthzStore>,
    authorizer: Arc<Authorizer>,
    session_ttl: Duration,
    refresh_locks: DashMap<uuid::Uuid, Arc<Mutex<()>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        codec: TokenCodec,
        session_ttl: Duration,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn AuthzStore>,
        authorizer: Arc<Authorizer>,
    ) -> Self {
        Self {
            codec,
            kv,
            store,
            authorizer,
            session_ttl,
            refresh_locks: DashMap::new(),
        }
    }

    fn refresh_lock(&self, user_id: uuid::Uuid) -> Arc<Mutex<()>> {
        self.refresh_locks.entry(user_id).or_default().clone()
    }

    /// ## Summary
    /// Starts a session for a verified identity: mints both tokens, persists
    /// the refresh token, writes the session marker and caches the user's view.
    ///
    /// ## Errors
    /// Signing, store or cache failures.
    #[tracing::instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn issue(&self, identity: &VerifiedIdentity) -> ServiceResult<IssuedTokens> {
        let tokens = self.mint_pair(identity).await?;
        tracing::info!(session_id = %tokens.session_id, "Session issued");
        Ok(tokens)
    }

    async fn mint_pair(&self, identity: &VerifiedIdentity) -> ServiceResult<IssuedTokens> {
        let now = Utc::now();
        let session_id = uuid::Uuid::now_v7();
        let (access_token, access) =
            self.codec
                .mint(TokenKind::Access, identity, Some(session_id), now)?;
        let (refresh_token, refresh) = self.codec.mint(TokenKind::Refresh, identity, None, now)?;

        // The previous refresh token stops working once this write lands.
        self.store
            .set_refresh_token(identity.user_id, Some(&refresh_token))
            .await?;
        self.kv
            .set(
                &session_key(identity.user_id, session_id),
                &access.jti.to_string(),
                Some(self.session_ttl),
            )
            .await?;
        self.cache_view(identity.user_id).await;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            token_type: "Bearer",
            session_id,
            access_expires_at: access.expires_at(),
            refresh_expires_at: refresh.expires_at(),
        })
    }

    /// ## Summary
    /// Validates an access token: signature, algorithm, issuer, claim shape,
    /// token kind, then the session marker.
    ///
    /// ## Errors
    /// `ServiceError::Token` carrying the specific failure.
    pub async fn validate_access(&self, token: &str) -> ServiceResult<RequestIdentity> {
        let claims = self.codec.verify(token, TokenKind::Access).inspect_err(|err| {
            tracing::debug!(error = %err, "Access token rejected");
        })?;
        let session_id = claims
            .sid
            .ok_or_else(|| TokenError::Malformed("access token without sid".into()))?;

        if !self.kv.exists(&session_key(claims.sub, session_id)).await? {
            tracing::debug!(user_id = %claims.sub, %session_id, "Session marker absent");
            return Err(TokenError::Revoked.into());
        }

        Ok(RequestIdentity {
            user_id: claims.sub,
            username: claims.username.clone(),
            display_name: claims.name.clone(),
            session_id,
            expires_at: claims.expires_at(),
        })
    }

    /// ## Summary
    /// Exchanges a refresh token for a new pair. Only the token currently
    /// stored for the user is accepted; the new refresh token is persisted
    /// before it is returned, so a replayed old token is `Revoked`.
    ///
    /// ## Errors
    /// `ServiceError::Token` for a rejected token, store or cache failures.
    #[tracing::instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> ServiceResult<IssuedTokens> {
        let claims = self
            .codec
            .verify(refresh_token, TokenKind::Refresh)
            .inspect_err(|err| tracing::debug!(error = %err, "Refresh token rejected"))?;

        let lock = self.refresh_lock(claims.sub);
        let _guard = lock.lock().await;

        let user = match self.store.get_user(claims.sub).await {
            Ok(user) => user,
            Err(DbError::NotFound(_)) => return Err(TokenError::Revoked.into()),
            Err(err) => return Err(err.into()),
        };
        if user.refresh_token.as_deref() != Some(refresh_token) {
            tracing::warn!(user_id = %user.id, "Refresh token does not match stored token; possible replay");
            return Err(TokenError::Revoked.into());
        }

        let tokens = self.mint_pair(&VerifiedIdentity::from(&user)).await?;
        tracing::info!(user_id = %user.id, session_id = %tokens.session_id, "Session refreshed");
        Ok(tokens)
    }

    /// ## Summary
    /// Ends every session of the user: clears the stored refresh token and
    /// deletes all session markers and the cached view. Returns the number of
    /// sessions ended. Waits for an in-flight refresh of the same user, so a
    /// refresh never re-mints a session after it.
    ///
    /// ## Errors
    /// Store or cache failures.
    #[tracing::instrument(skip(self))]
    pub async fn revoke(&self, user_id: uuid::Uuid) -> ServiceResult<usize> {
        let lock = self.refresh_lock(user_id);
        let _guard = lock.lock().await;

        self.store.set_refresh_token(user_id, None).await?;
        let ended = self
            .kv
            .delete_prefix(&format!("{SESSION_KEY_PREFIX}{user_id}:"))
            .await?;
        self.kv.delete(&view_key(user_id)).await?;
        tracing::info!(sessions = ended, "Sessions revoked");
        Ok(ended)
    }

    /// ## Summary
    /// Returns the user's menu view, from cache when present.
    ///
    /// ## Errors
    /// Store failures while rebuilding; `NotFound` for an unknown user.
    pub async fn user_view(&self, user_id: uuid::Uuid) -> ServiceResult<Vec<MenuNode>> {
        let key = view_key(user_id);
        if let Some(cached) = self.kv.get(&key).await? {
            match serde_json::from_str(&cached) {
                Ok(view) => return Ok(view),
                Err(err) => {
                    tracing::warn!(%user_id, error = %err, "Discarding unreadable cached view");
                }
            }
        }
        let view = self.authorizer.user_menu(user_id).await?;
        self.kv
            .set(&key, &serde_json::to_string(&view)?, Some(self.session_ttl))
            .await?;
        Ok(view)
    }

    /// Drops every cached user view. Called after grant or membership edits.
    ///
    /// ## Errors
    /// Cache failures.
    pub async fn invalidate_views(&self) -> ServiceResult<usize> {
        self.kv.delete_prefix(VIEW_KEY_PREFIX).await
    }

    async fn cache_view(&self, user_id: uuid::Uuid) {
        if let Err(err) = self.kv.delete(&view_key(user_id)).await {
            tracing::warn!(%user_id, error = %err, "Failed to drop cached view");
            return;
        }
        if let Err(err) = self.user_view(user_id).await {
            tracing::warn!(%user_id, error = %err, "Failed to cache user view");
        }
    }
}
