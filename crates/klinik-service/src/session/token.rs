//! Signed, time-bound session tokens.
//!
//! Access and refresh tokens are HS256 JWTs signed with separate secrets. The
//! verifier pins the algorithm, the issuer and the exact claim shape, and
//! reports failures by kind so the HTTP layer can answer each distinctly.

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use klinik_core::config::JwtConfig;

use crate::error::{ServiceError, ServiceResult};

use super::identity::VerifiedIdentity;

const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    const fn other(self) -> Self {
        match self {
            Self::Access => Self::Refresh,
            Self::Refresh => Self::Access,
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        })
    }
}

/// JWT claims. Unknown fields are rejected; `sid` is present on access tokens only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Claims {
    pub sub: uuid::Uuid,
    pub name: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<uuid::Uuid>,
    pub typ: TokenKind,
    pub jti: uuid::Uuid,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Missing bearer token")]
    Missing,

    #[error("Token expired")]
    Expired,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Session revoked")]
    Revoked,

    #[error("Expected {expected} token, got {found} token")]
    WrongTokenType {
        expected: TokenKind,
        found: TokenKind,
    },
}

impl TokenError {
    /// Stable machine-readable code for responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Missing => "token_missing",
            Self::Expired => "token_expired",
            Self::Malformed(_) => "token_malformed",
            Self::InvalidSignature => "token_invalid_signature",
            Self::Revoked => "token_revoked",
            Self::WrongTokenType { .. } => "token_wrong_type",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => Self::InvalidSignature,
            _ => Self::Malformed(err.to_string()),
        }
    }
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Mints and verifies access and refresh tokens.
pub struct TokenCodec {
    access: KeyPair,
    refresh: KeyPair,
    issuer: String,
    access_ttl: chrono::Duration,
    refresh_ttl: chrono::Duration,
    leeway: u64,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("leeway", &self.leeway)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// ## Summary
    /// Builds the codec from JWT settings.
    ///
    /// ## Errors
    /// `InvalidConfiguration` for empty or shared secrets, or zero lifetimes.
    pub fn new(config: &JwtConfig) -> ServiceResult<Self> {
        if config.access_secret.is_empty() || config.refresh_secret.is_empty() {
            return Err(ServiceError::InvalidConfiguration(
                "jwt.access_secret and jwt.refresh_secret must be set".to_string(),
            ));
        }
        if config.access_secret == config.refresh_secret {
            return Err(ServiceError::InvalidConfiguration(
                "jwt.access_secret and jwt.refresh_secret must differ".to_string(),
            ));
        }
        let access_ttl = chrono::Duration::from_std(config.access_ttl())
            .map_err(|e| ServiceError::InvalidConfiguration(format!("jwt.access_ttl: {e}")))?;
        let refresh_ttl = chrono::Duration::from_std(config.refresh_ttl())
            .map_err(|e| ServiceError::InvalidConfiguration(format!("jwt.refresh_ttl: {e}")))?;
        if access_ttl <= chrono::Duration::zero() || refresh_ttl <= chrono::Duration::zero() {
            return Err(ServiceError::InvalidConfiguration(
                "token lifetimes must be positive".to_string(),
            ));
        }

        Ok(Self {
            access: KeyPair::from_secret(&config.access_secret),
            refresh: KeyPair::from_secret(&config.refresh_secret),
            issuer: config.issuer.clone(),
            access_ttl,
            refresh_ttl,
            leeway: config.leeway_seconds,
        })
    }

    const fn keys(&self, kind: TokenKind) -> &KeyPair {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    const fn ttl(&self, kind: TokenKind) -> chrono::Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    /// ## Summary
    /// Signs a token of `kind` for `identity`, issued at `now`. Access tokens
    /// carry `session_id`; it is ignored for refresh tokens.
    ///
    /// ## Errors
    /// Signing failures.
    pub fn mint(
        &self,
        kind: TokenKind,
        identity: &VerifiedIdentity,
        session_id: Option<uuid::Uuid>,
        now: DateTime<Utc>,
    ) -> ServiceResult<(String, Claims)> {
        let claims = Claims {
            sub: identity.user_id,
            name: identity.display_name.clone(),
            username: identity.username.clone(),
            sid: match kind {
                TokenKind::Access => session_id,
                TokenKind::Refresh => None,
            },
            typ: kind,
            jti: uuid::Uuid::new_v4(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl(kind)).timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::new(ALGORITHM), &claims, &self.keys(kind).encoding)
            .map_err(|e| ServiceError::InvalidConfiguration(format!("Failed to sign token: {e}")))?;
        Ok((token, claims))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(ALGORITHM);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);
        validation.validate_aud = false;
        validation.leeway = self.leeway;
        validation
    }

    /// ## Summary
    /// Verifies a token expected to be of `kind`.
    ///
    /// ## Errors
    /// - `Expired` past `exp` (plus leeway)
    /// - `InvalidSignature` for a bad signature or any algorithm other than HS256
    /// - `WrongTokenType` for a valid token of the other kind
    /// - `Malformed` for anything that does not parse to the exact claim shape
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let validation = self.validation();
        let claims = match jsonwebtoken::decode::<Claims>(token, &self.keys(kind).decoding, &validation) {
            Ok(data) => data.claims,
            Err(err) if matches!(err.kind(), ErrorKind::InvalidSignature) => {
                let other = kind.other();
                if jsonwebtoken::decode::<Claims>(token, &self.keys(other).decoding, &validation).is_ok() {
                    return Err(TokenError::WrongTokenType {
                        expected: kind,
                        found: other,
                    });
                }
                return Err(TokenError::InvalidSignature);
            }
            Err(err) => return Err(err.into()),
        };

        if claims.typ != kind {
            return Err(TokenError::WrongTokenType {
                expected: kind,
                found: claims.typ,
            });
        }
        match (kind, claims.sid) {
            (TokenKind::Access, None) => Err(TokenError::Malformed("access token without sid".into())),
            (TokenKind::Refresh, Some(_)) => {
                Err(TokenError::Malformed("refresh token with sid".into()))
            }
            _ => Ok(claims),
        }
    }
}
