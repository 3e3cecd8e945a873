//! Session and credential management.
//!
//! ## Module Organization
//!
//! - `identity`: Verified login identity and the typed per-request identity
//! - `token`: JWT claims, signing and differentiated validation errors
//! - `manager`: `SessionManager` lifecycle (issue, validate, refresh, revoke)

pub mod identity;
pub mod manager;
pub mod token;

pub use identity::{RequestIdentity, VerifiedIdentity};
pub use manager::{IssuedTokens, SessionManager};
pub use token::{Claims, TokenCodec, TokenError, TokenKind};
