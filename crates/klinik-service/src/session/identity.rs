use chrono::{DateTime, Utc};
use serde::Serialize;

use klinik_db::model::user::User;

use crate::authz::subject::Subject;

/// Result of credential verification, consumed when issuing tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: uuid::Uuid,
    pub username: String,
    pub display_name: String,
}

impl From<&User> for VerifiedIdentity {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
        }
    }
}

/// Identity of an authenticated request, built once from a validated access
/// token and carried through the depot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestIdentity {
    pub user_id: uuid::Uuid,
    pub username: String,
    pub display_name: String,
    pub session_id: uuid::Uuid,
    pub expires_at: DateTime<Utc>,
}

impl RequestIdentity {
    #[must_use]
    pub const fn subject(&self) -> Subject {
        Subject::User(self.user_id)
    }
}
