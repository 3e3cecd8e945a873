//! Subject naming for the enforcement engine.
//!
//! Users, roles and groups share the engine's subject namespace, so each kind
//! carries a prefix: `user:{uuid}`, `role:{id}`, `group:{id}`.

use klinik_core::constants::SUPERUSER_ROLE_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    User(uuid::Uuid),
    Role(i32),
    Group(i32),
}

impl Subject {
    #[must_use]
    pub const fn superuser() -> Self {
        Self::Role(SUPERUSER_ROLE_ID)
    }

    /// Returns the Casbin subject string.
    #[must_use]
    pub fn casbin_subject(self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Role(id) => format!("role:{id}"),
            Self::Group(id) => format!("group:{id}"),
        }
    }

    /// Parse a Casbin subject string.
    #[must_use]
    pub fn from_casbin_subject(s: &str) -> Option<Self> {
        let (kind, id) = s.split_once(':')?;
        match kind {
            "user" => uuid::Uuid::parse_str(id).ok().map(Self::User),
            "role" => id.parse().ok().map(Self::Role),
            "group" => id.parse().ok().map(Self::Group),
            _ => None,
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.casbin_subject())
    }
}
