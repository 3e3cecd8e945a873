use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};

use klinik_db::store::AuthzStore;

use crate::error::{ServiceError, ServiceResult};
use crate::session::identity::VerifiedIdentity;

/// ## Summary
/// Hashes a password using Argon2id with a random salt.
///
/// ## Errors
/// Returns an error if password hashing fails.
pub fn hash_password(password: &str) -> ServiceResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ServiceError::InvalidConfiguration(format!("Failed to hash password: {e}")))?;

    Ok(password_hash.to_string())
}

/// ## Summary
/// Verifies a password against a stored Argon2 hash.
///
/// ## Errors
/// `NotAuthenticated` on mismatch, `InvalidConfiguration` for a malformed hash.
pub fn verify_password(password: &str, password_hash: &str) -> ServiceResult<()> {
    let parsed_hash = PasswordHash::new(password_hash)
        .map_err(|e| ServiceError::InvalidConfiguration(format!("Invalid password hash: {e}")))?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|err| {
            tracing::trace!("Password verification failed: {}", err);
            ServiceError::NotAuthenticated
        })
}

/// ## Summary
/// Checks a username and password against the store and returns the verified
/// identity the session manager issues tokens for.
///
/// ## Errors
/// `NotAuthenticated` for an unknown user or a wrong password.
#[tracing::instrument(skip(store, password))]
pub async fn authenticate(
    store: &dyn AuthzStore,
    username: &str,
    password: &str,
) -> ServiceResult<VerifiedIdentity> {
    let Some(user) = store.find_user_by_username(username).await? else {
        tracing::debug!("Unknown username");
        return Err(ServiceError::NotAuthenticated);
    };
    verify_password(password, &user.password_hash)?;
    tracing::debug!(user_id = %user.id, "Credentials verified");
    Ok(VerifiedIdentity::from(&user))
}

#[cfg(test)]
mod tests {
    use klinik_db::store::memory::MemoryStore;

    use super::*;

    #[test]
    fn test_hash_and_verify_password() {
        let hash = hash_password("rahasia-123").expect("Failed to hash password");

        assert!(verify_password("rahasia-123", &hash).is_ok());
        assert!(matches!(
            verify_password("salah", &hash),
            Err(ServiceError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_hash_generates_different_salts() {
        let hash1 = hash_password("same_password").expect("Failed to hash password");
        let hash2 = hash_password("same_password").expect("Failed to hash password");
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_verify_invalid_hash_format() {
        assert!(matches!(
            verify_password("password", "not_a_valid_hash"),
            Err(ServiceError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn authenticate_checks_username_and_password() {
        let store = MemoryStore::new();
        let hash = hash_password("rahasia").unwrap();
        let user = store.create_user("siti", "Siti Aminah", &hash).await.unwrap();

        let identity = authenticate(&store, "siti", "rahasia").await.unwrap();
        assert_eq!(identity.user_id, user.id);
        assert_eq!(identity.display_name, "Siti Aminah");

        assert!(authenticate(&store, "siti", "salah").await.is_err());
        assert!(authenticate(&store, "budi", "rahasia").await.is_err());
    }
}
