//! Bearer token validation.
//!
//! Tokens are symmetric-secret JWTs carried in the upgrade query string.
//! Validation checks the signature and expiry, then resolves the subject to
//! an active user through the repository collaborator. The resulting
//! [`Principal`] is immutable for the connection's lifetime.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind as JwtErrorKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::{AuthError, ServiceError, ServiceResult};
use crate::repo::UserRepository;

/// Authenticated identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub is_admin: bool,
    pub is_active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: opaque user id.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

pub struct AuthValidator {
    key: DecodingKey,
    validation: Validation,
    users: Arc<dyn UserRepository>,
}

impl AuthValidator {
    pub fn new(config: &AuthConfig, users: Arc<dyn UserRepository>) -> ServiceResult<Self> {
        let algorithm = match config.token_algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(ServiceError::Config {
                    message: format!("unsupported token algorithm: {}", other),
                });
            }
        };

        if config.token_secret.is_empty() {
            return Err(ServiceError::Config {
                message: "auth.token_secret must be set".to_string(),
            });
        }

        Ok(Self {
            key: DecodingKey::from_secret(config.token_secret.as_bytes()),
            validation: Validation::new(algorithm),
            users,
        })
    }

    /// Verify a bearer token and resolve its principal.
    ///
    /// Pure relative to the token and the repository: the single user lookup
    /// is the only I/O.
    pub async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => AuthError::TokenExpired,
                JwtErrorKind::InvalidSignature => AuthError::TokenInvalidSignature,
                _ => AuthError::TokenMalformed,
            })?
            .claims;

        let user = self
            .users
            .find_by_id(&claims.sub)
            .await
            .map_err(|_| AuthError::UserInactive)?
            .ok_or(AuthError::UserInactive)?;

        if !user.is_active {
            debug!(user_id = %user.id, "Rejected token for inactive user");
            return Err(AuthError::UserInactive);
        }

        // Privilege comes from the user record alone; tokens carry identity,
        // not authorization.
        Ok(Principal {
            user_id: user.id,
            is_admin: user.is_admin,
            is_active: user.is_active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{MemoryUserRepository, User};
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret";

    fn validator_with(users: Vec<User>) -> AuthValidator {
        let config = AuthConfig {
            token_secret: SECRET.to_string(),
            token_algorithm: "HS256".to_string(),
        };
        AuthValidator::new(&config, Arc::new(MemoryUserRepository::seeded(users))).unwrap()
    }

    fn token_for(sub: &str, secret: &str, expires_in_secs: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: Utc::now().timestamp() + expires_in_secs,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn active_user(id: &str) -> User {
        User {
            id: id.to_string(),
            is_active: true,
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn test_valid_token_resolves_principal() {
        let validator = validator_with(vec![active_user("u1")]);
        let principal = validator
            .verify(&token_for("u1", SECRET, 60))
            .await
            .unwrap();

        assert_eq!(principal.user_id, "u1");
        assert!(!principal.is_admin);
        assert!(principal.is_active);
    }

    #[tokio::test]
    async fn test_admin_privilege_comes_from_user_record() {
        let validator = validator_with(vec![User {
            id: "root".to_string(),
            is_active: true,
            is_admin: true,
        }]);
        let principal = validator
            .verify(&token_for("root", SECRET, 60))
            .await
            .unwrap();
        assert!(principal.is_admin);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let validator = validator_with(vec![active_user("u1")]);
        // Well past the validator's default clock-skew leeway.
        let err = validator
            .verify(&token_for("u1", SECRET, -3600))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::TokenExpired);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_invalid_signature() {
        let validator = validator_with(vec![active_user("u1")]);
        let err = validator
            .verify(&token_for("u1", "other-secret", 60))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::TokenInvalidSignature);
    }

    #[tokio::test]
    async fn test_garbage_token_is_malformed() {
        let validator = validator_with(vec![active_user("u1")]);
        let err = validator.verify("not-a-token").await.unwrap_err();
        assert_eq!(err, AuthError::TokenMalformed);
    }

    #[tokio::test]
    async fn test_inactive_user_rejected() {
        let validator = validator_with(vec![User {
            id: "u1".to_string(),
            is_active: false,
            is_admin: false,
        }]);
        let err = validator
            .verify(&token_for("u1", SECRET, 60))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::UserInactive);
    }

    #[tokio::test]
    async fn test_unknown_subject_rejected() {
        let validator = validator_with(vec![]);
        let err = validator
            .verify(&token_for("ghost", SECRET, 60))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::UserInactive);
    }
}
