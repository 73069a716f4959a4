//! Authentication collaborator boundary.
//!
//! The core only needs a seam: credentials in, token out, token
//! validation. The bundled implementation checks the configured master
//! password in constant time and issues expiring random tokens; richer
//! identity systems plug in behind the same trait.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use nosq_core::{now_millis, AuthData, AuthRequest, DbError, DbResult};
use subtle::ConstantTimeEq;

/// The authentication seam used by the connection handler.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Exchanges credentials for a token.
    ///
    /// # Errors
    ///
    /// Returns `AUTH_FAILED` (and nothing more specific) on rejection.
    async fn authenticate(&self, request: &AuthRequest) -> DbResult<AuthData>;

    /// Whether a previously issued token is still valid.
    fn validate(&self, token: &str) -> bool;
}

/// Master-password authenticator with in-memory token registry.
pub struct MasterPasswordAuthenticator {
    password: Option<String>,
    token_ttl: Duration,
    tokens: DashMap<String, i64>,
}

impl MasterPasswordAuthenticator {
    /// Creates an authenticator. With no password configured, every
    /// password authentication attempt fails.
    #[must_use]
    pub fn new(password: Option<String>, token_ttl: Duration) -> Self {
        Self {
            password,
            token_ttl,
            tokens: DashMap::new(),
        }
    }

    fn issue(&self) -> AuthData {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let expires_at =
            now_millis() + i64::try_from(self.token_ttl.as_millis()).unwrap_or(i64::MAX);
        self.tokens.insert(token.clone(), expires_at);
        AuthData { token, expires_at }
    }
}

#[async_trait]
impl Authenticator for MasterPasswordAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> DbResult<AuthData> {
        // Token renewal path first.
        if let Some(token) = &request.token {
            if self.validate(token) {
                return Ok(self.issue());
            }
            return Err(DbError::AuthFailed);
        }
        let (Some(expected), Some(given)) = (&self.password, &request.password) else {
            return Err(DbError::AuthFailed);
        };
        if bool::from(expected.as_bytes().ct_eq(given.as_bytes())) {
            Ok(self.issue())
        } else {
            Err(DbError::AuthFailed)
        }
    }

    fn validate(&self, token: &str) -> bool {
        match self.tokens.get(token) {
            Some(expires_at) if *expires_at > now_millis() => true,
            Some(_) => {
                drop(self.tokens.remove(token));
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> MasterPasswordAuthenticator {
        MasterPasswordAuthenticator::new(Some("sesame".into()), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn correct_password_issues_a_token() {
        let auth = authenticator();
        let data = auth
            .authenticate(&AuthRequest {
                password: Some("sesame".into()),
                token: None,
            })
            .await
            .unwrap();
        assert_eq!(data.token.len(), 32);
        assert!(auth.validate(&data.token));
    }

    #[tokio::test]
    async fn wrong_password_fails_opaquely() {
        let auth = authenticator();
        let err = auth
            .authenticate(&AuthRequest {
                password: Some("open".into()),
                token: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
        assert_eq!(err.to_string(), "authentication failed");
    }

    #[tokio::test]
    async fn no_configured_password_rejects_everything() {
        let auth = MasterPasswordAuthenticator::new(None, Duration::from_secs(3600));
        let err = auth
            .authenticate(&AuthRequest {
                password: Some("anything".into()),
                token: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
    }

    #[tokio::test]
    async fn token_renewal() {
        let auth = authenticator();
        let first = auth
            .authenticate(&AuthRequest {
                password: Some("sesame".into()),
                token: None,
            })
            .await
            .unwrap();
        let renewed = auth
            .authenticate(&AuthRequest {
                password: None,
                token: Some(first.token.clone()),
            })
            .await
            .unwrap();
        assert_ne!(renewed.token, first.token);
        assert!(auth.validate(&renewed.token));
    }

    #[tokio::test]
    async fn expired_tokens_fail_validation() {
        let auth = MasterPasswordAuthenticator::new(Some("pw".into()), Duration::ZERO);
        let data = auth
            .authenticate(&AuthRequest {
                password: Some("pw".into()),
                token: None,
            })
            .await
            .unwrap();
        assert!(!auth.validate(&data.token));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let auth = authenticator();
        assert!(!auth.validate("deadbeef"));
    }
}
