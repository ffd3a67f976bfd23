use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// One-time authorization code from the store's login page. Without it the
    /// identity provider's stored login is reused.
    #[serde(default)]
    pub auth_code: Option<String>,
}

/// Who the identity provider says is logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, ApiError>;

    /// Drops whatever the provider keeps for the user. Best-effort.
    async fn forget(&self) -> Result<(), ApiError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Holds the one process-wide session.
///
/// Readers take the read lock; only login, logout and expiry write.
pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    ttl: Duration,
    current: RwLock<Option<Session>>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            current: RwLock::new(None),
        }
    }

    pub async fn login(&self, credentials: Credentials) -> Result<Session, ApiError> {
        let identity = self.provider.authenticate(&credentials).await.map_err(|e| match e {
            ApiError::Auth(_) => e,
            other => ApiError::auth(format!("identity provider unreachable: {other}")),
        })?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| ApiError::auth(format!("invalid session ttl: {e}")))?;
        let session = Session {
            token: uuid::Uuid::new_v4().to_string(),
            user: identity.user,
            created_at: now,
            expires_at: now + ttl,
        };

        let mut guard = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(session.clone());
        log::info!("session opened for {}", session.user);
        Ok(session)
    }

    /// The live session, if any. An expired session reads as `None`.
    pub fn current_session(&self) -> Option<Session> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.as_ref().filter(|s| !s.is_expired(Utc::now())).cloned()
    }

    pub async fn logout(&self) {
        let previous = {
            let mut guard = self
                .current
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(s) = previous {
            log::info!("session closed for {}", s.user);
            if let Err(e) = self.provider.forget().await {
                log::warn!("identity provider logout failed: {e}");
            }
        }
    }

    /// Checks a bearer token against the current session.
    pub fn validate(&self, token: &str) -> Result<Session, ApiError> {
        let now = Utc::now();
        {
            let guard = self
                .current
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match guard.as_ref() {
                None => return Err(ApiError::auth("not logged in")),
                Some(s) if s.token != token => return Err(ApiError::auth("invalid session token")),
                Some(s) if !s.is_expired(now) => return Ok(s.clone()),
                Some(_) => {}
            }
        }

        // Expired: drop it, unless a concurrent login already replaced it.
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.as_ref().is_some_and(|s| s.token == token) {
            log::info!("session expired");
            *guard = None;
        }
        Err(ApiError::auth("session expired"))
    }
}
