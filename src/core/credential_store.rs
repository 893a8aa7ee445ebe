use crate::core::token_cache::TokenCache;
use crate::domain::model::Credential;
use crate::domain::ports::{InteractiveAuthorizer, TokenRefresher};
use crate::utils::error::{AgentError, Result};
use crate::utils::logger::redact;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Loads, refreshes and persists the credential that authorizes platform calls.
pub struct CredentialStore {
    cache: TokenCache,
    required_scopes: Vec<String>,
    refresher: Arc<dyn TokenRefresher>,
    authorizer: Option<Arc<dyn InteractiveAuthorizer>>,
    acquire_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(
        cache: TokenCache,
        required_scopes: Vec<String>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            cache,
            required_scopes,
            refresher,
            authorizer: None,
            acquire_lock: Mutex::new(()),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn InteractiveAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Credential valid for immediate use: cached if fresh, refreshed if
    /// stale, otherwise obtained interactively. Anything new is persisted
    /// before it is returned.
    pub async fn acquire(&self) -> Result<Credential> {
        let _guard = self.acquire_lock.lock().await;

        match self.cache.load()? {
            Some(cached) if cached.is_valid_for(&self.required_scopes) => {
                tracing::debug!("Using cached credential {}", redact(&cached.access_token));
                return Ok(cached);
            }
            Some(cached)
                if cached.covers(&self.required_scopes) && cached.refresh_token.is_some() =>
            {
                return self.refresh(cached).await;
            }
            Some(_) => {
                tracing::info!("Cached credential lacks required scopes or a refresh token")
            }
            None => tracing::info!("No cached credential found"),
        }

        self.authorize_interactively().await
    }

    async fn refresh(&self, stale: Credential) -> Result<Credential> {
        let Some(refresh_token) = stale.refresh_token else {
            return Err(AgentError::RefreshError {
                message: "cached credential has no refresh token".to_string(),
                rejected: true,
            });
        };

        tracing::info!("Cached credential expired, refreshing");
        let grant = match self.refresher.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(AgentError::RefreshError {
                message,
                rejected: true,
            }) => {
                tracing::error!("Refresh token rejected, clearing token cache: {}", message);
                self.cache.clear()?;
                return Err(AgentError::RefreshError {
                    message,
                    rejected: true,
                });
            }
            Err(AgentError::RefreshError { message, rejected }) => {
                return Err(AgentError::RefreshError { message, rejected });
            }
            Err(other) => {
                return Err(AgentError::RefreshError {
                    message: other.to_string(),
                    rejected: false,
                });
            }
        };

        let fresh = Credential::from_grant(grant, Some(refresh_token), &self.required_scopes);
        if !fresh.is_valid_for(&self.required_scopes) {
            self.cache.clear()?;
            return Err(AgentError::RefreshError {
                message: "refreshed credential does not cover the required scopes".to_string(),
                rejected: true,
            });
        }

        self.cache.save(&fresh)?;
        tracing::info!(
            "Refreshed credential {} saved to {}",
            redact(&fresh.access_token),
            self.cache.path().display()
        );
        Ok(fresh)
    }

    async fn authorize_interactively(&self) -> Result<Credential> {
        let Some(authorizer) = &self.authorizer else {
            return Err(AgentError::AuthorizationError {
                message: "no usable cached credential and interactive authorization is unavailable"
                    .to_string(),
            });
        };

        tracing::info!("Starting interactive authorization");
        let grant = authorizer
            .authorize(&self.required_scopes)
            .await
            .map_err(|e| match e {
                AgentError::AuthorizationError { .. } => e,
                other => AgentError::AuthorizationError {
                    message: other.to_string(),
                },
            })?;

        let credential = Credential::from_grant(grant, None, &self.required_scopes);
        if !credential.covers(&self.required_scopes) {
            return Err(AgentError::AuthorizationError {
                message: "consent did not grant every required scope".to_string(),
            });
        }

        self.cache.save(&credential)?;
        tracing::info!("New credential saved to {}", self.cache.path().display());
        Ok(credential)
    }

    /// Wrap a bearer token obtained by the caller's own authorization flow.
    /// No refresh, no persistence; expiry and scopes stay the caller's business.
    pub fn wrap_supplied(token: &str) -> Result<Credential> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AgentError::InvalidCredentialError {
                reason: "bearer token is empty".to_string(),
            });
        }
        if !token.chars().all(|c| c.is_ascii_graphic()) {
            return Err(AgentError::InvalidCredentialError {
                reason: "bearer token contains whitespace or non-printable characters".to_string(),
            });
        }

        Ok(Credential {
            access_token: token.to_string(),
            refresh_token: None,
            expiry: None,
            scopes: BTreeSet::new(),
        })
    }
}

/// The two ways a cycle can come by a credential.
#[derive(Clone)]
pub enum CredentialSource {
    /// Cached/refreshed/interactive credential owned by a store.
    Managed(Arc<CredentialStore>),
    /// Bearer token handed in by a front end.
    Supplied(String),
}

impl CredentialSource {
    pub fn supplied(token: impl Into<String>) -> Self {
        Self::Supplied(token.into())
    }

    pub async fn acquire(&self) -> Result<Credential> {
        match self {
            Self::Managed(store) => store.acquire().await,
            Self::Supplied(token) => CredentialStore::wrap_supplied(token),
        }
    }
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed(_) => f.write_str("CredentialSource::Managed"),
            Self::Supplied(token) => write!(f, "CredentialSource::Supplied({})", redact(token)),
        }
    }
}
