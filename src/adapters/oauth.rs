use crate::domain::model::TokenGrant;
use crate::domain::ports::TokenRefresher;
use crate::utils::error::{AgentError, Result};
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use url::Url;

pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// OAuth client registration, as downloaded from the cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    #[serde(default)]
    installed: Option<ClientSecrets>,
    #[serde(default)]
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| AgentError::ConfigError {
            message: format!(
                "cannot read client secrets {}: {}",
                path.as_ref().display(),
                e
            ),
        })?;
        Self::from_json_str(&content)
    }

    /// Accepts both the `installed` and `web` layouts.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let file: ClientSecretsFile =
            serde_json::from_str(content).map_err(|e| AgentError::ConfigError {
                message: format!("malformed client secrets: {}", e),
            })?;
        file.installed
            .or(file.web)
            .ok_or_else(|| AgentError::ConfigError {
                message: "client secrets have neither an 'installed' nor a 'web' section"
                    .to_string(),
            })
    }
}

/// Talks to the OAuth token endpoint for refresh and code exchange.
pub struct GoogleOAuthClient {
    client: Client,
    secrets: ClientSecrets,
}

impl GoogleOAuthClient {
    pub fn new(secrets: ClientSecrets) -> Self {
        Self {
            client: Client::new(),
            secrets,
        }
    }

    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        scopes: &[String],
        state: &str,
    ) -> Result<String> {
        let url = Url::parse_with_params(
            &self.secrets.auth_uri,
            &[
                ("client_id", self.secrets.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scopes.join(" ").as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| AgentError::InvalidConfigValueError {
            field: "oauth.auth_uri".to_string(),
            value: self.secrets.auth_uri.clone(),
            reason: e.to_string(),
        })?;
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        self.post_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
        ])
        .await
        .map_err(|(status, body)| AgentError::AuthorizationError {
            message: match status {
                Some(status) => format!("code exchange rejected ({}): {}", status, body),
                None => format!("code exchange failed: {}", body),
            },
        })
    }

    async fn post_token(
        &self,
        form: &[(&str, &str)],
    ) -> std::result::Result<TokenGrant, (Option<u16>, String)> {
        let response = self
            .client
            .post(&self.secrets.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| (None, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| (Some(status.as_u16()), e.to_string()))?;
        if !status.is_success() {
            return Err((Some(status.as_u16()), body));
        }

        serde_json::from_str(&body)
            .map_err(|e| (Some(status.as_u16()), format!("malformed token response: {}", e)))
    }
}

#[async_trait::async_trait]
impl TokenRefresher for GoogleOAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        tracing::debug!("Requesting token refresh from {}", self.secrets.token_uri);
        self.post_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
        ])
        .await
        .map_err(|(status, body)| AgentError::RefreshError {
            // 400/401 from the token endpoint means the grant itself is dead
            rejected: matches!(status, Some(400) | Some(401)),
            message: body,
        })
    }
}
