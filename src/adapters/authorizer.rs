use crate::adapters::oauth::GoogleOAuthClient;
use crate::domain::model::TokenGrant;
use crate::domain::ports::InteractiveAuthorizer;
use crate::utils::error::{AgentError, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Router,
};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};

const STATE_LEN: usize = 32;

/// Consent flow that catches the redirect on an ephemeral loopback port.
pub struct LoopbackAuthorizer {
    oauth: Arc<GoogleOAuthClient>,
    wait: Duration,
}

impl LoopbackAuthorizer {
    pub fn new(oauth: Arc<GoogleOAuthClient>) -> Self {
        Self {
            oauth,
            wait: Duration::from_secs(300),
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

fn new_state() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(STATE_LEN)
        .map(char::from)
        .collect()
}

#[async_trait::async_trait]
impl InteractiveAuthorizer for LoopbackAuthorizer {
    async fn authorize(&self, scopes: &[String]) -> Result<TokenGrant> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{}/", port);
        let state = new_state();

        let url = self.oauth.authorization_url(&redirect_uri, scopes, &state)?;
        tracing::info!("Open this URL in a browser to authorize access:\n{}", url);

        let code = wait_for_code(listener, state, self.wait).await?;
        self.oauth.exchange_code(&code, &redirect_uri).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<str>,
    outcome: Arc<Mutex<Option<oneshot::Sender<Result<String>>>>>,
}

async fn handle_callback(
    State(ctx): State<CallbackState>,
    Query(query): Query<CallbackQuery>,
) -> (StatusCode, Html<&'static str>) {
    let outcome = check_callback(&query, &ctx.expected_state);
    let response = match &outcome {
        Ok(_) => (
            StatusCode::OK,
            Html("<h1>Authorization complete</h1><p>You can close this window.</p>"),
        ),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            Html("<h1>Authorization failed</h1><p>Check the terminal.</p>"),
        ),
    };

    // only the first redirect counts
    if let Some(sender) = ctx.outcome.lock().await.take() {
        let _ = sender.send(outcome);
    }
    response
}

/// Serve `/` on `listener` until one redirect arrives or `wait` elapses.
async fn wait_for_code(
    listener: TcpListener,
    expected_state: String,
    wait: Duration,
) -> Result<String> {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let app = Router::new()
        .route("/", get(handle_callback))
        .with_state(CallbackState {
            expected_state: Arc::from(expected_state),
            outcome: Arc::new(Mutex::new(Some(outcome_tx))),
        });

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let received = tokio::time::timeout(wait, outcome_rx).await;
    let _ = shutdown_tx.send(());
    if let Err(e) = server.await {
        tracing::debug!("Callback server task ended abnormally: {}", e);
    }

    match received {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(AgentError::AuthorizationError {
            message: "callback server stopped before a redirect arrived".to_string(),
        }),
        Err(_) => Err(AgentError::AuthorizationError {
            message: "timed out waiting for browser consent".to_string(),
        }),
    }
}

fn check_callback(query: &CallbackQuery, expected_state: &str) -> Result<String> {
    if let Some(error) = &query.error {
        return Err(AgentError::AuthorizationError {
            message: format!("consent declined: {}", error),
        });
    }
    if query.state.as_deref() != Some(expected_state) {
        return Err(AgentError::AuthorizationError {
            message: "state mismatch in authorization redirect".to_string(),
        });
    }
    query
        .code
        .clone()
        .ok_or_else(|| AgentError::AuthorizationError {
            message: "authorization redirect carried no code".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(code: Option<&str>, state: Option<&str>, error: Option<&str>) -> CallbackQuery {
        CallbackQuery {
            code: code.map(str::to_string),
            state: state.map(str::to_string),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_state_is_random_alphanumeric() {
        let a = new_state();
        let b = new_state();
        assert_eq!(a.len(), STATE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_check_callback() {
        assert_eq!(
            check_callback(&query(Some("4/0Adeu"), Some("abc"), None), "abc").unwrap(),
            "4/0Adeu"
        );

        let declined = check_callback(&query(None, Some("abc"), Some("access_denied")), "abc");
        assert!(declined.unwrap_err().to_string().contains("access_denied"));

        assert!(check_callback(&query(Some("c"), Some("other"), None), "abc").is_err());
        assert!(check_callback(&query(Some("c"), None, None), "abc").is_err());
        assert!(check_callback(&query(None, Some("abc"), None), "abc").is_err());
    }

    #[tokio::test]
    async fn test_redirect_delivers_code() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let waiting = tokio::spawn(wait_for_code(
            listener,
            "abc".to_string(),
            Duration::from_secs(5),
        ));

        let client = reqwest::Client::new();
        let stray = client
            .get(format!("http://127.0.0.1:{}/favicon.ico", port))
            .send()
            .await
            .unwrap();
        assert_eq!(stray.status(), 404);

        let response = client
            .get(format!("http://127.0.0.1:{}/?state=abc&code=4%2F0Adeu", port))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        assert_eq!(waiting.await.unwrap().unwrap(), "4/0Adeu");
    }

    #[tokio::test]
    async fn test_forged_state_is_rejected() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let waiting = tokio::spawn(wait_for_code(
            listener,
            "expected".to_string(),
            Duration::from_secs(5),
        ));

        let response = reqwest::get(format!("http://127.0.0.1:{}/?state=guess&code=x", port))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("state mismatch"));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let err = wait_for_code(listener, "abc".to_string(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
