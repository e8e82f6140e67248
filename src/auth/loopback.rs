//! Loopback consent strategy.
//!
//! The user authorizes in a browser that is redirected back to a short-lived
//! HTTP listener on the local machine. The authorization code is exchanged
//! with PKCE (`S256`). A cached refresh token is tried first so that consent
//! is only requested when silent renewal fails.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::auth::provider::{AccessTokenProvider, ProviderOutcome};
use crate::auth::store::TokenVault;
use crate::settings::{Settings, CODE_CHALLENGE_METHOD};

const VERIFIER_LEN: usize = 64;
const STATE_LEN: usize = 24;

/// Receives the authorization URL the user has to open.
pub trait AuthorizationPrompt: Send + Sync {
    fn prompt(&self, authorization_url: &str);
}

/// Default prompt: logs the URL at `info` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogPrompt;

impl AuthorizationPrompt for LogPrompt {
    fn prompt(&self, authorization_url: &str) {
        info!(event = "authorization_required", url = authorization_url);
    }
}

impl<F> AuthorizationPrompt for F
where
    F: Fn(&str) + Send + Sync,
{
    fn prompt(&self, authorization_url: &str) {
        self(authorization_url)
    }
}

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("failed to bind loopback listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("loopback listener stopped before the callback arrived")]
    ListenerClosed,

    #[error("authorization denied: {0}")]
    Denied(String),

    #[error("callback state did not match the request")]
    StateMismatch,

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// [`AccessTokenProvider`] backed by a local HTTP callback.
pub struct LoopbackAccessTokenProvider {
    settings: Settings,
    http: reqwest::Client,
    prompt: Arc<dyn AuthorizationPrompt>,
}

impl LoopbackAccessTokenProvider {
    pub fn new(settings: Settings) -> Self {
        Self::with_prompt(settings, LogPrompt)
    }

    pub fn with_prompt(settings: Settings, prompt: impl AuthorizationPrompt + 'static) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
            prompt: Arc::new(prompt),
        }
    }

    async fn renew(&self, vault: &TokenVault) -> Result<bool, LoopbackError> {
        let Some(refresh_token) = vault.refresh_token() else {
            return Ok(false);
        };
        let credentials = &self.settings.credentials;
        let scope = self.settings.access_scopes.join(" ");
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.expose_secret().as_str()),
            ("refresh_token", refresh_token.expose_secret().as_str()),
            ("scope", scope.as_str()),
        ];
        let tokens = self.request_tokens(&form).await?;
        tokens.store(vault);
        Ok(true)
    }

    async fn authorize(&self, vault: &TokenVault) -> Result<(), LoopbackError> {
        let listener =
            TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, self.settings.loopback_port)))
                .await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!(
            "{}:{port}/",
            self.settings.loopback_uri.trim_end_matches('/')
        );

        let verifier = random_string(VERIFIER_LEN);
        let state = random_string(STATE_LEN);
        let url = authorization_url(&self.settings, &redirect_uri, &state, &code_challenge(&verifier));

        let callback = serve_single_callback(listener, self.settings.loopback_response_html.clone());
        self.prompt.prompt(&url);
        let params = callback.await?;

        if let Some(error) = params.error {
            return Err(LoopbackError::Denied(error));
        }
        if params.state.as_deref() != Some(state.as_str()) {
            return Err(LoopbackError::StateMismatch);
        }
        let code = params
            .code
            .ok_or_else(|| LoopbackError::Denied("callback carried no code".to_string()))?;

        let credentials = &self.settings.credentials;
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.expose_secret().as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("code", code.as_str()),
            ("code_verifier", verifier.as_str()),
        ];
        let tokens = self.request_tokens(&form).await?;
        tokens.store(vault);
        Ok(())
    }

    async fn request_tokens(&self, form: &[(&str, &str)]) -> Result<TokenResponse, LoopbackError> {
        let response = self
            .http
            .post(&self.settings.credentials.token_uri)
            .timeout(self.settings.request_timeout)
            .form(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LoopbackError::TokenEndpoint { status, body });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl AccessTokenProvider for LoopbackAccessTokenProvider {
    async fn provide_access_token(&self, vault: &TokenVault) -> ProviderOutcome {
        match self.renew(vault).await {
            Ok(true) => {
                debug!(event = "access_token_renewed");
                return ProviderOutcome::succeeded();
            }
            Ok(false) => {}
            Err(err) => warn!(event = "refresh_grant_failed", error = %err),
        }

        match self.authorize(vault).await {
            Ok(()) => ProviderOutcome::succeeded(),
            Err(err) => {
                warn!(event = "loopback_authorization_failed", error = %err);
                ProviderOutcome::failed()
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: SecretString,
    #[serde(default)]
    refresh_token: Option<SecretString>,
}

impl TokenResponse {
    fn store(&self, vault: &TokenVault) {
        vault.set_access_token(&self.access_token);
        if let Some(refresh_token) = &self.refresh_token {
            vault.set_refresh_token(refresh_token);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    tx: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
    html: Arc<str>,
}

/// Serves until the first request on `/` and yields its query parameters.
async fn serve_single_callback(
    listener: TcpListener,
    html: String,
) -> Result<CallbackParams, LoopbackError> {
    let (tx, rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let state = CallbackState {
        tx: Arc::new(Mutex::new(Some(tx))),
        html: Arc::from(html),
    };
    let app = Router::new().route("/", get(callback)).with_state(state);

    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    let params = rx.await.map_err(|_| LoopbackError::ListenerClosed);
    let _ = shutdown_tx.send(());
    params
}

async fn callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> Html<String> {
    let sender = state
        .tx
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(tx) = sender {
        let _ = tx.send(params);
    }
    Html(state.html.to_string())
}

fn authorization_url(settings: &Settings, redirect_uri: &str, state: &str, challenge: &str) -> String {
    let credentials = &settings.credentials;
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&code_challenge={}&code_challenge_method={}",
        credentials.auth_uri,
        urlencoding::encode(&credentials.client_id),
        urlencoding::encode(redirect_uri),
        settings.access_scope(),
        state,
        challenge,
        CODE_CHALLENGE_METHOD,
    )
}

fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
