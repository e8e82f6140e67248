//! Client configuration.
//!
//! [`Settings`] is an explicit value handed to the SDK at construction. It
//! carries the OAuth application credentials, the consent parameters used by
//! the loopback provider, the token-store key names and the service
//! endpoints. Nothing here is global; two sessions built from two settings
//! values never share state.

use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

/// Production REST base URL.
pub const API_BASE_URL: &str = "https://www.donationalerts.com";
/// Production realtime (centrifugo) websocket endpoint.
pub const REALTIME_ENDPOINT: &str = "wss://centrifugo.donationalerts.com/connection/websocket";
/// OAuth authorization endpoint.
pub const AUTH_URI: &str = "https://www.donationalerts.com/oauth/authorize";
/// OAuth token endpoint.
pub const TOKEN_URI: &str = "https://www.donationalerts.com/oauth/token";
/// PKCE challenge method requested by the loopback provider.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

const DEFAULT_LOOPBACK_URI: &str = "http://localhost";
const DEFAULT_LOOPBACK_RESPONSE_HTML: &str = "<html><h1>Please return to the app.</h1></html>";
const DEFAULT_ACCESS_TOKEN_KEY: &str = "DonationAlertsAccessToken";
const DEFAULT_REFRESH_TOKEN_KEY: &str = "DonationAlertsRefreshToken";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SCOPES: [&str; 6] = [
    "oauth-user-show",
    "oauth-donation-subscribe",
    "oauth-donation-index",
    "oauth-custom_alert-store",
    "oauth-goal-subscribe",
    "oauth-poll-subscribe",
];

/// OAuth application credentials.
///
/// The `Debug` output never contains the identifier or the secret.
#[derive(Clone)]
pub struct ClientCredentials {
    /// Authorization endpoint the user is sent to for consent.
    pub auth_uri: String,
    /// Token endpoint used for code and refresh-token grants.
    pub token_uri: String,
    /// Application (client) identifier.
    pub client_id: String,
    /// Application secret.
    pub client_secret: SecretString,
    /// Redirect URIs registered for the application.
    pub redirect_uris: Vec<String>,
}

impl ClientCredentials {
    /// Credentials for the production endpoints with the given application.
    pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            ..Self::default()
        }
    }

    /// Whether an identifier or secret is configured.
    pub fn contains_sensitive_data(&self) -> bool {
        !self.client_id.is_empty() || !self.client_secret.expose_secret().is_empty()
    }
}

impl Default for ClientCredentials {
    fn default() -> Self {
        Self {
            auth_uri: AUTH_URI.to_string(),
            token_uri: TOKEN_URI.to_string(),
            client_id: String::new(),
            client_secret: SecretString::new(String::new()),
            redirect_uris: vec![DEFAULT_LOOPBACK_URI.to_string()],
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("auth_uri", &self.auth_uri)
            .field("token_uri", &self.token_uri)
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uris", &self.redirect_uris)
            .finish()
    }
}

/// Complete SDK configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    /// OAuth application credentials.
    pub credentials: ClientCredentials,
    /// Scopes requested during consent.
    pub access_scopes: Vec<String>,
    /// Base address the loopback provider listens on.
    pub loopback_uri: String,
    /// Loopback listener port; `0` picks an ephemeral port.
    pub loopback_port: u16,
    /// Page shown in the browser once the loopback callback arrives.
    pub loopback_response_html: String,
    /// Token-store key for the access token.
    pub access_token_key: String,
    /// Token-store key for the refresh token.
    pub refresh_token_key: String,
    /// REST base URL.
    pub api_base_url: String,
    /// Realtime websocket endpoint.
    pub realtime_url: String,
    /// Connect timeout for HTTP calls and the websocket open.
    pub connect_timeout: Duration,
    /// Whole-request timeout for HTTP calls.
    pub request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            credentials: ClientCredentials::default(),
            access_scopes: DEFAULT_SCOPES.iter().map(|scope| scope.to_string()).collect(),
            loopback_uri: DEFAULT_LOOPBACK_URI.to_string(),
            loopback_port: 0,
            loopback_response_html: DEFAULT_LOOPBACK_RESPONSE_HTML.to_string(),
            access_token_key: DEFAULT_ACCESS_TOKEN_KEY.to_string(),
            refresh_token_key: DEFAULT_REFRESH_TOKEN_KEY.to_string(),
            api_base_url: API_BASE_URL.to_string(),
            realtime_url: REALTIME_ENDPOINT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `DONATIONALERTS_*` environment variables.
    ///
    /// | Variable                        | Field                      |
    /// |---------------------------------|----------------------------|
    /// | `DONATIONALERTS_CLIENT_ID`      | `credentials.client_id`    |
    /// | `DONATIONALERTS_CLIENT_SECRET`  | `credentials.client_secret`|
    /// | `DONATIONALERTS_REDIRECT_URI`   | `credentials.redirect_uris`|
    /// | `DONATIONALERTS_API_BASE_URL`   | `api_base_url`             |
    /// | `DONATIONALERTS_REALTIME_URL`   | `realtime_url`             |
    /// | `DONATIONALERTS_LOOPBACK_PORT`  | `loopback_port`            |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Settings::from_env`] with an explicit variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut settings = Self::default();

        if let Some(client_id) = var("DONATIONALERTS_CLIENT_ID") {
            settings.credentials.client_id = client_id.trim().to_string();
        }
        if let Some(secret) = var("DONATIONALERTS_CLIENT_SECRET") {
            settings.credentials.client_secret = SecretString::new(secret.trim().to_string());
        }
        if let Some(redirect) = var("DONATIONALERTS_REDIRECT_URI") {
            settings.credentials.redirect_uris = vec![redirect.trim().to_string()];
        }
        if let Some(base) = var("DONATIONALERTS_API_BASE_URL") {
            settings = settings.with_api_base_url(base);
        }
        if let Some(url) = var("DONATIONALERTS_REALTIME_URL") {
            settings = settings.with_realtime_url(url);
        }
        if let Some(port) = var("DONATIONALERTS_LOOPBACK_PORT").and_then(|v| v.trim().parse().ok())
        {
            settings.loopback_port = port;
        }

        settings
    }

    /// Replaces the application credentials.
    pub fn with_credentials(mut self, credentials: ClientCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Overrides the REST base URL.
    pub fn with_api_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.api_base_url = base_url.trim_end().trim_end_matches('/').to_string();
        self
    }

    /// Overrides the realtime websocket endpoint.
    pub fn with_realtime_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.realtime_url = url.trim_end().to_string();
        self
    }

    /// Scopes joined in the form the authorization endpoint expects.
    pub fn access_scope(&self) -> String {
        self.access_scopes.join("+")
    }
}
