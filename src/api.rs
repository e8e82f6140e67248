//! DonationAlerts REST API.
//!
//! Three calls are needed by the realtime session: the identity exchange
//! (`/api/v1/user/oauth`), the channel subscription
//! (`/api/v1/centrifuge/subscribe`) and custom alerts
//! (`/api/v1/custom_alert`). HTTP failures are summarized into
//! [`ApiError::HttpStatus`] with a short body snippet.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::settings::Settings;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const USER_OAUTH_PATH: &str = "/api/v1/user/oauth";
const SUBSCRIBE_PATH: &str = "/api/v1/centrifuge/subscribe";
const CUSTOM_ALERT_PATH: &str = "/api/v1/custom_alert";
const DONATION_CHANNEL_PREFIX: &str = "$alerts:donation_";

/// REST client for the DonationAlerts API.
///
/// Every call is authorized with the bearer access token handed in by the
/// caller; the client itself holds no credentials.
#[derive(Clone, Debug)]
pub struct DonationApiClient {
    http: Client,
    base_url: String,
    request_timeout: Duration,
}

impl DonationApiClient {
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: settings.api_base_url.clone(),
            request_timeout: settings.request_timeout,
        })
    }

    /// Exchanges an access token for the user id and socket connection token.
    pub async fn fetch_session_identity(
        &self,
        access_token: &SecretString,
    ) -> Result<SessionIdentity, ApiError> {
        let request = self.http.get(self.endpoint(USER_OAUTH_PATH));
        let body = self.send(request, access_token).await?;

        serde_json::from_str::<UserOauthResponse>(&body)
            .map(|response| response.data)
            .map_err(|err| ApiError::Parse(format!("user/oauth response: {err}")))
    }

    /// Requests a channel token for `channel` on behalf of handshake client
    /// `client_id`.
    pub async fn subscribe_channel(
        &self,
        access_token: &SecretString,
        channel: &str,
        client_id: &str,
    ) -> Result<ChannelSubscription, ApiError> {
        let request = self
            .http
            .post(self.endpoint(SUBSCRIBE_PATH))
            .json(&SubscribeRequest {
                channels: vec![channel.to_string()],
                client: client_id.to_string(),
            });
        let body = self.send(request, access_token).await?;

        let response = serde_json::from_str::<SubscribeResponse>(&body)
            .map_err(|err| ApiError::Parse(format!("subscribe response: {err}")))?;
        let token = response
            .channels
            .into_iter()
            .next()
            .map(|entry| entry.token)
            .ok_or_else(|| ApiError::Parse("subscribe response has no channels".to_string()))?;

        Ok(ChannelSubscription {
            channel: channel.to_string(),
            token: SecretString::new(token),
        })
    }

    /// Posts a custom alert and returns the raw response body.
    pub async fn send_custom_alert(
        &self,
        access_token: &SecretString,
        alert: &CustomAlert,
    ) -> Result<String, ApiError> {
        let request = self
            .http
            .post(self.endpoint(CUSTOM_ALERT_PATH))
            .form(&alert.form_fields());
        self.send(request, access_token).await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        access_token: &SecretString,
    ) -> Result<String, ApiError> {
        let response = request
            .timeout(self.request_timeout)
            .bearer_auth(access_token.expose_secret())
            .send()
            .await
            .map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if status.is_client_error() || status.is_server_error() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(body)
    }
}

/// Identity obtained by exchanging an access token.
///
/// Regenerated on every connect; never persisted.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionIdentity {
    /// Numeric user id, kept as text.
    #[serde(rename = "id", deserialize_with = "string_or_number")]
    pub user_id: String,
    /// Token for the realtime handshake frame.
    #[serde(rename = "socket_connection_token")]
    pub connection_token: SecretString,
}

impl SessionIdentity {
    /// Donation channel of this user, e.g. `$alerts:donation_42`.
    pub fn donation_channel(&self) -> String {
        format!("{DONATION_CHANNEL_PREFIX}{}", self.user_id)
    }
}

/// Channel token issued for one subscribe handshake.
#[derive(Clone, Debug)]
pub struct ChannelSubscription {
    /// Channel the token was issued for, e.g. `$alerts:donation_42`.
    pub channel: String,
    /// Token for the subscribe frame.
    pub token: SecretString,
}

/// Synthetic alert pushed through the custom-alert endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomAlert {
    /// Caller-chosen id echoed back by the service.
    pub external_id: String,
    /// Alert title.
    pub header: String,
    /// Alert body text.
    pub message: String,
    /// Whether the widget displays the alert; sent as `1`/`0`.
    pub is_shown: bool,
}

impl CustomAlert {
    pub fn new(
        external_id: impl Into<String>,
        header: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            header: header.into(),
            message: message.into(),
            is_shown: true,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.is_shown = false;
        self
    }

    fn form_fields(&self) -> [(&'static str, &str); 4] {
        [
            ("external_id", self.external_id.as_str()),
            ("header", self.header.as_str()),
            ("message", self.message.as_str()),
            ("is_shown", if self.is_shown { "1" } else { "0" }),
        ]
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    /// Whether the service rejected the bearer token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

#[derive(Debug, Serialize)]
struct SubscribeRequest {
    channels: Vec<String>,
    client: String,
}

#[derive(Debug, Deserialize)]
struct UserOauthResponse {
    data: SessionIdentity,
}

#[derive(Debug, Deserialize)]
struct SubscribeResponse {
    channels: Vec<SubscribedChannel>,
}

#[derive(Debug, Deserialize)]
struct SubscribedChannel {
    token: String,
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
