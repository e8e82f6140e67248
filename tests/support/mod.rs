#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use donationalerts_sdk::auth::{AccessTokenProvider, ProviderOutcome, TokenVault};
use donationalerts_sdk::dispatch::EventStream;
use donationalerts_sdk::settings::Settings;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time::{sleep, timeout, Instant};

pub const TEST_ACCESS_TOKEN: &str = "test-access-token";
pub const TEST_REFRESH_TOKEN: &str = "test-refresh-token";
pub const SOCKET_TOKEN: &str = "socket-token";
pub const CHANNEL_TOKEN: &str = "channel-token";
pub const HANDSHAKE_CLIENT: &str = "abc123";
pub const USER_ID: u64 = 42;
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame pushed from the mock realtime endpoint to every open socket.
#[derive(Clone, Debug)]
pub enum Push {
    Text(String),
    Close,
}

/// Shared, inspectable state of the mock DonationAlerts service.
#[derive(Clone)]
pub struct MockState {
    pub accepted_token: Arc<Mutex<String>>,
    pub oauth_status: Arc<Mutex<StatusCode>>,
    pub oauth_calls: Arc<AtomicUsize>,
    pub subscribe_bodies: Arc<Mutex<Vec<Value>>>,
    pub subscribe_gate: Arc<Mutex<Option<Arc<Notify>>>>,
    pub alert_forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
    pub alert_gate: Arc<Mutex<Option<Arc<Notify>>>>,
    pub token_forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
    pub ws_connections: Arc<AtomicUsize>,
    pub ws_frames: Arc<Mutex<Vec<String>>>,
    pub push: broadcast::Sender<Push>,
}

impl MockState {
    fn new() -> Self {
        let (push, _) = broadcast::channel(64);
        Self {
            accepted_token: Arc::new(Mutex::new(TEST_ACCESS_TOKEN.to_string())),
            oauth_status: Arc::new(Mutex::new(StatusCode::OK)),
            oauth_calls: Arc::new(AtomicUsize::new(0)),
            subscribe_bodies: Arc::new(Mutex::new(Vec::new())),
            subscribe_gate: Arc::new(Mutex::new(None)),
            alert_forms: Arc::new(Mutex::new(Vec::new())),
            alert_gate: Arc::new(Mutex::new(None)),
            token_forms: Arc::new(Mutex::new(Vec::new())),
            ws_connections: Arc::new(AtomicUsize::new(0)),
            ws_frames: Arc::new(Mutex::new(Vec::new())),
            push,
        }
    }

    pub fn set_oauth_status(&self, status: StatusCode) {
        *self.oauth_status.lock().expect("oauth status lock") = status;
    }

    /// Holds every channel subscribe response until `gate` is notified.
    pub fn hold_subscribes(&self, gate: Arc<Notify>) {
        *self.subscribe_gate.lock().expect("subscribe gate lock") = Some(gate);
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_bodies.lock().expect("subscribe bodies lock").len()
    }

    /// Holds every custom alert response until `gate` is notified.
    pub fn hold_alerts(&self, gate: Arc<Notify>) {
        *self.alert_gate.lock().expect("alert gate lock") = Some(gate);
    }

    pub fn ws_frames(&self) -> Vec<String> {
        self.ws_frames.lock().expect("ws frames lock").clone()
    }

    pub fn alert_forms(&self) -> Vec<HashMap<String, String>> {
        self.alert_forms.lock().expect("alert forms lock").clone()
    }

    pub fn token_forms(&self) -> Vec<HashMap<String, String>> {
        self.token_forms.lock().expect("token forms lock").clone()
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push.send(Push::Text(text.into())).expect("an open socket");
    }

    pub fn push_close(&self) {
        self.push.send(Push::Close).expect("an open socket");
    }
}

pub struct MockService {
    pub addr: SocketAddr,
    pub state: MockState,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockService {
    pub async fn start() -> Self {
        let state = MockState::new();
        let app = Router::new()
            .route("/api/v1/user/oauth", get(user_oauth))
            .route("/api/v1/centrifuge/subscribe", post(subscribe))
            .route("/api/v1/custom_alert", post(custom_alert))
            .route("/oauth/token", post(token))
            .route("/connection/websocket", get(ws_handler))
            .with_state(state.clone());
        let (addr, shutdown_tx) = spawn_server(app).await;
        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Settings pointing every endpoint at this mock.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default()
            .with_api_base_url(format!("http://{}", self.addr))
            .with_realtime_url(format!("ws://{}/connection/websocket", self.addr));
        settings.credentials.client_id = "1234".to_string();
        settings.credentials.client_secret = SecretString::new("client-secret".to_string());
        settings.credentials.token_uri = format!("http://{}/oauth/token", self.addr);
        settings.loopback_uri = "http://127.0.0.1".to_string();
        settings
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn spawn_server(app: Router) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

async fn user_oauth(State(state): State<MockState>, headers: HeaderMap) -> Response {
    state.oauth_calls.fetch_add(1, Ordering::SeqCst);

    let status = *state.oauth_status.lock().expect("oauth status lock");
    if status != StatusCode::OK {
        return (status, Json(json!({ "message": "mock failure" }))).into_response();
    }
    let accepted = state.accepted_token.lock().expect("token lock").clone();
    if bearer(&headers) != Some(accepted.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Unauthenticated." })),
        )
            .into_response();
    }

    Json(json!({
        "data": {
            "id": USER_ID,
            "name": "streamer",
            "socket_connection_token": SOCKET_TOKEN,
        }
    }))
    .into_response()
}

async fn subscribe(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if bearer(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let channel = body["channels"][0].as_str().unwrap_or_default().to_string();
    state
        .subscribe_bodies
        .lock()
        .expect("subscribe bodies lock")
        .push(body);

    let gate = state.subscribe_gate.lock().expect("subscribe gate lock").clone();
    if let Some(gate) = gate {
        gate.notified().await;
    }

    Json(json!({
        "client": HANDSHAKE_CLIENT,
        "channels": [{ "channel": channel, "token": CHANNEL_TOKEN }],
    }))
    .into_response()
}

async fn custom_alert(
    State(state): State<MockState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let external_id = form.get("external_id").cloned().unwrap_or_default();
    state.alert_forms.lock().expect("alert forms lock").push(form);

    let gate = state.alert_gate.lock().expect("alert gate lock").clone();
    if let Some(gate) = gate {
        gate.notified().await;
    }

    Json(json!({ "data": { "id": 7, "external_id": external_id } })).into_response()
}

async fn token(
    State(state): State<MockState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_forms.lock().expect("token forms lock").push(form);
    Json(json!({
        "token_type": "Bearer",
        "expires_in": 3600,
        "access_token": TEST_ACCESS_TOKEN,
        "refresh_token": TEST_REFRESH_TOKEN,
    }))
    .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<MockState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: MockState) {
    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    let mut push = state.push.subscribe();

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                state.ws_frames.lock().expect("ws frames lock").push(text.clone());

                let frame: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                let reply = match frame["id"].as_u64() {
                    Some(1) => json!({ "id": 1, "result": { "client": HANDSHAKE_CLIENT, "version": "2.8.5" } }),
                    Some(2) => json!({ "id": 2, "result": {} }),
                    _ => continue,
                };
                if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
            pushed = push.recv() => {
                match pushed {
                    Ok(Push::Text(text)) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Push::Close) => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: 4000,
                                reason: "server shutdown".into(),
                            })))
                            .await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Publication frame for one donation on the test user's channel.
pub fn donation_frame(username: &str, message: &str, amount: f64, currency: &str) -> String {
    json!({
        "result": {
            "channel": format!("$alerts:donation_{USER_ID}"),
            "data": {
                "seq": 1,
                "data": {
                    "id": 1001,
                    "name": "Donations",
                    "username": username,
                    "message": message,
                    "amount": amount,
                    "currency": currency,
                }
            }
        }
    })
    .to_string()
}

/// Provider double that counts runs and writes a fixed token.
pub struct StubProvider {
    pub calls: AtomicUsize,
    token: Option<String>,
    outcome: ProviderOutcome,
    gate: Option<Arc<Notify>>,
    panics: bool,
}

impl StubProvider {
    pub fn granting() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            token: Some(TEST_ACCESS_TOKEN.to_string()),
            outcome: ProviderOutcome::succeeded(),
            gate: None,
            panics: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            token: None,
            outcome: ProviderOutcome::failed(),
            gate: None,
            panics: false,
        }
    }

    /// Reports success but leaves the vault empty.
    pub fn succeeding_without_token() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            token: None,
            outcome: ProviderOutcome::succeeded(),
            gate: None,
            panics: false,
        }
    }

    /// Waits for `gate` before granting.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::granting()
        }
    }

    /// Waits for `gate`, then panics mid-run.
    pub fn panicking(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            panics: true,
            ..Self::granting()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccessTokenProvider for StubProvider {
    async fn provide_access_token(&self, vault: &TokenVault) -> ProviderOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.panics {
            panic!("provider failed unexpectedly");
        }
        if let Some(token) = &self.token {
            vault.set_access_token(&SecretString::new(token.clone()));
        }
        self.outcome
    }
}

pub async fn next_event<E>(events: &mut EventStream<E>) -> E {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("event should arrive in time")
        .expect("event stream should stay open")
}

/// Asserts that nothing is published within a short grace period.
pub async fn assert_quiet<E: std::fmt::Debug>(events: &mut EventStream<E>) {
    sleep(Duration::from_millis(250)).await;
    if let Some(event) = events.try_recv() {
        panic!("unexpected event: {event:?}");
    }
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}
