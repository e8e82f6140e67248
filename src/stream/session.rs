//! Realtime session state machine.
//!
//! `RealtimeSession` drives one connect sequence at a time:
//! token → socket token → websocket open → handshake → subscribe → stream.
//! The sequence runs on a single driver task per connect; every transport
//! signal is consumed there, in arrival order, and turned into
//! [`SessionEvent`]s on the session's dispatcher.
//!
//! Each connect bumps a generation counter. `disconnect` bumps it again and
//! tears down the driver, transport and any in-flight alert request, so a
//! late completion from a previous generation can never move the state.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, FutureExt, OptionFuture};
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

use crate::api::{ApiError, ChannelSubscription, CustomAlert};
use crate::auth::session::{AuthSession, SessionGrant};
use crate::dispatch::{EventDispatcher, EventStream};
use crate::guard::SingleFlight;
use crate::settings::Settings;
use crate::stream::client::{StreamTransport, TransportEvent, TransportSender};
use crate::stream::proto::{
    parse_inbound_frame, Donation, HandshakeFrame, InboundFrame, SubscribeFrame,
};

/// Connection lifecycle as seen by the consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket and no connect sequence running.
    #[default]
    NotConnected,
    /// Token cycle or socket open in progress.
    Connecting,
    /// The websocket reported open; donations may arrive.
    Connected,
}

/// Consumer-visible notification.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Emitted on every actual state change, never for a repeated state.
    ConnectionStateChanged(ConnectionState),
    /// One donation published on the user's donation channel.
    Donation(Donation),
    /// Outcome of the token cycle run by a connect.
    AccessTokenRefreshed(bool),
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Another custom alert is still in flight.
    #[error("custom alert request already in progress")]
    Busy,

    #[error("not connected")]
    NotConnected,

    /// Connected, but the token store no longer holds an access token.
    #[error("no access token available")]
    MissingAccessToken,

    #[error("custom alert request failed: {0}")]
    Request(#[from] ApiError),

    /// `disconnect` aborted the request.
    #[error("request was cancelled")]
    Cancelled,
}

/// Cloneable handle to one realtime session.
#[derive(Clone)]
pub struct RealtimeSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    auth: AuthSession,
    transport: StreamTransport,
    events: EventDispatcher<SessionEvent>,
    state: Mutex<SessionState>,
    alert_flight: SingleFlight,
}

#[derive(Default)]
struct SessionState {
    connection: ConnectionState,
    generation: u64,
    driver: Option<AbortHandle>,
    sender: Option<TransportSender>,
    alert: Option<AbortHandle>,
}

impl RealtimeSession {
    pub fn new(auth: AuthSession, settings: &Settings) -> Self {
        let transport = StreamTransport::new(settings.realtime_url.clone(), settings.connect_timeout);
        Self::with_transport(auth, transport)
    }

    pub fn with_transport(auth: AuthSession, transport: StreamTransport) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                auth,
                transport,
                events: EventDispatcher::new(),
                state: Mutex::new(SessionState::default()),
                alert_flight: SingleFlight::default(),
            }),
        }
    }

    pub fn auth(&self) -> &AuthSession {
        &self.inner.auth
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state().connection
    }

    /// Ordered stream of state changes, donations and refresh outcomes.
    pub fn subscribe(&self) -> EventStream<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Starts the connect sequence in the background.
    ///
    /// Does nothing while already connecting or connected. Must be called
    /// from within a Tokio runtime.
    pub fn connect(&self) {
        let mut state = self.inner.state();
        if state.connection != ConnectionState::NotConnected {
            debug!(event = "connect_ignored", state = ?state.connection);
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        self.inner.set_connection(&mut state, ConnectionState::Connecting);

        let inner = Arc::clone(&self.inner);
        let driver = tokio::spawn(async move { inner.drive(generation).await });
        state.driver = Some(driver.abort_handle());
    }

    /// Tears the session down and reports `NotConnected` immediately.
    ///
    /// The socket close completes in the background.
    pub fn disconnect(&self) {
        let mut state = self.inner.state();
        state.generation += 1;

        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        if let Some(sender) = state.sender.take() {
            sender.close();
        }
        if let Some(alert) = state.alert.take() {
            alert.abort();
        }

        self.inner.set_connection(&mut state, ConnectionState::NotConnected);
    }

    /// Cancels a running authorization; the connect in progress fails.
    pub fn cancel_auth(&self) {
        self.inner.auth.cancel_auth();
    }

    /// Pushes a custom alert.
    ///
    /// Rejected without any network call while another alert is in flight
    /// or the session is not connected. The in-flight slot is released when
    /// the request finishes, fails, or is aborted by `disconnect`.
    pub fn send_custom_alert(&self, alert: CustomAlert) -> Result<PendingAlert, RealtimeError> {
        let Some(guard) = self.inner.alert_flight.try_begin() else {
            error!(event = "custom_alert_rejected", reason = "request already in progress");
            return Err(RealtimeError::Busy);
        };

        let mut state = self.inner.state();
        if state.connection != ConnectionState::Connected {
            error!(event = "custom_alert_rejected", reason = "not connected");
            return Err(RealtimeError::NotConnected);
        }
        let access_token = self
            .inner
            .auth
            .access_token()
            .ok_or(RealtimeError::MissingAccessToken)?;

        let api = self.inner.auth.api().clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = api.send_custom_alert(&access_token, &alert).await;
            match &result {
                Ok(body) => debug!(event = "custom_alert_sent", external_id = %alert.external_id, response = %body),
                Err(err) => error!(event = "custom_alert_failed", external_id = %alert.external_id, error = %err),
            }
            result
        });
        state.alert = Some(handle.abort_handle());

        Ok(PendingAlert { handle })
    }
}

impl std::fmt::Debug for RealtimeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSession")
            .field("state", &self.state())
            .field("realtime_url", &self.inner.transport.url())
            .finish_non_exhaustive()
    }
}

/// Completion of one custom alert request; resolves to the response body.
#[derive(Debug)]
pub struct PendingAlert {
    handle: JoinHandle<Result<String, ApiError>>,
}

impl Future for PendingAlert {
    type Output = Result<String, RealtimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result.map_err(RealtimeError::Request)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RealtimeError::Cancelled)),
        }
    }
}

type SubscribeCall = BoxFuture<'static, Result<ChannelSubscription, ApiError>>;

impl SessionInner {
    async fn drive(self: Arc<Self>, generation: u64) {
        let grant = self.auth.ensure_token_or_join().await;
        self.publish_if_current(generation, SessionEvent::AccessTokenRefreshed(grant.is_ok()));
        let grant = match grant {
            Ok(grant) => grant,
            Err(err) => {
                warn!(event = "connect_aborted", error = %err);
                self.finish(generation);
                return;
            }
        };

        let (sender, mut signals) = self.transport.open();
        {
            let mut state = self.state();
            if state.generation != generation {
                sender.close();
                return;
            }
            state.sender = Some(sender.clone());
        }

        let handshake = HandshakeFrame::new(grant.identity.connection_token.expose_secret().clone());
        if let Err(err) = sender.send_json(&handshake) {
            warn!(event = "handshake_send_failed", error = %err);
        }

        // The subscribe call is polled alongside the transport so that a close
        // arriving mid-call is handled at once; dropping it cancels the call.
        let mut subscribed = false;
        let mut subscribe_call: Option<SubscribeCall> = None;
        loop {
            tokio::select! {
                signal = signals.recv() => {
                    match signal {
                        Some(TransportEvent::Opened) => {
                            debug!(event = "websocket_opened");
                            self.transition(generation, ConnectionState::Connected);
                        }
                        Some(TransportEvent::Frame(text)) => {
                            if let Some(call) = self.handle_frame(generation, &grant, &text, &mut subscribed) {
                                subscribe_call = Some(call);
                            }
                        }
                        Some(TransportEvent::Error(err)) => {
                            warn!(event = "websocket_error", error = %err);
                        }
                        Some(TransportEvent::Closed { code, reason }) => {
                            debug!(event = "websocket_closed", code = ?code, reason = %reason);
                            break;
                        }
                        None => break,
                    }
                }
                Some(result) = OptionFuture::from(subscribe_call.as_mut()) => {
                    subscribe_call = None;
                    self.complete_subscribe(generation, &grant, &sender, result);
                }
            }
        }

        self.finish(generation);
    }

    /// Classifies one frame; returns the subscribe call to run after the
    /// first handshake ack.
    fn handle_frame(
        &self,
        generation: u64,
        grant: &SessionGrant,
        text: &str,
        subscribed: &mut bool,
    ) -> Option<SubscribeCall> {
        debug!(event = "frame_received", frame = %text);

        match parse_inbound_frame(text) {
            Ok(InboundFrame::HandshakeAck { client }) => {
                if std::mem::replace(subscribed, true) {
                    debug!(event = "duplicate_handshake_ack", client = %client);
                    return None;
                }
                Some(self.subscribe_call(grant, client))
            }
            Ok(InboundFrame::Donation(donation)) => {
                self.publish_if_current(generation, SessionEvent::Donation(donation));
                None
            }
            Ok(InboundFrame::Unrecognized) => {
                debug!(event = "frame_ignored");
                None
            }
            Err(err) => {
                warn!(event = "frame_parse_failed", error = %err);
                None
            }
        }
    }

    fn subscribe_call(&self, grant: &SessionGrant, client: String) -> SubscribeCall {
        let api = self.auth.api().clone();
        let access_token = grant.access_token.clone();
        let channel = grant.identity.donation_channel();
        async move { api.subscribe_channel(&access_token, &channel, &client).await }.boxed()
    }

    fn complete_subscribe(
        &self,
        generation: u64,
        grant: &SessionGrant,
        sender: &TransportSender,
        result: Result<ChannelSubscription, ApiError>,
    ) {
        let subscription = match result {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(
                    event = "channel_subscribe_failed",
                    channel = %grant.identity.donation_channel(),
                    error = %err
                );
                sender.close();
                return;
            }
        };

        if !self.is_current(generation) {
            return;
        }

        let channel = subscription.channel;
        let frame = SubscribeFrame::new(channel.clone(), subscription.token.expose_secret().clone());
        match sender.send_json(&frame) {
            Ok(()) => debug!(event = "channel_subscribe_sent", channel = %channel),
            Err(err) => warn!(event = "channel_subscribe_send_failed", error = %err),
        }
    }

    fn finish(&self, generation: u64) {
        let mut state = self.state();
        if state.generation != generation {
            return;
        }
        state.driver = None;
        state.sender = None;
        self.set_connection(&mut state, ConnectionState::NotConnected);
    }

    fn transition(&self, generation: u64, next: ConnectionState) {
        let mut state = self.state();
        if state.generation == generation {
            self.set_connection(&mut state, next);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    fn publish_if_current(&self, generation: u64, event: SessionEvent) {
        let state = self.state();
        if state.generation == generation {
            self.events.publish(event);
        }
    }

    fn set_connection(&self, state: &mut SessionState, next: ConnectionState) {
        if state.connection == next {
            return;
        }
        debug!(event = "connection_state_changed", from = ?state.connection, to = ?next);
        state.connection = next;
        self.events.publish(SessionEvent::ConnectionStateChanged(next));
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{ConnectionState, RealtimeError, RealtimeSession};
    use crate::api::CustomAlert;
    use crate::auth::provider::{AccessTokenProvider, ProviderOutcome};
    use crate::auth::session::AuthSession;
    use crate::auth::store::{MemoryTokenStore, TokenVault};
    use crate::settings::Settings;

    struct FailingProvider;

    #[async_trait]
    impl AccessTokenProvider for FailingProvider {
        async fn provide_access_token(&self, _vault: &TokenVault) -> ProviderOutcome {
            ProviderOutcome::failed()
        }
    }

    fn offline_session() -> RealtimeSession {
        let settings = Settings::default()
            .with_api_base_url("http://127.0.0.1:9")
            .with_realtime_url("ws://127.0.0.1:9/connection/websocket");
        let auth = AuthSession::new(
            &settings,
            Arc::new(MemoryTokenStore::new()),
            Arc::new(FailingProvider),
        )
        .expect("auth session");
        RealtimeSession::new(auth, &settings)
    }

    #[test]
    fn new_session_starts_not_connected() {
        assert_eq!(offline_session().state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn custom_alert_is_rejected_while_not_connected() {
        let session = offline_session();
        let result = session.send_custom_alert(CustomAlert::new("id", "header", "body"));
        assert!(matches!(result, Err(RealtimeError::NotConnected)));

        // The rejection must not leave the slot claimed.
        let again = session.send_custom_alert(CustomAlert::new("id", "header", "body"));
        assert!(matches!(again, Err(RealtimeError::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_from_idle_is_a_quiet_no_op() {
        let session = offline_session();
        let mut events = session.subscribe();
        session.disconnect();
        assert_eq!(session.state(), ConnectionState::NotConnected);
        assert!(events.try_recv().is_none());
    }
}
