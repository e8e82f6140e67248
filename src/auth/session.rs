//! Access-token currency and session identity.
//!
//! [`AuthSession`] runs at most one acquisition cycle at a time. A cycle
//! makes sure a usable access token is in the vault (asking the injected
//! [`AccessTokenProvider`] when needed), exchanges it for a
//! [`SessionIdentity`], and publishes exactly one refreshed notification.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::api::{ApiError, DonationApiClient, SessionIdentity};
use crate::auth::provider::AccessTokenProvider;
use crate::auth::store::{TokenStore, TokenVault};
use crate::dispatch::{EventDispatcher, EventStream};
use crate::guard::{FlightGuard, SingleFlight};
use crate::settings::Settings;

/// Everything a realtime connection needs from a successful cycle.
#[derive(Clone, Debug)]
pub struct SessionGrant {
    /// Bearer token the identity was obtained with.
    pub access_token: SecretString,
    /// User id and socket connection token.
    pub identity: SessionIdentity,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Another acquisition cycle is already running.
    #[error("token refresh already in progress")]
    Busy,

    /// Consent or code exchange failed, was cancelled, or left no token.
    #[error("failed to acquire access token")]
    AcquisitionFailed,

    /// The access token could not be exchanged for a socket token.
    #[error("failed to exchange access token for a session: {0}")]
    ExchangeFailed(#[source] ApiError),
}

/// Cloneable handle to one authorization session.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    api: DonationApiClient,
    vault: TokenVault,
    provider: Arc<dyn AccessTokenProvider>,
    flight: SingleFlight,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    identity: RwLock<Option<SessionIdentity>>,
    refreshed: EventDispatcher<bool>,
    outcomes: EventDispatcher<Option<SessionGrant>>,
}

impl AuthSession {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn TokenStore>,
        provider: Arc<dyn AccessTokenProvider>,
    ) -> Result<Self, ApiError> {
        let api = DonationApiClient::new(settings)?;
        Ok(Self::with_api(api, TokenVault::new(store, settings), provider))
    }

    pub fn with_api(
        api: DonationApiClient,
        vault: TokenVault,
        provider: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(AuthInner {
                api,
                vault,
                provider,
                flight: SingleFlight::default(),
                cancel: Mutex::new(None),
                identity: RwLock::new(None),
                refreshed: EventDispatcher::new(),
                outcomes: EventDispatcher::new(),
            }),
        }
    }

    pub fn api(&self) -> &DonationApiClient {
        &self.inner.api
    }

    /// Stream of refresh outcomes, one per acquisition cycle.
    pub fn subscribe(&self) -> EventStream<bool> {
        self.inner.refreshed.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.flight.is_busy()
    }

    pub fn access_token(&self) -> Option<SecretString> {
        self.inner.vault.access_token()
    }

    /// Identity from the last successful cycle.
    pub fn identity(&self) -> Option<SessionIdentity> {
        self.inner
            .identity
            .read()
            .map(|identity| identity.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn is_any_token_cached(&self) -> bool {
        self.inner.vault.is_any_token_cached()
    }

    /// Deletes cached tokens so the next cycle asks for consent again.
    pub fn forget_credentials(&self) {
        self.inner.vault.forget();
        self.inner.set_identity(None);
    }

    /// Runs one acquisition cycle.
    ///
    /// Returns [`AuthError::Busy`] immediately while another cycle is in
    /// flight; that cycle alone produces the next notification. The cycle
    /// runs on its own task, so dropping the returned future does not stop
    /// it or suppress its notification.
    pub async fn ensure_token(&self) -> Result<SessionGrant, AuthError> {
        let guard = self.inner.flight.try_begin().ok_or(AuthError::Busy)?;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.inner.cancel_slot() = Some(cancel_tx);

        let completion = CycleCompletion {
            inner: Arc::clone(&self.inner),
            guard: Some(guard),
        };
        let cycle = tokio::spawn(async move {
            let inner = Arc::clone(&completion.inner);
            let result = tokio::select! {
                result = inner.acquire_and_exchange() => result,
                _ = cancel_rx => {
                    warn!(event = "authorization_cancelled");
                    Err(AuthError::AcquisitionFailed)
                }
            };
            completion.finish(result.as_ref().ok().cloned());
            result
        });

        match cycle.await {
            Ok(result) => result,
            Err(err) => {
                error!(event = "authorization_task_failed", error = %err);
                Err(AuthError::AcquisitionFailed)
            }
        }
    }

    /// Like [`AuthSession::ensure_token`], but joins a cycle that is
    /// already running instead of reporting [`AuthError::Busy`].
    ///
    /// A joined cycle that failed is reported as
    /// [`AuthError::AcquisitionFailed`].
    pub async fn ensure_token_or_join(&self) -> Result<SessionGrant, AuthError> {
        let mut outcomes = self.inner.outcomes.subscribe();
        match self.ensure_token().await {
            Err(AuthError::Busy) => outcomes
                .recv()
                .await
                .flatten()
                .ok_or(AuthError::AcquisitionFailed),
            other => other,
        }
    }

    /// Aborts the running cycle, if any, as a failed acquisition.
    pub fn cancel_auth(&self) {
        if let Some(cancel) = self.inner.cancel_slot().take() {
            let _ = cancel.send(());
        }
    }
}

impl AuthInner {
    async fn acquire_and_exchange(&self) -> Result<SessionGrant, AuthError> {
        self.set_identity(None);

        if let Some(cached) = self.vault.access_token() {
            match self.api.fetch_session_identity(&cached).await {
                Ok(identity) => return Ok(self.grant(cached, identity)),
                Err(err) if err.is_unauthorized() => {
                    debug!(event = "cached_access_token_rejected");
                }
                Err(err) => return Err(exchange_failed(err)),
            }
        }

        let outcome = self.provider.provide_access_token(&self.vault).await;
        let token = match self.vault.access_token() {
            Some(token) if outcome.is_success() => token,
            _ => {
                error!(
                    event = "authorization_failed",
                    done = outcome.done,
                    provider_error = outcome.error,
                    "failed to execute authorization procedure; check application settings and credentials"
                );
                return Err(AuthError::AcquisitionFailed);
            }
        };

        match self.api.fetch_session_identity(&token).await {
            Ok(identity) => Ok(self.grant(token, identity)),
            Err(err) => Err(exchange_failed(err)),
        }
    }

    fn grant(&self, access_token: SecretString, identity: SessionIdentity) -> SessionGrant {
        debug!(event = "session_identity_acquired", user_id = %identity.user_id);
        self.set_identity(Some(identity.clone()));
        SessionGrant {
            access_token,
            identity,
        }
    }

    fn set_identity(&self, identity: Option<SessionIdentity>) {
        match self.identity.write() {
            Ok(mut guard) => *guard = identity,
            Err(poisoned) => *poisoned.into_inner() = identity,
        }
    }

    fn cancel_slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ends one acquisition cycle: frees the cancel slot and the single-flight
/// guard, then publishes the outcome. Dropping it unfinished (the cycle
/// panicked or its task was aborted) publishes a failure.
struct CycleCompletion {
    inner: Arc<AuthInner>,
    guard: Option<FlightGuard>,
}

impl CycleCompletion {
    fn finish(mut self, grant: Option<SessionGrant>) {
        self.complete(grant);
    }

    fn complete(&mut self, grant: Option<SessionGrant>) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        self.inner.cancel_slot().take();
        drop(guard);
        self.inner.refreshed.publish(grant.is_some());
        self.inner.outcomes.publish(grant);
    }
}

impl Drop for CycleCompletion {
    fn drop(&mut self) {
        if self.guard.is_some() {
            warn!(event = "authorization_cycle_abandoned");
            self.complete(None);
        }
    }
}

fn exchange_failed(err: ApiError) -> AuthError {
    error!(event = "session_exchange_failed", error = %err);
    AuthError::ExchangeFailed(err)
}
