//! Rust SDK for DonationAlerts OAuth sessions and the realtime donation stream.
//!
//! The crate is organized by concern:
//! - `settings`: client credentials, endpoints and timeouts.
//! - `api`: REST client for identity, channel subscription and custom alerts.
//! - `auth`: token storage, consent strategies and the single-flight auth session.
//! - `stream`: realtime websocket transport, wire frames and the session state machine.
//! - `dispatch`: ordered fan-out of session notifications.

/// REST client and request/response types.
pub mod api;
/// Token storage, access-token providers and the authorization session.
pub mod auth;
/// Ordered multi-subscriber event fan-out.
pub mod dispatch;
mod guard;
/// Credentials, endpoints and environment-driven configuration.
pub mod settings;
/// Realtime donation stream.
pub mod stream;

pub use api::{ApiError, CustomAlert, DonationApiClient, SessionIdentity};
pub use auth::{
    AccessTokenProvider, AuthError, AuthSession, LoopbackAccessTokenProvider, MemoryTokenStore,
    ProviderOutcome, TokenStore, TokenVault,
};
pub use dispatch::{EventDispatcher, EventStream};
pub use settings::{ClientCredentials, Settings};
pub use stream::proto::Donation;
pub use stream::session::{ConnectionState, PendingAlert, RealtimeError, RealtimeSession, SessionEvent};
