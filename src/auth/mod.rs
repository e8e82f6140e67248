//! Authorization: where tokens live, how they are obtained, and the session
//! that keeps one usable access token current.

/// Local-callback consent with PKCE and refresh-token renewal.
pub mod loopback;
/// Pluggable access-token acquisition.
pub mod provider;
/// Single-flight acquisition and socket-token exchange.
pub mod session;
/// Token persistence.
pub mod store;

pub use loopback::{AuthorizationPrompt, LogPrompt, LoopbackAccessTokenProvider, LoopbackError};
pub use provider::{AccessTokenProvider, ProviderOutcome};
pub use session::{AuthError, AuthSession, SessionGrant};
pub use store::{MemoryTokenStore, TokenStore, TokenVault};
