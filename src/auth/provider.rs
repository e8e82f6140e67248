//! Token acquisition capability.

use async_trait::async_trait;

use crate::auth::store::TokenVault;

/// Completion report of one [`AccessTokenProvider`] run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProviderOutcome {
    /// The procedure ran to completion.
    pub done: bool,
    /// The procedure reported an error.
    pub error: bool,
}

impl ProviderOutcome {
    pub fn succeeded() -> Self {
        Self {
            done: true,
            error: false,
        }
    }

    pub fn failed() -> Self {
        Self {
            done: true,
            error: true,
        }
    }

    /// Outcome used when a run is cancelled before it finished.
    pub fn cancelled() -> Self {
        Self {
            done: false,
            error: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.done && !self.error
    }
}

/// Performs user consent and code exchange, leaving tokens in the vault.
///
/// One implementation is chosen by the host application and injected into
/// [`AuthSession`](crate::auth::session::AuthSession). A run counts as
/// successful only when it returns [`ProviderOutcome::succeeded`] *and* a
/// non-empty access token is present in `vault` afterwards.
///
/// Runs may be dropped mid-flight when authorization is cancelled, so
/// implementations must not rely on reaching the end of the future.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn provide_access_token(&self, vault: &TokenVault) -> ProviderOutcome;
}
