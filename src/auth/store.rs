//! Token persistence contract.
//!
//! Storage itself belongs to the host application; the SDK only needs the
//! four operations of [`TokenStore`]. [`TokenVault`] binds a store to the
//! two key names configured in [`Settings`](crate::settings::Settings).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use secrecy::{ExposeSecret, SecretString};

use crate::settings::Settings;

/// Key-value storage for named secrets.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn delete(&self, key: &str);
    fn has_key(&self, key: &str) -> bool;
}

/// Process-local store, mostly useful for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values().insert(key.to_string(), value.to_string());
    }

    fn delete(&self, key: &str) {
        self.values().remove(key);
    }

    fn has_key(&self, key: &str) -> bool {
        self.values().contains_key(key)
    }
}

/// A [`TokenStore`] together with the access/refresh key names.
#[derive(Clone)]
pub struct TokenVault {
    store: Arc<dyn TokenStore>,
    access_key: String,
    refresh_key: String,
}

impl TokenVault {
    pub fn new(store: Arc<dyn TokenStore>, settings: &Settings) -> Self {
        Self {
            store,
            access_key: settings.access_token_key.clone(),
            refresh_key: settings.refresh_token_key.clone(),
        }
    }

    /// Cached access token, if present and non-empty.
    pub fn access_token(&self) -> Option<SecretString> {
        self.non_empty(&self.access_key)
    }

    /// Cached refresh token, if present and non-empty.
    pub fn refresh_token(&self) -> Option<SecretString> {
        self.non_empty(&self.refresh_key)
    }

    pub fn set_access_token(&self, token: &SecretString) {
        self.store.set(&self.access_key, token.expose_secret());
    }

    pub fn set_refresh_token(&self, token: &SecretString) {
        self.store.set(&self.refresh_key, token.expose_secret());
    }

    /// Removes both tokens, forcing consent on the next acquisition.
    pub fn forget(&self) {
        for key in [&self.access_key, &self.refresh_key] {
            if self.store.has_key(key) {
                self.store.delete(key);
            }
        }
    }

    pub fn is_any_token_cached(&self) -> bool {
        self.store.has_key(&self.access_key) || self.store.has_key(&self.refresh_key)
    }

    fn non_empty(&self, key: &str) -> Option<SecretString> {
        self.store
            .get(key)
            .filter(|value| !value.is_empty())
            .map(SecretString::new)
    }
}

impl std::fmt::Debug for TokenVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVault")
            .field("access_key", &self.access_key)
            .field("refresh_key", &self.refresh_key)
            .finish_non_exhaustive()
    }
}
