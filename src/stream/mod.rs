//! Realtime stream modules.
//!
//! - `client`: websocket transport worker and outbound frame queue.
//! - `proto`: handshake, subscribe and publication frames.
//! - `session`: connection state machine, donation events and custom alerts.

/// Websocket connection and frame sender.
pub mod client;
/// Stream protocol frames.
pub mod proto;
/// Session that drives the connect sequence and emits typed events.
pub mod session;
