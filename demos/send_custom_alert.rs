use std::error::Error;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use donationalerts_sdk::api::CustomAlert;
use donationalerts_sdk::auth::{AuthSession, LoopbackAccessTokenProvider, MemoryTokenStore};
use donationalerts_sdk::settings::Settings;
use donationalerts_sdk::stream::session::{ConnectionState, RealtimeSession, SessionEvent};
use tracing_subscriber::EnvFilter;

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let auth = AuthSession::new(
            &settings,
            Arc::new(MemoryTokenStore::new()),
            Arc::new(LoopbackAccessTokenProvider::new(settings.clone())),
        )?;
        let session = RealtimeSession::new(auth, &settings);
        let mut events = session.subscribe();
        session.connect();

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::ConnectionStateChanged(ConnectionState::Connected) => break,
                SessionEvent::ConnectionStateChanged(ConnectionState::NotConnected) => {
                    return Err("connection failed".into());
                }
                _ => {}
            }
        }

        let alert = CustomAlert::new(
            format!("demo-{}", now_ms()),
            "Hello from Rust",
            "This alert was sent by the donationalerts-sdk demo.",
        );
        let body = session.send_custom_alert(alert)?.await?;
        println!("custom alert accepted: {body}");

        session.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
