use std::error::Error;
use std::sync::Arc;

use donationalerts_sdk::auth::{AuthSession, LoopbackAccessTokenProvider, MemoryTokenStore};
use donationalerts_sdk::settings::Settings;
use donationalerts_sdk::stream::session::{ConnectionState, RealtimeSession, SessionEvent};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // DONATIONALERTS_CLIENT_ID / DONATIONALERTS_CLIENT_SECRET must be set.
    let settings = Settings::from_env();
    if !settings.credentials.contains_sensitive_data() {
        return Err("set DONATIONALERTS_CLIENT_ID and DONATIONALERTS_CLIENT_SECRET".into());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let provider = LoopbackAccessTokenProvider::with_prompt(settings.clone(), |url: &str| {
            println!("open this url to authorize: {url}");
        });
        let auth = AuthSession::new(
            &settings,
            Arc::new(MemoryTokenStore::new()),
            Arc::new(provider),
        )?;
        let session = RealtimeSession::new(auth, &settings);
        let mut events = session.subscribe();
        session.connect();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Donation(donation)) => {
                        println!(
                            "{} donated {} {}: {}",
                            donation.from, donation.amount, donation.currency, donation.message
                        );
                    }
                    Some(SessionEvent::AccessTokenRefreshed(ok)) => {
                        println!("access token refreshed: {ok}");
                    }
                    Some(SessionEvent::ConnectionStateChanged(state)) => {
                        println!("connection state: {state:?}");
                        if state == ConnectionState::NotConnected {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    session.disconnect();
                    break;
                }
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
