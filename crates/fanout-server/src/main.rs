use anyhow::Result;
use fanout_server::relay::ShutdownCause;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fanout relay...");

    // Load configuration
    let config = fanout_server::state::Config::load()?;

    let (app, relay) = fanout_server::create_app(config.clone())?;

    // Start the server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Listening on {}", config.bind_address);
    tracing::info!("POST a base64 session description to / to start publishing");

    let signal_relay = relay.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    signal_relay.shutdown(ShutdownCause::Requested).await;
                }
                cause = signal_relay.terminated() => {
                    tracing::info!("Relay stopped: {}", cause);
                }
            }
        })
        .await?;

    let cause = relay.terminated().await;
    if cause.is_fatal() {
        anyhow::bail!("relay stopped: {}", cause);
    }

    tracing::info!("Fanout relay stopped: {}", cause);

    Ok(())
}
