//! Standalone session signature service.

use podium_lib::logging::init_tracing;
use podium_lib::signature_server::{router, AppState, Config};
use tower_http::cors::{Any, CorsLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    if config.sdk_configured() {
        tracing::info!("Video SDK credentials configured");
    } else {
        tracing::warn!("SDK_KEY/SDK_SECRET not configured, /getSignature will fail");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let listen_addr = config.listen_addr.clone();
    let app = router().layer(cors).with_state(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!("Signature server listening on {listen_addr}");
    tracing::info!("Health check: http://{listen_addr}/health");

    axum::serve(listener, app).await?;
    Ok(())
}
