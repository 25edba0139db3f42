use std::net::SocketAddr;

use pagewire_server::config::AppConfig;
use pagewire_server::server::{build_router, shutdown_signal};
use pagewire_server::state::AppState;
use pagewire_server::sweep::spawn_sweeper;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = AppConfig::from_env();
    let cache = pagewire_cache::connect(cfg.redis.url.as_deref()).await?;
    let addr: SocketAddr = cfg.bind_addr.parse()?;
    let state = AppState::new(cache.cache(), cfg)?;

    let sweeper = spawn_sweeper(state.clone());
    let app = build_router(state.clone());

    info!("Starting pagewire on {addr}");
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    sweeper.abort();
    cache.shutdown();
    info!("pagewire stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
