use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse::<usize>().ok()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

fn apply_env_overrides(cfg: &mut node_router::AppConfig) -> anyhow::Result<()> {
    if let Some(addr) = env_string("LISTEN_ADDR") {
        cfg.listen_addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid LISTEN_ADDR {addr:?}: {e}"))?;
    }
    if let Some(secs) = env_u64("DISCOVERY_REFRESH_SECS") {
        cfg.discovery_refresh = Duration::from_secs(secs);
    }
    if let Some(ms) = env_u64("HEALTH_TIMEOUT_MS") {
        cfg.health_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("DISCOVERY_TIMEOUT_MS") {
        cfg.discovery_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("FORWARD_TIMEOUT_MS") {
        cfg.forward_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("UPSTREAM_CONNECT_TIMEOUT_MS") {
        cfg.upstream_connect_timeout = Duration::from_millis(ms);
    }
    if let Some(value) = env_usize("MAX_REQUEST_BYTES") {
        cfg.max_request_bytes = value;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = PathBuf::from(
        env_string("GATEWAY_CONFIG").unwrap_or_else(|| "gateway.toml".to_string()),
    );
    let node_router::config::LoadedConfig { mut app, registry } =
        node_router::config::load_from_file(&config_path)?;
    apply_env_overrides(&mut app)?;

    let listen = app.listen_addr;
    tracing::info!(
        config = %config_path.display(),
        nodes = registry.len(),
        client_keys = app.client_api_keys.len(),
        "configuration loaded"
    );

    let state = node_router::AppState::new(app, registry);
    state.refresh_routes().await;
    node_router::spawn_discovery_refresh(state.clone());
    let app = node_router::app(state);

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
