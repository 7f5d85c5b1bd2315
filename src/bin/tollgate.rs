use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tollgate::Gateway;
use tollgate::gateway::config::{CachedConfig, FileConfigSource};
use tollgate::gateway::http::{GatewayHttpState, router};
use tollgate::gateway::memory_store::MemoryCounterStore;
use tollgate::gateway::store::CounterStore;
use tollgate::gateway::sweeper::HealthSweeper;
use tollgate::gateway::upstream::HttpUpstream;

/// Admission, quota and routing gateway for OpenAI-compatible chat completions.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Gateway config file (TOML, JSON by extension, YAML with `gateway-config-yaml`).
    #[arg(long, env = "TOLLGATE_CONFIG")]
    config: PathBuf,

    #[arg(long, env = "TOLLGATE_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Seconds a loaded config snapshot is served before the file is re-read.
    #[arg(long, env = "TOLLGATE_CONFIG_TTL_SECS", default_value_t = 5)]
    config_ttl_secs: u64,

    /// Redis URL for shared counters; without it counters stay in process.
    #[arg(long, env = "TOLLGATE_REDIS")]
    redis: Option<String>,

    #[arg(long, env = "TOLLGATE_REDIS_PREFIX")]
    redis_prefix: Option<String>,

    /// Enables the admin routes, checked against the `x-admin-token` header.
    #[arg(long, env = "TOLLGATE_ADMIN_TOKEN")]
    admin_token: Option<String>,

    #[arg(long, env = "TOLLGATE_JSON_LOGS")]
    json_logs: bool,

    /// Background health sweep period; 0 disables the sweeper.
    #[arg(long, env = "TOLLGATE_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    #[arg(long, env = "TOLLGATE_OTEL")]
    otel: bool,

    /// OTLP/HTTP collector endpoint; implies `--otel`.
    #[arg(long, env = "TOLLGATE_OTEL_ENDPOINT")]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> tollgate::Result<()> {
    let args = Args::parse();
    let otel_enabled = args.otel || args.otel_endpoint.is_some();
    let _otel_guard = attach_otel(otel_enabled, args.otel_endpoint.as_deref(), args.json_logs)?;
    if !otel_enabled {
        tollgate::gateway::logging::init_logging(args.json_logs)?;
    }
    run(args).await
}

async fn run(args: Args) -> tollgate::Result<()> {
    let config = CachedConfig::load(
        Arc::new(FileConfigSource::new(args.config.clone())),
        Duration::from_secs(args.config_ttl_secs),
    )
    .await?;
    let store = attach_store(args.redis.as_deref(), args.redis_prefix)?;
    let gateway = Arc::new(Gateway::new(
        Arc::new(config),
        store,
        Arc::new(HttpUpstream::new()?),
    ));
    if let Err(err) = gateway.ping_store().await {
        tracing::warn!(error = %err, "counter store not reachable at startup");
    }

    let mut sweeper = HealthSweeper::new(
        gateway.clone(),
        Duration::from_secs(args.sweep_interval_secs),
    );
    if args.sweep_interval_secs > 0 {
        sweeper.start();
    }

    let mut state = GatewayHttpState::new(gateway);
    match args.admin_token {
        Some(token) => state = state.with_admin_token(token),
        None => tracing::info!("admin routes disabled; set --admin-token to enable"),
    }

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, config = %args.config.display(), "tollgate listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop();
    tracing::info!("tollgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(feature = "gateway-store-redis")]
fn attach_store(
    redis_url: Option<&str>,
    redis_prefix: Option<String>,
) -> tollgate::Result<Arc<dyn CounterStore>> {
    let Some(url) = redis_url else {
        return Ok(Arc::new(MemoryCounterStore::new()));
    };
    let mut store = tollgate::gateway::redis_store::RedisCounterStore::new(url)?;
    if let Some(prefix) = redis_prefix {
        store = store.with_prefix(prefix);
    }
    tracing::info!(prefix = store.prefix(), "using redis counter store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "gateway-store-redis"))]
fn attach_store(
    redis_url: Option<&str>,
    _redis_prefix: Option<String>,
) -> tollgate::Result<Arc<dyn CounterStore>> {
    if redis_url.is_some() {
        return Err(tollgate::TollgateError::Unsupported(
            "redis requires `--features gateway-store-redis`".to_string(),
        ));
    }
    Ok(Arc::new(MemoryCounterStore::new()))
}

#[cfg(feature = "gateway-otel")]
fn attach_otel(
    enabled: bool,
    endpoint: Option<&str>,
    json_logs: bool,
) -> tollgate::Result<Option<tollgate::gateway::otel::OtelGuard>> {
    if !enabled {
        return Ok(None);
    }
    Ok(Some(tollgate::gateway::otel::init_tracing(
        "tollgate", endpoint, json_logs,
    )?))
}

#[cfg(not(feature = "gateway-otel"))]
fn attach_otel(
    enabled: bool,
    _endpoint: Option<&str>,
    _json_logs: bool,
) -> tollgate::Result<Option<()>> {
    if enabled {
        return Err(tollgate::TollgateError::Unsupported(
            "otel requires `--features gateway-otel`".to_string(),
        ));
    }
    Ok(None)
}
