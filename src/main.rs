use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use stayd::property::PropertyManager;
use stayd::wire;

/// Runtime knobs, all read from STAYD_* environment variables.
struct Config {
    bind: String,
    port: String,
    data_dir: String,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    hold_ttl_secs: i64,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: env_or("STAYD_BIND", "0.0.0.0"),
            port: env_or("STAYD_PORT", "5433"),
            data_dir: env_or("STAYD_DATA_DIR", "./data"),
            password: env_or("STAYD_PASSWORD", "stayd"),
            max_connections: env_parsed("STAYD_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: env_parsed("STAYD_COMPACT_THRESHOLD").unwrap_or(1000),
            hold_ttl_secs: env_parsed("STAYD_HOLD_TTL_SECS").unwrap_or(900),
            metrics_port: env_parsed("STAYD_METRICS_PORT"),
            tls_cert: std::env::var("STAYD_TLS_CERT").ok(),
            tls_key: std::env::var("STAYD_TLS_KEY").ok(),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env();
    stayd::observability::init(cfg.metrics_port);

    let tls_acceptor =
        stayd::tls::load_tls_acceptor(cfg.tls_cert.as_deref(), cfg.tls_key.as_deref())?;
    std::fs::create_dir_all(&cfg.data_dir)?;

    let properties = Arc::new(PropertyManager::new(
        PathBuf::from(&cfg.data_dir),
        cfg.compact_threshold,
        cfg.hold_ttl_secs * 1000,
    ));
    let semaphore = Arc::new(Semaphore::new(cfg.max_connections));

    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("stayd listening on {addr}");
    info!("  data_dir: {}", cfg.data_dir);
    info!("  max_connections: {}", cfg.max_connections);
    info!("  hold_ttl: {}s", cfg.hold_ttl_secs);
    info!(
        "  tls: {}",
        if tls_acceptor.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    info!(
        "  metrics: {}",
        cfg.metrics_port
            .map_or("disabled".to_string(), |p| format!(
                "http://0.0.0.0:{p}/metrics"
            ))
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(stayd::observability::CONNECTIONS_REJECTED_TOTAL)
                        .increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(stayd::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(stayd::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let props = properties.clone();
                let pw = cfg.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, props, pw, tls).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(stayd::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain(&semaphore, cfg.max_connections).await;
    properties.shutdown();
    info!("stayd stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Give in-flight connections up to ten seconds to finish.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            let remaining = max_connections - semaphore.available_permits();
            warn!("drain timeout, {remaining} connections still open");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
