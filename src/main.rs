use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use parkd::engine::Engine;
use parkd::notify::NotifyHub;
use parkd::observability;
use parkd::{reaper, wire};

/// Parsed env var, or `default` when unset or unparsable.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("PARKD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    observability::init(metrics_port)?;

    let port: u16 = env_or("PARKD_PORT", 5433);
    let bind = env_or("PARKD_BIND", "0.0.0.0".to_string());
    let data_dir = env_or("PARKD_DATA_DIR", "./data".to_string());
    let password = env_or("PARKD_PASSWORD", "parkd".to_string());
    let admin_user = env_or("PARKD_ADMIN_USER", "admin".to_string());
    let max_connections: usize = env_or("PARKD_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("PARKD_COMPACT_THRESHOLD", 1000);
    let sweep_interval = Duration::from_secs(env_or("PARKD_SWEEP_INTERVAL_SECS", 30));

    let tls_cert = std::env::var("PARKD_TLS_CERT").ok();
    let tls_key = std::env::var("PARKD_TLS_KEY").ok();
    let tls_acceptor = parkd::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("parkd.wal");
    let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
    info!("recovered {} places", engine.state.len());

    tokio::spawn(reaper::run_reaper(engine.clone(), sweep_interval));
    tokio::spawn(reaper::run_compactor(
        engine.clone(),
        compact_threshold,
        Duration::from_secs(60),
    ));

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("parkd listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  admin_user: {admin_user}");
    info!("  max_connections: {max_connections}");
    info!("  sweep_interval: {}s", sweep_interval.as_secs());
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await.ok();
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let pw = password.clone();
                let admin = admin_user.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, pw, admin, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("parkd stopped");
    Ok(())
}
