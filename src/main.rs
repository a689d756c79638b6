use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use tourdesk::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use tourdesk::tenant::TenantManager;
use tourdesk::wire;

const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Server settings, read once from `TOURDESK_*` environment variables.
struct Settings {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

impl Settings {
    fn from_env() -> Self {
        Self {
            bind: var("TOURDESK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed("TOURDESK_PORT").unwrap_or(5433),
            data_dir: var("TOURDESK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: var("TOURDESK_PASSWORD").unwrap_or_else(|| "tourdesk".into()),
            max_connections: parsed("TOURDESK_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed("TOURDESK_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed("TOURDESK_METRICS_PORT"),
            tls_cert: var("TOURDESK_TLS_CERT"),
            tls_key: var("TOURDESK_TLS_KEY"),
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Unparseable values fall back to the default, with a warning.
fn parsed<T: FromStr>(name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    tourdesk::observability::init(settings.metrics_port);

    let tls_acceptor = tourdesk::tls::load_tls_acceptor(
        settings.tls_cert.as_deref(),
        settings.tls_key.as_deref(),
    )?;
    std::fs::create_dir_all(&settings.data_dir)?;

    let tenants = Arc::new(TenantManager::new(
        settings.data_dir.clone(),
        settings.compact_threshold,
    ));
    let permits = Arc::new(Semaphore::new(settings.max_connections));

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        %addr,
        data_dir = %settings.data_dir.display(),
        max_connections = settings.max_connections,
        tls = tls_acceptor.is_some(),
        metrics_port = ?settings.metrics_port,
        "tourdesk listening"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept failed: {e}");
                        continue;
                    }
                };

                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    warn!(%peer, "connection limit reached, refusing");
                    metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!(%peer, "client connected");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);

                let tenants = tenants.clone();
                let password = settings.password.clone();
                let tls = tls_acceptor.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, tenants, password, tls).await {
                        tracing::error!(%peer, "session ended with error: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown requested, no longer accepting clients");
                break;
            }
        }
    }

    drain(&permits, settings.max_connections).await;
    info!("tourdesk stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM where the platform has it.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await.ok();
}

/// Waits until every permit is back or the grace period runs out.
async fn drain(permits: &Semaphore, total: usize) {
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        let open = total - permits.available_permits();
        if open == 0 {
            info!("all sessions closed");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(open, "grace period over, exiting with sessions still open");
            return;
        }
        tick.tick().await;
    }
}
