//! Fixture server management - serving the app tree and health checking it

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{RunnerError, RunnerResult};

/// Readiness route served next to the fixture tree
pub const HEALTH_PATH: &str = "/__health";

/// Starts fixture servers
pub struct AppServer;

impl AppServer {
    /// Serve `root` over HTTP and resolve once the listener answers requests
    pub async fn start(root: impl AsRef<Path>, config: &ServerConfig) -> RunnerResult<ServerHandle> {
        let root = validate_root(root.as_ref())?;

        let ip: IpAddr = config.bind_host.parse().map_err(|_| {
            RunnerError::ServerStart(format!("Invalid bind host: {}", config.bind_host))
        })?;
        let bind_addr = SocketAddr::new(ip, config.port.unwrap_or(0));

        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            RunnerError::ServerStart(format!("Failed to bind {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            RunnerError::ServerStart(format!("Failed to read bound address: {}", e))
        })?;
        let host = format!("http://{}", public_addr(local_addr));

        info!("Serving fixtures from {} on {}", root.display(), host);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(&root);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let mut handle = ServerHandle {
            host,
            port: local_addr.port(),
            root,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            shutdown_timeout: config.shutdown_timeout(),
        };

        if let Err(e) = handle.wait_for_healthy(config.startup_timeout()).await {
            if let Err(stop_err) = handle.shutdown().await {
                warn!("Cleanup after failed start: {}", stop_err);
            }
            return Err(e);
        }

        info!("Fixture server is healthy at {}", handle.host);
        Ok(handle)
    }
}

/// Handle to a running fixture server
///
/// Valid from the moment [`AppServer::start`] resolves until [`ServerHandle::shutdown`].
pub struct ServerHandle {
    host: String,
    port: u16,
    root: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Base URL built from the bound address, e.g. `http://127.0.0.1:41234`
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute URL for a route under this server
    pub fn url(&self, route: &str) -> String {
        join_url(&self.host, route)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Wait for the server to respond to health checks
    async fn wait_for_healthy(&self, timeout_duration: Duration) -> RunnerResult<()> {
        let health_url = self.url(HEALTH_PATH);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if !self.is_running() {
                return Err(RunnerError::ServerStart(
                    "Serve task exited before becoming healthy".to_string(),
                ));
            }

            match client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("Health check passed after {} attempt(s)", attempts);
                    return Ok(());
                }
                Ok(resp) => {
                    warn!("Health check returned {}", resp.status());
                }
                Err(e) => {
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(50)).await;
        }

        Err(RunnerError::ServerStart(format!(
            "Health check failed after {} attempts",
            attempts
        )))
    }

    /// Stop the server and release its socket
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub async fn shutdown(&mut self) -> RunnerResult<()> {
        let Some(mut task) = self.task.take() else {
            debug!("Fixture server at {} already stopped", self.host);
            return Ok(());
        };

        info!("Stopping fixture server at {}", self.host);

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match timeout(self.shutdown_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(RunnerError::Shutdown(format!("Server error: {}", e))),
            Ok(Err(e)) => Err(RunnerError::Shutdown(format!("Serve task failed: {}", e))),
            Err(_) => {
                task.abort();
                Err(RunnerError::Shutdown(format!(
                    "Graceful shutdown exceeded {} ms, open connections were dropped",
                    self.shutdown_timeout.as_millis()
                )))
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            warn!("Fixture server at {} dropped without shutdown", self.host);
            task.abort();
        }
    }
}

fn router(root: &Path) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .fallback_service(ServeDir::new(root).append_index_html_on_directories(true))
        .layer(TraceLayer::new_for_http())
}

fn validate_root(root: &Path) -> RunnerResult<PathBuf> {
    let meta = std::fs::metadata(root).map_err(|e| {
        RunnerError::ServerStart(format!("Fixture root {}: {}", root.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(RunnerError::ServerStart(format!(
            "Fixture root {} is not a directory",
            root.display()
        )));
    }
    // Listing proves the directory is readable
    std::fs::read_dir(root).map_err(|e| {
        RunnerError::ServerStart(format!("Fixture root {} is not readable: {}", root.display(), e))
    })?;

    Ok(root.canonicalize()?)
}

/// Address to put in URLs; wildcard binds are reachable via loopback
fn public_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Join a base URL and a route, keeping any query string on the route
pub fn join_url(host: &str, route: &str) -> String {
    let host = host.trim_end_matches('/');
    if route.is_empty() {
        host.to_string()
    } else if route.starts_with('/') {
        format!("{}{}", host, route)
    } else {
        format!("{}/{}", host, route)
    }
}
