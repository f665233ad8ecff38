//! Pull-based stats endpoint.
//!
//! Every run exposes its [`StatsSnapshot`] as JSON over HTTP at
//! `/debug/vars`. Supervisors poll it with [`poll_for_stats`] until a
//! predicate such as `state == cleaning_up` holds.

use crate::error::{Error, Result};
use crate::metrics::{StatsSnapshot, WorkerMetrics};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Path serving the snapshot.
pub const STATS_PATH: &str = "/debug/vars";

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP server answering stats requests.
#[derive(Debug)]
pub struct StatsServer {
    listener: TcpListener,
    metrics: Arc<WorkerMetrics>,
}

impl StatsServer {
    /// Bind to `addr`. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: SocketAddr, metrics: Arc<WorkerMetrics>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, metrics })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let app = router(self.metrics);
        tracing::info!(addr = %addr, "Stats endpoint listening");

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!(addr = %addr, "Stats endpoint shutting down");
            })
            .await?;
        Ok(())
    }

    /// Run in the background.
    pub fn spawn(self) -> Result<StatsHandle> {
        let addr = self.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(shutdown.clone()));
        Ok(StatsHandle {
            addr,
            shutdown,
            task,
        })
    }
}

fn router(metrics: Arc<WorkerMetrics>) -> Router {
    Router::new()
        .route(STATS_PATH, get(stats_handler))
        .route("/", get(stats_handler))
        .fallback(not_found)
        .with_state(metrics)
}

async fn stats_handler(State(metrics): State<Arc<WorkerMetrics>>) -> Json<StatsSnapshot> {
    Json(metrics.snapshot())
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
}

/// A running stats endpoint.
#[derive(Debug)]
pub struct StatsHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl StatsHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for the listener to close.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| Error::Internal(format!("stats task failed: {}", e)))?
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::Internal(format!("building stats client: {}", e)))
}

fn stats_url(addr: SocketAddr) -> String {
    format!("http://{}{}", addr, STATS_PATH)
}

/// Fetch one snapshot from a stats endpoint.
pub async fn fetch_stats(addr: SocketAddr) -> Result<StatsSnapshot> {
    fetch_with(&http_client()?, addr).await
}

async fn fetch_with(client: &reqwest::Client, addr: SocketAddr) -> Result<StatsSnapshot> {
    let response = client
        .get(stats_url(addr))
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("fetching stats from {}", addr))
            } else {
                Error::Network(format!("stats endpoint {}: {}", addr, e))
            }
        })?;
    response
        .json::<StatsSnapshot>()
        .await
        .map_err(|e| Error::Network(format!("decoding stats from {}: {}", addr, e)))
}

/// Poll `addr` every `interval` until `predicate` holds, or fail after `timeout`.
///
/// Fetch failures are retried until the deadline; the endpoint may not be
/// listening yet when polling starts.
pub async fn poll_for_stats<P>(
    addr: SocketAddr,
    predicate: P,
    timeout: Duration,
    interval: Duration,
) -> Result<StatsSnapshot>
where
    P: Fn(&StatsSnapshot) -> bool,
{
    let client = http_client()?;
    let deadline = Instant::now() + timeout;
    let mut last = String::from("no response");
    loop {
        match fetch_with(&client, addr).await {
            Ok(snapshot) if predicate(&snapshot) => return Ok(snapshot),
            Ok(snapshot) => last = format!("state {}", snapshot.state),
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Stats poll failed");
                last = e.to_string();
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout(format!(
                "stats at {} did not satisfy predicate within {:?} ({})",
                addr, timeout, last
            )));
        }
        tokio::time::sleep(interval.min(remaining)).await;
    }
}
