//! Prometheus endpoint served over HTTP.
//!
//! The streaming core runs on plain threads; the exporter gets its own
//! single-worker tokio runtime on a side thread and samples the stream
//! registry on every scrape.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use parking_lot::Mutex;
use thiserror::Error;

use crate::context::{ShutdownFlag, StreamRegistry};
use crate::metrics::{MetricsError, MetricsRegistry, MetricsSnapshot};

/// Errors that end the exporter.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("failed to bind metrics endpoint {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("metrics endpoint failed: {0}")]
    Serve(#[source] io::Error),
}

/// Where the exporter listens.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub bind_addr: SocketAddr,
}

impl MetricsServerConfig {
    /// Listens on every interface at `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], port).into(),
        }
    }
}

/// What a scrape needs: the Prometheus registry and the streams to sample.
pub struct MetricsState {
    /// Scrapes run one at a time; counter updates are read-then-add.
    registry: Mutex<MetricsRegistry>,
    streams: Arc<StreamRegistry>,
}

impl MetricsState {
    pub fn new(registry: MetricsRegistry, streams: Arc<StreamRegistry>) -> Self {
        Self {
            registry: Mutex::new(registry),
            streams,
        }
    }

    /// Samples the streams and renders the text exposition format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let registry = self.registry.lock();
        registry.update(&MetricsSnapshot::from_registry(&self.streams));
        registry.encode()
    }
}

/// HTTP exporter for the stream metrics.
pub struct MetricsServer {
    config: MetricsServerConfig,
    state: Arc<MetricsState>,
}

impl MetricsServer {
    pub fn new(
        config: MetricsServerConfig,
        registry: MetricsRegistry,
        streams: Arc<StreamRegistry>,
    ) -> Self {
        Self {
            config,
            state: Arc::new(MetricsState::new(registry, streams)),
        }
    }

    /// Serves `/metrics` and `/health` until `shutdown` is raised.
    pub async fn run(self, shutdown: ShutdownFlag) -> Result<(), ExporterError> {
        let addr = self.config.bind_addr;
        let app = Router::new()
            .route("/metrics", get(scrape))
            .route("/health", get(health))
            .with_state(self.state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ExporterError::Bind { addr, source })?;
        tracing::info!(%addr, "Metrics endpoint listening");

        // The flag is a blocking primitive, so wait for it off the reactor.
        let stopped = tokio::task::spawn_blocking(move || {
            while !shutdown.wait(Duration::from_secs(1)) {}
        });
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.await;
            })
            .await
            .map_err(ExporterError::Serve)?;

        tracing::info!(%addr, "Metrics endpoint stopped");
        Ok(())
    }

    /// Runs the exporter on a thread named `metrics`.
    pub fn spawn(self, shutdown: ShutdownFlag) -> io::Result<JoinHandle<()>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("metrics-io")
            .enable_all()
            .build()?;
        std::thread::Builder::new()
            .name("metrics".into())
            .spawn(move || {
                if let Err(e) = runtime.block_on(self.run(shutdown)) {
                    tracing::error!(error = %e, "Metrics exporter failed");
                }
            })
    }
}

async fn scrape(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    match state.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

async fn health(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    (StatusCode::OK, format!("OK streams={}\n", state.streams.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{OverflowPolicy, StreamBridge};

    #[test]
    fn test_config_with_port() {
        let config = MetricsServerConfig::with_port(9464);
        assert_eq!(config.bind_addr.port(), 9464);
        assert!(config.bind_addr.ip().is_unspecified());
    }

    #[test]
    fn test_render_samples_registry() {
        let streams = Arc::new(StreamRegistry::new());
        streams.register(
            "DEV_A",
            42001,
            Arc::new(StreamBridge::new("DEV_A", 3, OverflowPolicy::DropOldest)),
        );
        let state = MetricsState::new(MetricsRegistry::new().unwrap(), Arc::clone(&streams));
        let body = state.render().unwrap();
        assert!(body.contains("camstream_queue_length{camera=\"DEV_A\"} 0"));
    }

    #[test]
    fn test_concurrent_renders_count_once() {
        let streams = Arc::new(StreamRegistry::new());
        let entry = streams.register(
            "DEV_A",
            42001,
            Arc::new(StreamBridge::new("DEV_A", 3, OverflowPolicy::DropOldest)),
        );
        let state = Arc::new(MetricsState::new(
            MetricsRegistry::new().unwrap(),
            Arc::clone(&streams),
        ));

        let scrapers: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                let entry = Arc::clone(&entry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        entry.record_failure();
                        state.render().unwrap();
                    }
                })
            })
            .collect();
        for scraper in scrapers {
            scraper.join().unwrap();
        }

        let body = state.render().unwrap();
        assert!(body.contains("camstream_session_failures_total{camera=\"DEV_A\"} 400"));
    }
}
