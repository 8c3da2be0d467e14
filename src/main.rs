//! Camera Streaming Server CLI
//!
//! Starts one frame server per camera listed in `config.xml` plus a
//! control server on the base port, and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camstream::{
    capture::{CameraProvider, CameraSession, SimulatedProvider},
    config::{Backend, CameraConfig, Overrides, Settings},
    context::AppContext,
    server::{ControlHandler, Server, ServerConfig},
};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Simulated,
    V4l2,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Simulated => Backend::Simulated,
            BackendArg::V4l2 => Backend::V4l2,
        }
    }
}

/// Streams camera frames to TCP clients.
#[derive(Debug, Parser)]
#[command(name = "camstream", version, about)]
struct Cli {
    /// Control server port; camera i streams on PORT + 1 + i
    port: Option<u16>,

    /// Camera list with per-camera default settings
    #[arg(long, default_value = "config.xml")]
    config: PathBuf,

    /// Runtime settings (TOML)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Frames buffered per stream
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Send the 12-byte header of older clients
    #[arg(long)]
    legacy_header: bool,

    /// Serve Prometheus metrics on this port (0 disables)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Camera backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();
    info!("camstream v{}", camstream::VERSION);

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = match &cli.settings {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    settings.apply(&Overrides {
        base_port: cli.port,
        queue_capacity: cli.queue_capacity,
        legacy_header: cli.legacy_header,
        metrics_port: cli.metrics_port,
        backend: cli.backend.map(Backend::from),
    });
    settings.validate()?;

    let cameras = CameraConfig::from_file(&cli.config)?;
    if cameras.is_empty() {
        warn!(config = %cli.config.display(), "No cameras configured");
    }
    for (i, id) in cameras.ids().enumerate() {
        info!(index = i, camera = id, "Configured camera");
    }

    let provider = make_provider(settings.capture.backend, &cameras)?;
    let ctx = Arc::new(AppContext::new(settings, cameras)?);

    {
        let shutdown = ctx.shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            shutdown.set();
        })?;
    }

    let server_settings = &ctx.settings.server;
    let mut control = Server::start(
        ServerConfig::from_settings("CTRL_SERV", server_settings.base_port, server_settings),
        ControlHandler::new(Arc::clone(&ctx.registry)),
    )?;
    match control.wait_until_running(Duration::from_secs(2)) {
        Ok(addr) => info!(%addr, "Control server running"),
        Err(e) => warn!(error = %e, "Control server not available"),
    }

    let metrics = start_metrics(&ctx);

    let mut sessions = Vec::new();
    for entry in ctx.registry.entries() {
        let session = CameraSession::new(Arc::clone(&ctx), Arc::clone(&provider), entry);
        sessions.push(session.spawn()?);
    }

    for handle in sessions {
        if handle.join().is_err() {
            error!("Camera thread panicked");
        }
    }
    // Sessions only return after shutdown was requested.
    control.stop();
    if let Some(handle) = metrics {
        if handle.join().is_err() {
            error!("Metrics thread panicked");
        }
    }

    let uptime = chrono::Local::now().signed_duration_since(ctx.started_at);
    info!(uptime_secs = uptime.num_seconds(), "Done");
    Ok(())
}

fn make_provider(
    backend: Backend,
    cameras: &CameraConfig,
) -> Result<Arc<dyn CameraProvider>, Box<dyn std::error::Error>> {
    match backend {
        Backend::Simulated => {
            info!("Using simulated cameras");
            Ok(Arc::new(SimulatedProvider::new(cameras.ids())))
        }
        #[cfg(feature = "v4l2")]
        Backend::V4l2 => Ok(Arc::new(camstream::capture::V4l2Provider::new())),
        #[cfg(not(feature = "v4l2"))]
        Backend::V4l2 => Err("this build has no V4L2 support (enable the `v4l2` feature)".into()),
    }
}

#[cfg(feature = "metrics")]
fn start_metrics(ctx: &Arc<AppContext>) -> Option<std::thread::JoinHandle<()>> {
    use camstream::metrics::{MetricsRegistry, MetricsServer, MetricsServerConfig};

    let port = ctx.settings.metrics.port;
    if port == 0 {
        return None;
    }
    let registry = match MetricsRegistry::new() {
        Ok(registry) => registry,
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            return None;
        }
    };
    let server = MetricsServer::new(
        MetricsServerConfig::with_port(port),
        registry,
        Arc::clone(&ctx.registry),
    );
    match server.spawn(ctx.shutdown.clone()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to start metrics thread");
            None
        }
    }
}

#[cfg(not(feature = "metrics"))]
fn start_metrics(ctx: &Arc<AppContext>) -> Option<std::thread::JoinHandle<()>> {
    if ctx.settings.metrics.port != 0 {
        warn!("Metrics port given but this build has no `metrics` feature");
    }
    None
}
