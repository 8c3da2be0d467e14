//! Per-camera supervisor.
//!
//! Each configured camera gets one [`CameraSession`] running on its own
//! thread. The session walks through
//!
//! ```text
//! Locate → Open → Reset → Settle → Reopen → Configure → Acquire → Teardown
//!    ▲                                                               │
//!    └──────────────────────── Backoff ◀──────────── (on error) ─────┘
//! ```
//!
//! and keeps the camera's frame server alive alongside, rebuilding it when
//! its listener fails. Every step returns a typed error; nothing is retried
//! inside a step, the whole cycle is.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use thiserror::Error;

use super::{Camera, CameraError, CameraProvider, FrameObserver, REPORTED_FEATURES};
use crate::context::{AppContext, StreamEntry};
use crate::server::{FrameStreamHandler, Server, ServerConfig, ServerStatus};

/// How long the acquire loop waits on the return path before re-checking
/// shutdown and server health.
const TICK: Duration = Duration::from_millis(100);

/// How long to wait for a freshly started frame server to bind.
const SERVER_START_WAIT: Duration = Duration::from_secs(2);

/// Step of the supervisor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Locate,
    Open,
    Reset,
    Settle,
    Reopen,
    Configure,
    Acquire,
    Teardown,
    Backoff,
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Locate => "locate",
            Self::Open => "open",
            Self::Reset => "reset",
            Self::Settle => "settle",
            Self::Reopen => "reopen",
            Self::Configure => "configure",
            Self::Acquire => "acquire",
            Self::Teardown => "teardown",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why one supervisor cycle ended.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("camera {0} is not connected")]
    NotFound(String),
    #[error("{phase} failed: {source}")]
    Camera {
        phase: SessionPhase,
        #[source]
        source: CameraError,
    },
    #[error("frame return path closed")]
    ReturnPathClosed,
    #[error("shutdown requested")]
    Shutdown,
}

impl SessionError {
    fn camera(phase: SessionPhase) -> impl FnOnce(CameraError) -> Self {
        move |source| Self::Camera { phase, source }
    }
}

/// Supervises one camera and its frame server.
pub struct CameraSession {
    ctx: Arc<AppContext>,
    provider: Arc<dyn CameraProvider>,
    entry: Arc<StreamEntry>,
    /// Port from the configuration; 0 lets the OS pick on every rebuild.
    port: u16,
    server: Option<Server>,
    next_server_attempt: Instant,
}

impl CameraSession {
    pub fn new(ctx: Arc<AppContext>, provider: Arc<dyn CameraProvider>, entry: Arc<StreamEntry>) -> Self {
        let port = entry.port();
        Self {
            ctx,
            provider,
            entry,
            port,
            server: None,
            next_server_attempt: Instant::now(),
        }
    }

    pub fn camera_id(&self) -> &str {
        self.entry.camera_id()
    }

    /// Runs the session on a new thread named after the camera.
    pub fn spawn(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("camera-{}", self.camera_id()))
            .spawn(move || self.run())
    }

    /// Runs until shutdown is requested.
    pub fn run(mut self) {
        let span = tracing::info_span!("camera", id = %self.entry.camera_id());
        let _guard = span.enter();
        tracing::info!(
            port = self.port,
            started = %Local::now().format("%Y-%m-%d %H:%M:%S"),
            "Camera session started"
        );

        while !self.ctx.shutdown.is_set() {
            self.ensure_server();
            match self.cycle() {
                Ok(()) | Err(SessionError::Shutdown) => break,
                Err(e) => {
                    self.entry.record_failure();
                    tracing::error!(error = %e, failures = self.entry.failures(), "Camera session failed");
                    self.entry.set_phase(SessionPhase::Backoff);
                    if self.ctx.shutdown.wait(self.ctx.settings.capture.retry_delay()) {
                        break;
                    }
                }
            }
        }

        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        self.entry.bridge().shutdown();
        let discarded = self.entry.bridge().returned().try_iter().count();
        self.entry.set_phase(SessionPhase::Stopped);
        tracing::info!(
            discarded,
            stopped = %Local::now().format("%Y-%m-%d %H:%M:%S"),
            "Camera session stopped"
        );
    }

    /// One pass from locating the camera to tearing it down. Returns
    /// `Ok` only when shutdown was requested while acquiring.
    fn cycle(&mut self) -> Result<(), SessionError> {
        let id = self.entry.camera_id().to_string();
        let capture = &self.ctx.settings.capture;

        self.enter(SessionPhase::Locate);
        let visible = self
            .provider
            .list_cameras()
            .map_err(SessionError::camera(SessionPhase::Locate))?;
        if !visible.iter().any(|v| *v == id) {
            return Err(SessionError::NotFound(id));
        }

        self.enter(SessionPhase::Open);
        let mut camera = self
            .provider
            .open(&id)
            .map_err(SessionError::camera(SessionPhase::Open))?;

        if !capture.skip_reset {
            self.enter(SessionPhase::Reset);
            let reset = camera.reset();
            camera.close();
            drop(camera);
            reset.map_err(SessionError::camera(SessionPhase::Reset))?;

            self.enter(SessionPhase::Settle);
            if self.ctx.shutdown.wait(capture.reset_settle()) {
                return Err(SessionError::Shutdown);
            }

            self.enter(SessionPhase::Reopen);
            camera = self
                .provider
                .open(&id)
                .map_err(SessionError::camera(SessionPhase::Reopen))?;
        }

        self.enter(SessionPhase::Configure);
        let configured = self.configure(camera.as_mut());
        let result = match configured {
            Ok(payload) => {
                self.enter(SessionPhase::Acquire);
                self.acquire(camera.as_mut(), payload)
            }
            Err(e) => Err(e),
        };

        self.enter(SessionPhase::Teardown);
        if let Err(e) = camera.stop_acquisition() {
            tracing::warn!(error = %e, "Failed to stop acquisition");
        }
        camera.close();
        result
    }

    fn enter(&self, phase: SessionPhase) {
        tracing::debug!(%phase, "Session phase");
        self.entry.set_phase(phase);
    }

    /// Applies the configured defaults and returns the payload size.
    ///
    /// A default that cannot be applied is logged and skipped.
    fn configure(&self, camera: &mut dyn Camera) -> Result<usize, SessionError> {
        if let Some(config) = self.ctx.cameras.camera(camera.id()) {
            for setting in &config.defaults {
                let applied = setting
                    .feature_value()
                    .map_err(|e| e.to_string())
                    .and_then(|value| {
                        camera
                            .set_feature(&setting.name, &value)
                            .map(|()| value)
                            .map_err(|e| e.to_string())
                    });
                match applied {
                    Ok(value) => tracing::info!(
                        feature = %setting.name,
                        %value,
                        comment = %setting.comment,
                        "Default setting applied"
                    ),
                    Err(error) => tracing::warn!(
                        feature = %setting.name,
                        value = %setting.value,
                        method = %setting.method,
                        comment = %setting.comment,
                        %error,
                        "Failed to apply default setting"
                    ),
                }
            }
        }

        for name in REPORTED_FEATURES {
            match camera.feature(name) {
                Ok(value) => tracing::info!(feature = name, %value, "Camera feature"),
                Err(e) => tracing::debug!(feature = name, error = %e, "Feature not readable"),
            }
        }

        camera
            .payload_size()
            .map_err(SessionError::camera(SessionPhase::Configure))
    }

    /// Streams until shutdown or a camera error, re-queueing every frame
    /// the bridge hands back.
    fn acquire(&mut self, camera: &mut dyn Camera, payload: usize) -> Result<(), SessionError> {
        let bridge = Arc::clone(self.entry.bridge());
        let returned = bridge.returned();
        let stale = returned.try_iter().count();
        if stale > 0 {
            tracing::debug!(stale, "Discarded frames of a previous acquisition");
        }

        let buffers = self.ctx.settings.capture.buffer_count;
        let observer: Arc<dyn FrameObserver> = bridge;
        camera
            .start_acquisition(buffers, observer)
            .map_err(SessionError::camera(SessionPhase::Acquire))?;
        self.entry.record_acquisition();
        tracing::info!(buffers, payload, "Acquisition started");

        let started = Instant::now();
        let mut requeued = 0u64;
        let mut foreign = 0u64;
        let result = loop {
            if self.ctx.shutdown.is_set() {
                break Ok(());
            }
            self.ensure_server();
            if !camera.is_acquiring() {
                break Err(SessionError::Camera {
                    phase: SessionPhase::Acquire,
                    source: CameraError::NotAcquiring,
                });
            }
            match returned.recv_timeout(TICK) {
                Ok(frame) => match camera.queue_frame(frame) {
                    Ok(()) => requeued += 1,
                    Err(CameraError::ForeignBuffer { session, slot }) => {
                        foreign += 1;
                        tracing::debug!(session, slot, "Discarded frame of another acquisition");
                    }
                    Err(e) => {
                        break Err(SessionError::Camera {
                            phase: SessionPhase::Acquire,
                            source: e,
                        })
                    }
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break Err(SessionError::ReturnPathClosed),
            }
        };

        let secs = started.elapsed().as_secs_f64();
        let fps = if secs > 0.0 { requeued as f64 / secs } else { 0.0 };
        tracing::info!(
            frames = requeued,
            foreign,
            secs,
            fps,
            mbytes_per_sec = fps * payload as f64 / 1e6,
            "Acquisition finished"
        );
        result
    }

    /// Starts the frame server, or replaces it after it failed.
    fn ensure_server(&mut self) {
        let healthy = self
            .server
            .as_ref()
            .is_some_and(|s| s.status() != ServerStatus::Error);
        if healthy || Instant::now() < self.next_server_attempt {
            return;
        }
        if let Some(mut failed) = self.server.take() {
            tracing::warn!(
                error = %failed.last_error().unwrap_or_default(),
                "Frame server failed, rebuilding"
            );
            failed.stop();
        }
        self.next_server_attempt = Instant::now() + self.ctx.settings.capture.retry_delay();

        let settings = &self.ctx.settings.server;
        let config = ServerConfig::from_settings(
            format!("camserver_{}", self.entry.camera_id()),
            self.port,
            settings,
        );
        let handler = FrameStreamHandler::new(
            Arc::clone(self.entry.bridge()),
            settings.header,
            settings.frame_timeout(),
        );
        let server = match Server::start(config, handler) {
            Ok(server) => server,
            Err(e) => {
                tracing::error!(error = %e, "Cannot start frame server");
                return;
            }
        };
        match server.wait_until_running(SERVER_START_WAIT) {
            Ok(addr) => self.entry.set_port(addr.port()),
            Err(e) => tracing::error!(error = %e, "Frame server did not come up"),
        }
        self.server = Some(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(SessionPhase::Acquire.to_string(), "acquire");
        assert_eq!(SessionPhase::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_error_names_phase() {
        let e = SessionError::Camera {
            phase: SessionPhase::Reopen,
            source: CameraError::OpenFailed("busy".into()),
        };
        assert_eq!(e.to_string(), "reopen failed: failed to open camera: busy");
    }
}
