//! Process-wide state shared by the camera, control and metrics threads.
//!
//! Everything a thread needs is reachable from one [`AppContext`] passed in
//! an `Arc`; there are no globals.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::capture::SessionPhase;
use crate::config::{CameraConfig, Settings};
use crate::stream::{StreamBridge, StreamStats};

/// Cooperative shutdown signal.
///
/// Cloning yields another handle to the same flag. Threads either poll
/// [`is_set`](Self::is_set) or sleep in [`wait`](Self::wait), which
/// returns early once the flag is raised.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock() = true;
        cv.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleeps for `timeout` or until shutdown. Returns true on shutdown.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (flag, cv) = &*self.inner;
        let mut set = flag.lock();
        while !*set {
            if cv.wait_until(&mut set, deadline).timed_out() {
                break;
            }
        }
        *set
    }
}

/// One camera stream: its bridge, the port it is served on and what its
/// supervisor is doing.
#[derive(Debug)]
pub struct StreamEntry {
    camera_id: String,
    port: AtomicU16,
    bridge: Arc<StreamBridge>,
    phase: Mutex<SessionPhase>,
    acquisitions: AtomicU64,
    failures: AtomicU64,
}

impl StreamEntry {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Port the frame server listens on (the configured one until bound).
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    pub fn bridge(&self) -> &Arc<StreamBridge> {
        &self.bridge
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock() = phase;
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StreamStats {
        self.bridge.snapshot()
    }

    /// One-line summary used by the control server.
    pub fn status_line(&self) -> String {
        let stats = self.stats();
        format!(
            "{} port={} phase={} state={} queued={}/{} sent={} dropped={} rejected={} failures={}",
            self.camera_id,
            self.port(),
            self.phase(),
            stats.state,
            stats.queue_len,
            stats.queue_capacity,
            stats.sent,
            stats.dropped,
            stats.rejected,
            self.failures(),
        )
    }
}

/// Camera id → stream, filled at startup and read by everyone after.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    entries: RwLock<Vec<Arc<StreamEntry>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stream, or returns the existing one for `camera_id`.
    pub fn register(
        &self,
        camera_id: &str,
        port: u16,
        bridge: Arc<StreamBridge>,
    ) -> Arc<StreamEntry> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter().find(|e| e.camera_id == camera_id) {
            return Arc::clone(existing);
        }
        let entry = Arc::new(StreamEntry {
            camera_id: camera_id.to_string(),
            port: AtomicU16::new(port),
            bridge,
            phase: Mutex::new(SessionPhase::Locate),
            acquisitions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        entries.push(Arc::clone(&entry));
        entry
    }

    pub fn get(&self, camera_id: &str) -> Option<Arc<StreamEntry>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.camera_id == camera_id)
            .cloned()
    }

    /// All streams in registration order.
    pub fn entries(&self) -> Vec<Arc<StreamEntry>> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Everything the worker threads share.
#[derive(Debug)]
pub struct AppContext {
    pub settings: Settings,
    pub cameras: CameraConfig,
    pub registry: Arc<StreamRegistry>,
    pub shutdown: ShutdownFlag,
    pub started_at: DateTime<Local>,
}

impl AppContext {
    /// Creates the context and registers one stream per configured camera,
    /// camera `i` on port `base_port + 1 + i`.
    pub fn new(settings: Settings, cameras: CameraConfig) -> Result<Self, crate::config::ConfigError> {
        let registry = StreamRegistry::new();
        for (index, camera) in cameras.cameras.iter().enumerate() {
            let port = settings.server.camera_port(index)?;
            let bridge = Arc::new(StreamBridge::new(
                camera.id.clone(),
                settings.server.queue_capacity,
                settings.server.overflow,
            ));
            registry.register(&camera.id, port, bridge);
        }
        Ok(Self {
            settings,
            cameras,
            registry: Arc::new(registry),
            shutdown: ShutdownFlag::new(),
            started_at: Local::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::OverflowPolicy;

    #[test]
    fn test_shutdown_wait_returns_early() {
        let flag = ShutdownFlag::new();
        assert!(!flag.wait(Duration::from_millis(10)));

        let remote = flag.clone();
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.set();
        });
        let started = Instant::now();
        assert!(flag.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(flag.is_set());
        setter.join().unwrap();
    }

    #[test]
    fn test_registry_ports_follow_camera_order() {
        let cameras = CameraConfig::from_ids(["DEV_A", "DEV_B", "DEV_C"]);
        let ctx = AppContext::new(Settings::default(), cameras).unwrap();
        let ports: Vec<(String, u16)> = ctx
            .registry
            .entries()
            .iter()
            .map(|e| (e.camera_id().to_string(), e.port()))
            .collect();
        assert_eq!(
            ports,
            vec![
                ("DEV_A".to_string(), 42001),
                ("DEV_B".to_string(), 42002),
                ("DEV_C".to_string(), 42003),
            ]
        );
        assert_eq!(ctx.registry.get("DEV_B").unwrap().bridge().name(), "DEV_B");
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = StreamRegistry::new();
        let bridge = Arc::new(StreamBridge::new("X", 3, OverflowPolicy::DropOldest));
        let first = registry.register("X", 1, Arc::clone(&bridge));
        let second = registry.register("X", 2, bridge);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(second.port(), 1);
    }

    #[test]
    fn test_status_line() {
        let registry = StreamRegistry::new();
        let entry = registry.register(
            "DEV_A",
            42001,
            Arc::new(StreamBridge::new("DEV_A", 3, OverflowPolicy::DropOldest)),
        );
        entry.set_phase(SessionPhase::Acquire);
        assert_eq!(
            entry.status_line(),
            "DEV_A port=42001 phase=acquire state=init queued=0/3 sent=0 dropped=0 rejected=0 failures=0"
        );
    }
}
