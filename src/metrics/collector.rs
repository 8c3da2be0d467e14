//! Metrics collection and registry.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::context::StreamRegistry;
use crate::stream::{StreamState, StreamStats};

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// State of one camera stream at a point in time.
#[derive(Debug, Clone)]
pub struct StreamSample {
    pub camera: String,
    pub stats: StreamStats,
    pub acquisitions: u64,
    pub failures: u64,
}

/// A snapshot of all streams for metrics update.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub streams: Vec<StreamSample>,
}

impl MetricsSnapshot {
    /// Samples every registered stream.
    pub fn from_registry(registry: &StreamRegistry) -> Self {
        Self {
            streams: registry
                .entries()
                .iter()
                .map(|entry| StreamSample {
                    camera: entry.camera_id().to_string(),
                    stats: entry.stats(),
                    acquisitions: entry.acquisitions(),
                    failures: entry.failures(),
                })
                .collect(),
        }
    }
}

fn state_code(state: StreamState) -> i64 {
    match state {
        StreamState::Init => 0,
        StreamState::StartRequested => 1,
        StreamState::Streaming => 2,
        StreamState::StoppedOnError => 3,
    }
}

/// Prometheus metrics registry for camera streams, labelled by camera id.
pub struct MetricsRegistry {
    registry: Registry,

    // Stream state
    state: IntGaugeVec,
    queue_length: IntGaugeVec,

    // Frame counters
    frames_queued: IntCounterVec,
    frames_sent: IntCounterVec,
    bytes_sent: IntCounterVec,
    frames_dropped: IntCounterVec,
    frames_rejected: IntCounterVec,

    // Supervisor
    acquisitions: IntCounterVec,
    failures: IntCounterVec,
}

impl MetricsRegistry {
    /// Creates a new metrics registry with all stream metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| IntGaugeVec::new(Opts::new(name, help), &["camera"]);
        let counter =
            |name: &str, help: &str| IntCounterVec::new(Opts::new(name, help), &["camera"]);

        let state = gauge(
            "camstream_stream_state",
            "Stream state (0=init, 1=start requested, 2=streaming, 3=stopped on error)",
        )?;
        let queue_length = gauge("camstream_queue_length", "Frames waiting to be sent")?;
        let frames_queued = counter("camstream_frames_queued_total", "Frames accepted into the queue")?;
        let frames_sent = counter("camstream_frames_sent_total", "Frames written to a client")?;
        let bytes_sent = counter("camstream_bytes_sent_total", "Payload bytes written to a client")?;
        let frames_dropped = counter(
            "camstream_frames_dropped_total",
            "Frames evicted from a full queue",
        )?;
        let frames_rejected = counter(
            "camstream_frames_rejected_total",
            "Frames returned to the camera without being queued",
        )?;
        let acquisitions = counter(
            "camstream_acquisitions_total",
            "Acquisitions started by the camera supervisor",
        )?;
        let failures = counter(
            "camstream_session_failures_total",
            "Camera supervisor cycles that ended in an error",
        )?;

        registry.register(Box::new(state.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(frames_queued.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(frames_rejected.clone()))?;
        registry.register(Box::new(acquisitions.clone()))?;
        registry.register(Box::new(failures.clone()))?;

        Ok(Self {
            registry,
            state,
            queue_length,
            frames_queued,
            frames_sent,
            bytes_sent,
            frames_dropped,
            frames_rejected,
            acquisitions,
            failures,
        })
    }

    /// Updates all metrics from a snapshot of the streams.
    ///
    /// Counters are advanced by the difference to their current value, so
    /// concurrent callers must be serialized.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        for sample in &snapshot.streams {
            let labels = [sample.camera.as_str()];
            let stats = &sample.stats;
            self.state
                .with_label_values(&labels)
                .set(state_code(stats.state));
            self.queue_length
                .with_label_values(&labels)
                .set(stats.queue_len as i64);

            // Counters only move forward, so add the difference
            let counters = [
                (&self.frames_queued, stats.queued),
                (&self.frames_sent, stats.sent),
                (&self.bytes_sent, stats.bytes_sent),
                (&self.frames_dropped, stats.dropped),
                (&self.frames_rejected, stats.rejected),
                (&self.acquisitions, sample.acquisitions),
                (&self.failures, sample.failures),
            ];
            for (vec, total) in counters {
                let counter = vec.with_label_values(&labels);
                let current = counter.get();
                if total > current {
                    counter.inc_by(total - current);
                }
            }
        }
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
