//! Prometheus metrics exporter for camera streams.
//!
//! Every metric carries a `camera` label with the camera id.
//!
//! # Metrics Exposed
//!
//! ## Stream Metrics
//! - `camstream_stream_state` - Stream state (0=init, 1=start requested, 2=streaming, 3=stopped on error)
//! - `camstream_queue_length` - Frames waiting to be sent
//! - `camstream_frames_queued_total` - Frames accepted into the queue
//! - `camstream_frames_sent_total` - Frames written to a client
//! - `camstream_bytes_sent_total` - Payload bytes written to a client
//! - `camstream_frames_dropped_total` - Frames evicted from a full queue
//! - `camstream_frames_rejected_total` - Frames returned without being queued
//!
//! ## Supervisor Metrics
//! - `camstream_acquisitions_total` - Acquisitions started
//! - `camstream_session_failures_total` - Supervisor cycles that ended in an error
//!
//! # Example
//!
//! ```no_run
//! use camstream::context::StreamRegistry;
//! use camstream::metrics::{MetricsRegistry, MetricsSnapshot};
//!
//! let streams = StreamRegistry::new();
//! let registry = MetricsRegistry::new().expect("Failed to create registry");
//! registry.update(&MetricsSnapshot::from_registry(&streams));
//! println!("{}", registry.encode().unwrap());
//! ```

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{MetricsError, MetricsRegistry, MetricsSnapshot, StreamSample};
#[cfg(feature = "metrics")]
pub use server::{ExporterError, MetricsServer, MetricsServerConfig, MetricsState};
