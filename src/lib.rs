//! Camera Frame Streaming Library
//!
//! Streams frames from machine-vision cameras to TCP clients. Each camera
//! is served on its own port; every frame goes out as a fixed binary
//! header followed by the raw pixel payload.
//!
//! # Architecture
//!
//! ```text
//! camera thread ──▶ StreamBridge (bounded queue) ──▶ frame server ──▶ client
//!       ▲                                                  │
//!       └──────────────── buffer return path ◀─────────────┘
//! ```
//!
//! - [`capture`]: camera seam, frames, and the per-camera supervisor
//! - [`stream`]: the bridge between capture and network, and the wire format
//! - [`server`]: single-client TCP servers for frames and control commands
//! - [`config`]: camera list (XML) and runtime settings (TOML)
//! - [`context`]: state shared by all threads
//!
//! # Design Principles
//!
//! - **Bounded latency**: a full queue drops its oldest frame by default
//! - **Buffers always return**: every frame handed out is given back to
//!   the camera, sent or not
//! - **Cooperative shutdown**: no thread is killed, all of them poll a stop flag
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use camstream::{
//!     capture::{Camera, FeatureValue, SimulatedCamera},
//!     server::{FrameStreamHandler, Server, ServerConfig},
//!     stream::{HeaderFormat, OverflowPolicy, StreamBridge},
//! };
//!
//! let bridge = Arc::new(StreamBridge::new("sim", 3, OverflowPolicy::DropOldest));
//! let handler = FrameStreamHandler::new(Arc::clone(&bridge), HeaderFormat::Extended, Duration::from_secs(3));
//! let server = Server::start(ServerConfig::new("camserver_sim", ([0, 0, 0, 0], 42001).into()), handler).unwrap();
//! server.wait_until_running(Duration::from_secs(1)).unwrap();
//!
//! let mut camera = SimulatedCamera::new("sim");
//! camera.set_feature("AcquisitionFrameRate", &FeatureValue::Float(30.0)).unwrap();
//! camera.start_acquisition(10, bridge.clone()).unwrap();
//! for frame in bridge.returned().iter() {
//!     let _ = camera.queue_frame(frame);
//! }
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod capture;
pub mod config;
pub mod context;
pub mod metrics;
pub mod server;
pub mod stream;

// Re-export commonly used types at crate root
pub use capture::{Camera, CameraProvider, Frame, PixelFormat, SimulatedCamera, SimulatedProvider};
pub use config::{CameraConfig, Settings};
pub use context::{AppContext, ShutdownFlag, StreamRegistry};
pub use server::{Server, ServerConfig, ServerStatus};
pub use stream::{HeaderFormat, OverflowPolicy, StreamBridge, StreamState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
