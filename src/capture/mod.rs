//! Camera input and frame handling.
//!
//! This module provides the camera seam used by the streaming layer, the
//! frame type that travels from the capture thread to the network and
//! back, and the supervisor that keeps one camera acquiring across
//! disconnects and errors.

mod camera;
mod feature;
mod frame;
mod pool;
pub mod session;
mod simulated;
#[cfg(feature = "v4l2")]
mod v4l2;

pub use camera::{Camera, CameraError, CameraProvider, FrameObserver};
pub use feature::{FeatureKind, FeatureParseError, FeatureValue, REPORTED_FEATURES};
pub use frame::{BufferTag, Frame, PixelFormat};
pub use session::{CameraSession, SessionError, SessionPhase};
pub use simulated::{SimulatedCamera, SimulatedProvider, SimulatedStats, SimulatedStatsHandle};
#[cfg(feature = "v4l2")]
pub use v4l2::{V4l2Camera, V4l2Provider};
