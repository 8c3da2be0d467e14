//! Camera abstraction for frame capture.
//!
//! This module provides a trait-based abstraction over camera hardware,
//! allowing for both real camera backends and a simulated implementation
//! for testing. The streaming layer only sees a source of frames and a
//! sink for "frame consumed, please refill".

use std::sync::Arc;

use super::{FeatureKind, FeatureValue, Frame};
use thiserror::Error;

/// Errors that can occur during camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open camera: {0}")]
    OpenFailed(String),
    #[error("camera feature not found: {0}")]
    FeatureNotFound(String),
    #[error("feature {name} is {expected}, got {found}")]
    FeatureType {
        name: String,
        expected: FeatureKind,
        found: FeatureKind,
    },
    #[error("feature {0} is read-only")]
    FeatureReadOnly(String),
    #[error("invalid value for feature {name}: {value}")]
    InvalidValue { name: String, value: String },
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("failed to start acquisition: {0}")]
    AcquisitionFailed(String),
    #[error("buffer {slot} of session {session} is not owned by the camera")]
    ForeignBuffer { session: u64, slot: usize },
    #[error("acquisition is not running")]
    NotAcquiring,
    #[error("camera not initialized")]
    NotInitialized,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives frames from the capture engine.
///
/// Called on a thread owned by the camera backend. Implementations must
/// not block for long and take ownership of the frame; every frame must
/// eventually be handed back through [`Camera::queue_frame`].
pub trait FrameObserver: Send + Sync {
    fn frame_received(&self, frame: Frame);
}

/// Trait for camera implementations.
pub trait Camera: Send {
    /// Device identifier.
    fn id(&self) -> &str;

    /// Runs the device reset command. The camera disappears from the bus
    /// for a few seconds afterwards and must be reopened.
    fn reset(&mut self) -> Result<(), CameraError>;

    /// Writes a feature value.
    fn set_feature(&mut self, name: &str, value: &FeatureValue) -> Result<(), CameraError>;

    /// Reads a feature value.
    fn feature(&self, name: &str) -> Result<FeatureValue, CameraError>;

    /// Size in bytes of one frame buffer.
    fn payload_size(&self) -> Result<usize, CameraError> {
        let value = self.feature("PayloadSize")?;
        value
            .as_int()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| CameraError::InvalidValue {
                name: "PayloadSize".into(),
                value: value.to_string(),
            })
    }

    /// Announces `buffer_count` buffers, queues them and starts acquisition.
    /// Every captured frame is delivered to `observer`.
    fn start_acquisition(
        &mut self,
        buffer_count: usize,
        observer: Arc<dyn FrameObserver>,
    ) -> Result<(), CameraError>;

    /// Hands a previously delivered frame back so its buffer can be refilled.
    fn queue_frame(&mut self, frame: Frame) -> Result<(), CameraError>;

    /// Stops acquisition and revokes all buffers.
    fn stop_acquisition(&mut self) -> Result<(), CameraError>;

    /// Checks if acquisition is running.
    fn is_acquiring(&self) -> bool;

    /// Closes the camera and releases resources.
    fn close(&mut self);
}

/// Enumerates and opens cameras.
pub trait CameraProvider: Send + Sync {
    /// Lists the identifiers of all cameras currently visible.
    fn list_cameras(&self) -> Result<Vec<String>, CameraError>;

    /// Opens the camera with the given identifier.
    fn open(&self, id: &str) -> Result<Box<dyn Camera>, CameraError>;
}

impl<F> FrameObserver for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn frame_received(&self, frame: Frame) {
        self(frame)
    }
}
