//! V4L2 camera backend.
//!
//! Devices are identified by their node path (`/dev/video0`). Frames are
//! captured through an mmap stream and copied into the camera's own
//! buffer pool, so the kernel buffers are recycled immediately while the
//! pool enforces the same lend/return discipline as any other camera.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::pool::BufferPool;
use super::{Camera, CameraError, CameraProvider, FeatureValue, Frame, FrameObserver, PixelFormat};

const FOURCCS: [(&[u8; 4], PixelFormat); 7] = [
    (b"GREY", PixelFormat::MONO8),
    (b"Y10 ", PixelFormat::MONO10),
    (b"Y12 ", PixelFormat::MONO12),
    (b"Y16 ", PixelFormat::MONO16),
    (b"RGGB", PixelFormat::BAYER_RG8),
    (b"RGB3", PixelFormat::RGB8),
    (b"BGR3", PixelFormat::BGR8),
];

/// How long one dequeue may block before the stop flag is checked.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

fn to_pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    FOURCCS
        .iter()
        .find(|(repr, _)| **repr == fourcc.repr)
        .map(|(_, format)| *format)
}

fn to_fourcc(format: PixelFormat) -> Option<FourCC> {
    FOURCCS
        .iter()
        .find(|(_, f)| *f == format)
        .map(|(repr, _)| FourCC::new(repr))
}

fn io_err(context: &str) -> impl Fn(std::io::Error) -> CameraError + '_ {
    move |e| CameraError::CommandFailed(format!("{}: {}", context, e))
}

/// Lists and opens V4L2 capture devices.
#[derive(Debug, Default)]
pub struct V4l2Provider;

impl V4l2Provider {
    pub fn new() -> Self {
        Self
    }
}

impl CameraProvider for V4l2Provider {
    fn list_cameras(&self) -> Result<Vec<String>, CameraError> {
        Ok(v4l::context::enum_devices()
            .into_iter()
            .map(|node| node.path().display().to_string())
            .collect())
    }

    fn open(&self, id: &str) -> Result<Box<dyn Camera>, CameraError> {
        Ok(Box::new(V4l2Camera::open(id)?))
    }
}

struct Acquisition {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// A V4L2 capture device.
pub struct V4l2Camera {
    id: String,
    device: Device,
    power_on: v4l::Format,
    pool: Arc<Mutex<BufferPool>>,
    acquisition: Option<Acquisition>,
}

impl V4l2Camera {
    pub fn open(path: &str) -> Result<Self, CameraError> {
        let device = Device::with_path(path)
            .map_err(|e| CameraError::OpenFailed(format!("{}: {}", path, e)))?;
        let caps = device.query_caps().map_err(io_err("query capabilities"))?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE | CapFlags::STREAMING) {
            return Err(CameraError::OpenFailed(format!(
                "{} ({}) cannot stream video",
                path, caps.card
            )));
        }
        let power_on = device.format().map_err(io_err("read format"))?;
        tracing::info!(camera = path, card = %caps.card, driver = %caps.driver, "V4L2 device opened");
        Ok(Self {
            id: path.to_string(),
            device,
            power_on,
            pool: Arc::new(Mutex::new(BufferPool::default())),
            acquisition: None,
        })
    }

    fn format(&self) -> Result<v4l::Format, CameraError> {
        self.device.format().map_err(io_err("read format"))
    }

    fn frame_rate(&self) -> Result<f64, CameraError> {
        let params = self.device.params().map_err(io_err("read parameters"))?;
        let interval = params.interval;
        if interval.numerator == 0 {
            return Ok(0.0);
        }
        Ok(interval.denominator as f64 / interval.numerator as f64)
    }

    fn update_format(&mut self, name: &str, value: &FeatureValue) -> Result<(), CameraError> {
        let invalid = || CameraError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        let mut format = self.format()?;
        match name {
            "Width" | "Height" => {
                let v = value
                    .as_int()
                    .and_then(|v| u32::try_from(v).ok())
                    .filter(|v| *v > 0)
                    .ok_or_else(invalid)?;
                if name == "Width" {
                    format.width = v;
                } else {
                    format.height = v;
                }
            }
            _ => {
                let pixel_format = match value {
                    FeatureValue::Enum(name) => PixelFormat::from_name(name),
                    FeatureValue::Int(code) => u32::try_from(*code).ok().map(PixelFormat),
                    FeatureValue::Float(_) => None,
                };
                format.fourcc = pixel_format.and_then(to_fourcc).ok_or_else(invalid)?;
            }
        }
        let applied = self.device.set_format(&format).map_err(io_err("set format"))?;
        if applied.width != format.width
            || applied.height != format.height
            || applied.fourcc != format.fourcc
        {
            // The driver adjusted the request to the closest mode it supports.
            tracing::warn!(
                camera = %self.id,
                requested = %format,
                applied = %applied,
                "Format adjusted by driver"
            );
        }
        Ok(())
    }
}

impl Camera for V4l2Camera {
    fn id(&self) -> &str {
        &self.id
    }

    /// V4L2 has no device reset; this stops streaming and restores the
    /// format found when the device was opened.
    fn reset(&mut self) -> Result<(), CameraError> {
        self.stop_acquisition()?;
        self.device
            .set_format(&self.power_on)
            .map_err(io_err("restore format"))?;
        Ok(())
    }

    fn set_feature(&mut self, name: &str, value: &FeatureValue) -> Result<(), CameraError> {
        match name {
            "Width" | "Height" | "PixelFormat" if self.acquisition.is_some() => {
                Err(CameraError::FeatureReadOnly(name.to_string()))
            }
            "Width" | "Height" | "PixelFormat" => self.update_format(name, value),
            "AcquisitionFrameRate" => {
                let fps = value
                    .as_float()
                    .filter(|fps| *fps >= 1.0)
                    .ok_or_else(|| CameraError::InvalidValue {
                        name: name.to_string(),
                        value: value.to_string(),
                    })?;
                self.device
                    .set_params(&Parameters::with_fps(fps.round() as u32))
                    .map_err(io_err("set frame rate"))?;
                Ok(())
            }
            "PayloadSize" => Err(CameraError::FeatureReadOnly(name.to_string())),
            _ => Err(CameraError::FeatureNotFound(name.to_string())),
        }
    }

    fn feature(&self, name: &str) -> Result<FeatureValue, CameraError> {
        match name {
            "Width" => Ok(FeatureValue::Int(self.format()?.width as i64)),
            "Height" => Ok(FeatureValue::Int(self.format()?.height as i64)),
            "PayloadSize" => Ok(FeatureValue::Int(self.format()?.size as i64)),
            "PixelFormat" => {
                let fourcc = self.format()?.fourcc;
                let name = to_pixel_format(fourcc)
                    .and_then(PixelFormat::name)
                    .map(str::to_string)
                    .unwrap_or_else(|| fourcc.to_string());
                Ok(FeatureValue::Enum(name))
            }
            "AcquisitionFrameRate" => Ok(FeatureValue::Float(self.frame_rate()?)),
            _ => Err(CameraError::FeatureNotFound(name.to_string())),
        }
    }

    fn start_acquisition(
        &mut self,
        buffer_count: usize,
        observer: Arc<dyn FrameObserver>,
    ) -> Result<(), CameraError> {
        if self.acquisition.is_some() {
            return Err(CameraError::AcquisitionFailed("already running".into()));
        }
        let format = self.format()?;
        let pixel_format = to_pixel_format(format.fourcc).ok_or_else(|| {
            CameraError::AcquisitionFailed(format!("unsupported pixel format {}", format.fourcc))
        })?;
        let payload = format.size as usize;
        let count = u32::try_from(buffer_count)
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| CameraError::AcquisitionFailed("invalid buffer count".into()))?;

        let mut stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, count)
            .map_err(|e| CameraError::AcquisitionFailed(e.to_string()))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        let session = self.pool.lock().announce(buffer_count, payload);

        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name(format!("v4l2-{}", self.id))
            .spawn({
                let stop = Arc::clone(&stop);
                let pool = Arc::clone(&self.pool);
                let camera_id = self.id.clone();
                move || {
                    let started = Instant::now();
                    let mut delivered = 0u64;
                    let mut underruns = 0u64;
                    while !stop.load(Ordering::Acquire) {
                        let (buf, meta) = match stream.next() {
                            Ok(next) => next,
                            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                            Err(e) => {
                                tracing::error!(camera = %camera_id, error = %e, "Dequeue failed");
                                break;
                            }
                        };
                        let next = pool.lock().take();
                        let Some((tag, mut data)) = next else {
                            underruns += 1;
                            continue;
                        };
                        let used = (meta.bytesused as usize).min(buf.len());
                        data.clear();
                        data.extend_from_slice(&buf[..used]);
                        let timestamp = meta.timestamp.sec as u64 * 1_000_000 + meta.timestamp.usec as u64;
                        let frame = Frame::new(
                            data,
                            format.width,
                            format.height,
                            pixel_format,
                            meta.sequence as u64,
                            timestamp,
                        )
                        .with_tag(tag);
                        delivered += 1;
                        observer.frame_received(frame);
                    }
                    tracing::debug!(
                        camera = %camera_id,
                        delivered,
                        underruns,
                        secs = started.elapsed().as_secs_f64(),
                        "V4L2 acquisition thread finished"
                    );
                }
            })?;

        self.acquisition = Some(Acquisition { stop, thread });
        tracing::info!(camera = %self.id, buffers = buffer_count, payload, session, "V4L2 acquisition started");
        Ok(())
    }

    fn queue_frame(&mut self, frame: Frame) -> Result<(), CameraError> {
        let (tag, data) = frame.into_buffer();
        self.pool.lock().give_back(tag, data)
    }

    fn stop_acquisition(&mut self) -> Result<(), CameraError> {
        let Some(acquisition) = self.acquisition.take() else {
            return Ok(());
        };
        acquisition.stop.store(true, Ordering::Release);
        if acquisition.thread.join().is_err() {
            tracing::error!(camera = %self.id, "Acquisition thread panicked");
        }
        let mut pool = self.pool.lock();
        let queued = pool.queued();
        pool.revoke();
        tracing::info!(camera = %self.id, session = pool.session(), queued, "V4L2 acquisition stopped");
        Ok(())
    }

    fn is_acquiring(&self) -> bool {
        self.acquisition
            .as_ref()
            .is_some_and(|a| !a.thread.is_finished())
    }

    fn close(&mut self) {
        if let Err(e) = self.stop_acquisition() {
            tracing::warn!(camera = %self.id, error = %e, "Failed to stop acquisition on close");
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(to_pixel_format(FourCC::new(b"GREY")), Some(PixelFormat::MONO8));
        assert_eq!(to_pixel_format(FourCC::new(b"MJPG")), None);
        assert_eq!(to_fourcc(PixelFormat::MONO16), Some(FourCC::new(b"Y16 ")));
        assert_eq!(to_fourcc(PixelFormat::MONO12_PACKED), None);
    }
}
