//! Simulated camera that generates synthetic frames.
//!
//! Behaves like a vendor camera from the point of view of the streaming
//! layer: it announces a fixed set of buffers, fills only buffers that
//! have been queued back to it, and delivers frames to an observer on its
//! own acquisition thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::pool::BufferPool;
use super::{
    Camera, CameraError, CameraProvider, FeatureKind, FeatureValue, Frame, FrameObserver,
    PixelFormat,
};

/// Counters of a simulated device, readable while it is streaming.
#[derive(Debug, Default)]
pub struct SimulatedStats {
    /// Frames delivered to the observer.
    pub frames_emitted: AtomicU64,
    /// Frame periods skipped because no buffer was queued.
    pub underruns: AtomicU64,
    /// Buffers handed back through `queue_frame`.
    pub requeued: AtomicU64,
    /// Buffers handed back that the camera did not own.
    pub foreign: AtomicU64,
    /// Device resets issued.
    pub resets: AtomicU64,
    /// Successful opens.
    pub opens: AtomicU64,
    /// Acquisitions that ended on an injected device error.
    pub acquisition_failures: AtomicU64,
}

#[derive(Debug)]
struct DeviceControl {
    present: bool,
    open_failures_left: u32,
    /// Ends the running acquisition as if the device had dropped off the bus.
    fail_acquisition: bool,
}

#[derive(Debug)]
struct SimulatedDevice {
    control: Mutex<DeviceControl>,
    stats: SimulatedStats,
}

/// Provides [`SimulatedCamera`]s for a fixed set of identifiers.
pub struct SimulatedProvider {
    devices: Mutex<BTreeMap<String, Arc<SimulatedDevice>>>,
    defaults: Vec<(String, FeatureValue)>,
}

impl SimulatedProvider {
    /// Creates a provider exposing one camera per identifier.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self {
            devices: Mutex::new(BTreeMap::new()),
            defaults: Vec::new(),
        };
        for id in ids {
            provider.set_present(&id.into(), true);
        }
        provider
    }

    /// Overrides a power-on feature value for every camera.
    pub fn with_default(mut self, name: &str, value: FeatureValue) -> Self {
        self.defaults.push((name.to_string(), value));
        self
    }

    /// Makes the next `count` open attempts of `id` fail.
    pub fn fail_next_opens(&self, id: &str, count: u32) {
        self.device(id).control.lock().open_failures_left = count;
    }

    /// Makes the running (or next) acquisition of `id` stop with a device
    /// error after its current frame period.
    pub fn fail_acquisition(&self, id: &str) {
        self.device(id).control.lock().fail_acquisition = true;
    }

    /// Plugs or unplugs a device.
    pub fn set_present(&self, id: &str, present: bool) {
        self.device(id).control.lock().present = present;
    }

    /// Counters of `id`, shared across every time it is opened.
    pub fn stats(&self, id: &str) -> SimulatedStatsHandle {
        SimulatedStatsHandle(self.device(id))
    }

    fn device(&self, id: &str) -> Arc<SimulatedDevice> {
        let mut devices = self.devices.lock();
        Arc::clone(devices.entry(id.to_string()).or_insert_with(|| {
            Arc::new(SimulatedDevice {
                control: Mutex::new(DeviceControl {
                    present: false,
                    open_failures_left: 0,
                    fail_acquisition: false,
                }),
                stats: SimulatedStats::default(),
            })
        }))
    }
}

/// Read access to the counters of one simulated device.
#[derive(Debug)]
pub struct SimulatedStatsHandle(Arc<SimulatedDevice>);

impl std::ops::Deref for SimulatedStatsHandle {
    type Target = SimulatedStats;

    fn deref(&self) -> &SimulatedStats {
        &self.0.stats
    }
}

impl CameraProvider for SimulatedProvider {
    fn list_cameras(&self) -> Result<Vec<String>, CameraError> {
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|(_, d)| d.control.lock().present)
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn open(&self, id: &str) -> Result<Box<dyn Camera>, CameraError> {
        let device = self
            .devices
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CameraError::DeviceNotFound(id.to_string()))?;
        {
            let mut control = device.control.lock();
            if !control.present {
                return Err(CameraError::DeviceNotFound(id.to_string()));
            }
            if control.open_failures_left > 0 {
                control.open_failures_left -= 1;
                return Err(CameraError::OpenFailed(format!("{}: device busy", id)));
            }
        }
        device.stats.opens.fetch_add(1, Ordering::Relaxed);

        let mut camera = SimulatedCamera::with_device(id, device);
        for (name, value) in &self.defaults {
            camera.set_feature(name, value)?;
        }
        tracing::debug!(camera = id, "Simulated camera opened");
        Ok(Box::new(camera))
    }
}

struct SimFeature {
    value: FeatureValue,
    read_only: bool,
}

struct Acquisition {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Mock camera producing frames with a deterministic pattern.
///
/// The first eight bytes of every payload hold the frame id (little
/// endian) when the payload is large enough; the rest is filled with the
/// low byte of the frame id.
pub struct SimulatedCamera {
    id: String,
    device: Arc<SimulatedDevice>,
    features: BTreeMap<String, SimFeature>,
    pool: Arc<Mutex<BufferPool>>,
    acquisition: Option<Acquisition>,
    open: bool,
}

impl SimulatedCamera {
    /// Creates a standalone simulated camera.
    pub fn new(id: &str) -> Self {
        let device = Arc::new(SimulatedDevice {
            control: Mutex::new(DeviceControl {
                present: true,
                open_failures_left: 0,
                fail_acquisition: false,
            }),
            stats: SimulatedStats::default(),
        });
        Self::with_device(id, device)
    }

    fn with_device(id: &str, device: Arc<SimulatedDevice>) -> Self {
        Self {
            id: id.to_string(),
            device,
            features: Self::power_on_features(),
            pool: Arc::new(Mutex::new(BufferPool::default())),
            acquisition: None,
            open: true,
        }
    }

    /// Counters of this camera.
    pub fn stats(&self) -> &SimulatedStats {
        &self.device.stats
    }

    fn power_on_features() -> BTreeMap<String, SimFeature> {
        let rw = |value| SimFeature {
            value,
            read_only: false,
        };
        let ro = |value| SimFeature {
            value,
            read_only: true,
        };
        let mut features = BTreeMap::new();
        features.insert("Width".into(), rw(FeatureValue::Int(640)));
        features.insert("Height".into(), rw(FeatureValue::Int(480)));
        features.insert("OffsetX".into(), rw(FeatureValue::Int(0)));
        features.insert("OffsetY".into(), rw(FeatureValue::Int(0)));
        features.insert("BinningHorizontal".into(), rw(FeatureValue::Int(1)));
        features.insert("BinningVertical".into(), rw(FeatureValue::Int(1)));
        features.insert("PixelFormat".into(), rw(FeatureValue::Enum("Mono8".into())));
        features.insert("ExposureTime".into(), rw(FeatureValue::Float(10_000.0)));
        features.insert("Gain".into(), rw(FeatureValue::Float(0.0)));
        features.insert("AcquisitionFrameRate".into(), rw(FeatureValue::Float(10.0)));
        features.insert("DeviceLinkSpeed".into(), ro(FeatureValue::Int(450_000_000)));
        features.insert(
            "DeviceLinkThroughputLimit".into(),
            rw(FeatureValue::Int(450_000_000)),
        );
        features.insert("LineSelector".into(), rw(FeatureValue::Enum("Line0".into())));
        features.insert("LineMode".into(), rw(FeatureValue::Enum("Input".into())));
        features.insert("TriggerSource".into(), rw(FeatureValue::Enum("Software".into())));
        features.insert("TriggerMode".into(), rw(FeatureValue::Enum("Off".into())));
        features
    }

    fn int_feature(&self, name: &str) -> Result<i64, CameraError> {
        let value = self.feature(name)?;
        value.as_int().ok_or(CameraError::FeatureType {
            name: name.to_string(),
            expected: FeatureKind::Int,
            found: value.kind(),
        })
    }

    fn pixel_format(&self) -> Result<PixelFormat, CameraError> {
        let value = self.feature("PixelFormat")?;
        let name = value.as_enum().unwrap_or_default();
        PixelFormat::from_name(name).ok_or_else(|| CameraError::InvalidValue {
            name: "PixelFormat".into(),
            value: value.to_string(),
        })
    }

    fn geometry(&self) -> Result<FrameGeometry, CameraError> {
        let dim = |name: &str| -> Result<u32, CameraError> {
            let v = self.int_feature(name)?;
            u32::try_from(v).map_err(|_| CameraError::InvalidValue {
                name: name.to_string(),
                value: v.to_string(),
            })
        };
        Ok(FrameGeometry {
            width: dim("Width")?,
            height: dim("Height")?,
            offset_x: dim("OffsetX")?,
            offset_y: dim("OffsetY")?,
            pixel_format: self.pixel_format()?,
        })
    }

    fn frame_period(&self) -> Duration {
        let fps = self
            .feature("AcquisitionFrameRate")
            .ok()
            .and_then(|v| v.as_float())
            .filter(|fps| *fps > 0.0)
            .unwrap_or(10.0);
        Duration::from_secs_f64(1.0 / fps)
    }

    fn check_value(name: &str, value: &FeatureValue) -> Result<(), CameraError> {
        let invalid = || CameraError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        match (name, value) {
            ("Width" | "Height", FeatureValue::Int(v)) if *v <= 0 || *v > 65_535 => Err(invalid()),
            ("OffsetX" | "OffsetY", FeatureValue::Int(v)) if *v < 0 => Err(invalid()),
            ("PixelFormat", FeatureValue::Enum(v)) if PixelFormat::from_name(v).is_none() => {
                Err(invalid())
            }
            ("AcquisitionFrameRate", FeatureValue::Float(v)) if *v <= 0.0 => Err(invalid()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameGeometry {
    width: u32,
    height: u32,
    offset_x: u32,
    offset_y: u32,
    pixel_format: PixelFormat,
}

impl Camera for SimulatedCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&mut self) -> Result<(), CameraError> {
        if !self.open {
            return Err(CameraError::NotInitialized);
        }
        self.stop_acquisition()?;
        self.features = Self::power_on_features();
        self.device.stats.resets.fetch_add(1, Ordering::Relaxed);
        tracing::info!(camera = %self.id, "Simulated device reset");
        Ok(())
    }

    fn set_feature(&mut self, name: &str, value: &FeatureValue) -> Result<(), CameraError> {
        if !self.open {
            return Err(CameraError::NotInitialized);
        }
        if name == "PayloadSize" {
            return Err(CameraError::FeatureReadOnly(name.to_string()));
        }
        if self.acquisition.is_some() && matches!(name, "Width" | "Height" | "PixelFormat") {
            return Err(CameraError::FeatureReadOnly(name.to_string()));
        }
        let feature = self
            .features
            .get_mut(name)
            .ok_or_else(|| CameraError::FeatureNotFound(name.to_string()))?;
        if feature.read_only {
            return Err(CameraError::FeatureReadOnly(name.to_string()));
        }
        // Integers are accepted for float features, as the SDK does.
        // PixelFormat may also be written as its numeric PFNC code.
        let value = match (&feature.value, value) {
            (FeatureValue::Float(_), FeatureValue::Int(v)) => FeatureValue::Float(*v as f64),
            (FeatureValue::Enum(_), FeatureValue::Int(code)) if name == "PixelFormat" => {
                let format = u32::try_from(*code).ok().map(PixelFormat).and_then(PixelFormat::name);
                match format {
                    Some(format) => FeatureValue::Enum(format.to_string()),
                    None => {
                        return Err(CameraError::InvalidValue {
                            name: name.to_string(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            _ => value.clone(),
        };
        if feature.value.kind() != value.kind() {
            return Err(CameraError::FeatureType {
                name: name.to_string(),
                expected: feature.value.kind(),
                found: value.kind(),
            });
        }
        Self::check_value(name, &value)?;
        feature.value = value;
        Ok(())
    }

    fn feature(&self, name: &str) -> Result<FeatureValue, CameraError> {
        if !self.open {
            return Err(CameraError::NotInitialized);
        }
        if name == "PayloadSize" {
            let g = self.geometry()?;
            return Ok(FeatureValue::Int(
                g.pixel_format.payload_size(g.width, g.height) as i64,
            ));
        }
        self.features
            .get(name)
            .map(|f| f.value.clone())
            .ok_or_else(|| CameraError::FeatureNotFound(name.to_string()))
    }

    fn start_acquisition(
        &mut self,
        buffer_count: usize,
        observer: Arc<dyn FrameObserver>,
    ) -> Result<(), CameraError> {
        if !self.open {
            return Err(CameraError::NotInitialized);
        }
        if self.acquisition.is_some() {
            return Err(CameraError::AcquisitionFailed("already running".into()));
        }
        if buffer_count == 0 {
            return Err(CameraError::AcquisitionFailed("no buffers announced".into()));
        }
        let geometry = self.geometry()?;
        let payload = self.payload_size()?;
        let period = self.frame_period();

        let session = self.pool.lock().announce(buffer_count, payload);

        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let pool = Arc::clone(&self.pool);
        let device = Arc::clone(&self.device);
        let camera_id = self.id.clone();
        let thread = std::thread::Builder::new()
            .name(format!("sim-{}", self.id))
            .spawn(move || {
                let started = Instant::now();
                let mut frame_id = 0u64;
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    if std::mem::take(&mut device.control.lock().fail_acquisition) {
                        device.stats.acquisition_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(camera = %camera_id, frames = frame_id, "Simulated device error");
                        break;
                    }
                    let next = pool.lock().take();
                    let Some((tag, mut data)) = next else {
                        device.stats.underruns.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    frame_id += 1;
                    data.fill(frame_id as u8);
                    if data.len() >= 8 {
                        data[..8].copy_from_slice(&frame_id.to_le_bytes());
                    }
                    let frame = Frame::new(
                        data,
                        geometry.width,
                        geometry.height,
                        geometry.pixel_format,
                        frame_id,
                        started.elapsed().as_nanos() as u64,
                    )
                    .with_offsets(geometry.offset_x, geometry.offset_y)
                    .with_tag(tag);
                    device.stats.frames_emitted.fetch_add(1, Ordering::Relaxed);
                    observer.frame_received(frame);
                }
                tracing::debug!(camera = %camera_id, frames = frame_id, "Acquisition thread finished");
            })?;

        self.acquisition = Some(Acquisition { stop, thread });
        tracing::info!(
            camera = %self.id,
            buffers = buffer_count,
            payload,
            session,
            "Simulated acquisition started"
        );
        Ok(())
    }

    fn queue_frame(&mut self, frame: Frame) -> Result<(), CameraError> {
        if self.acquisition.is_none() {
            self.device.stats.foreign.fetch_add(1, Ordering::Relaxed);
            let tag = frame.tag();
            return Err(CameraError::ForeignBuffer {
                session: tag.session,
                slot: tag.slot,
            });
        }
        let (tag, data) = frame.into_buffer();
        match self.pool.lock().give_back(tag, data) {
            Ok(()) => {
                self.device.stats.requeued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.device.stats.foreign.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn stop_acquisition(&mut self) -> Result<(), CameraError> {
        let Some(acquisition) = self.acquisition.take() else {
            return Ok(());
        };
        drop(acquisition.stop);
        if acquisition.thread.join().is_err() {
            tracing::error!(camera = %self.id, "Acquisition thread panicked");
        }
        let mut pool = self.pool.lock();
        let queued = pool.queued();
        pool.revoke();
        tracing::info!(
            camera = %self.id,
            session = pool.session(),
            queued,
            "Simulated acquisition stopped"
        );
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
        self.open = false;
        tracing::debug!(camera = %self.id, "Simulated camera closed");
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        if self.acquisition.is_some() {
            self.close();
        }
    }
}
