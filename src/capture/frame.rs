//! Frame type representing a captured image with metadata.

use std::fmt;

/// GenICam pixel format code (PFNC), as reported by the camera.
///
/// Bits 16..24 of the code hold the number of bits per pixel, which is
/// all the streaming layer needs to know about a format.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const MONO8: Self = Self(0x0108_0001);
    pub const MONO10: Self = Self(0x0110_0003);
    pub const MONO12: Self = Self(0x0110_0005);
    pub const MONO12_PACKED: Self = Self(0x010C_0006);
    pub const MONO16: Self = Self(0x0110_0007);
    pub const BAYER_RG8: Self = Self(0x0108_0009);
    pub const RGB8: Self = Self(0x0218_0014);
    pub const BGR8: Self = Self(0x0218_0015);

    const NAMED: [(Self, &'static str); 8] = [
        (Self::MONO8, "Mono8"),
        (Self::MONO10, "Mono10"),
        (Self::MONO12, "Mono12"),
        (Self::MONO12_PACKED, "Mono12Packed"),
        (Self::MONO16, "Mono16"),
        (Self::BAYER_RG8, "BayerRG8"),
        (Self::RGB8, "RGB8"),
        (Self::BGR8, "BGR8"),
    ];

    /// Returns the raw PFNC code.
    #[inline]
    pub fn code(self) -> u32 {
        self.0
    }

    /// Number of bits occupied by one pixel.
    #[inline]
    pub fn bits_per_pixel(self) -> u32 {
        (self.0 >> 16) & 0xFF
    }

    /// Size in bytes of a `width` x `height` image in this format.
    pub fn payload_size(self, width: u32, height: u32) -> usize {
        let bits = width as u64 * height as u64 * self.bits_per_pixel() as u64;
        bits.div_ceil(8) as usize
    }

    /// Symbolic name used by enum-typed camera features.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(format, _)| *format == self)
            .map(|(_, name)| *name)
    }

    /// Looks up a format by its symbolic name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMED
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(format, _)| *format)
    }
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}(0x{:08X})", name, self.0),
            None => write!(f, "PixelFormat(0x{:08X})", self.0),
        }
    }
}

/// Identifies the announced capture buffer a frame lives in.
///
/// `session` is unique within the process for every acquisition of every
/// camera, so buffers that come back late from an earlier acquisition or an
/// earlier open of the same camera can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferTag {
    pub session: u64,
    pub slot: usize,
}

/// A single captured frame.
///
/// The pixel buffer belongs to the capture layer: it is lent to the
/// network side and must be handed back through the return path before
/// the camera may fill it again.
pub struct Frame {
    frame_id: u64,
    timestamp: u64,
    width: u32,
    height: u32,
    offset_x: u32,
    offset_y: u32,
    pixel_format: PixelFormat,
    data: Vec<u8>,
    tag: BufferTag,
}

impl Frame {
    /// Creates a new frame without region-of-interest offsets.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        frame_id: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            frame_id,
            timestamp,
            width,
            height,
            offset_x: 0,
            offset_y: 0,
            pixel_format,
            data,
            tag: BufferTag::default(),
        }
    }

    /// Sets the region-of-interest offsets reported by the sensor.
    pub fn with_offsets(mut self, offset_x: u32, offset_y: u32) -> Self {
        self.offset_x = offset_x;
        self.offset_y = offset_y;
        self
    }

    /// Attaches the capture buffer identity.
    pub fn with_tag(mut self, tag: BufferTag) -> Self {
        self.tag = tag;
        self
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Device timestamp in camera clock ticks.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn offset_x(&self) -> u32 {
        self.offset_x
    }

    #[inline]
    pub fn offset_y(&self) -> u32 {
        self.offset_y
    }

    #[inline]
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    #[inline]
    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    /// Returns a reference to the raw pixel data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length of the raw pixel buffer in bytes.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.data.len()
    }

    /// Gives the pixel buffer back so it can be refilled.
    pub fn into_buffer(self) -> (BufferTag, Vec<u8>) {
        (self.tag, self.data)
    }

    /// Whole bytes per pixel, as sent in the legacy header.
    pub fn bytes_per_pixel(&self) -> u32 {
        let pixels = self.width as u64 * self.height as u64;
        if pixels == 0 {
            return 0;
        }
        (self.data.len() as u64 / pixels) as u32
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("tag", &self.tag)
            .field("buffer_bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(vec![0u8; 640 * 480], 640, 480, PixelFormat::MONO8, 7, 99)
            .with_offsets(16, 8);

        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        assert_eq!(frame.frame_id(), 7);
        assert_eq!(frame.timestamp(), 99);
        assert_eq!(frame.offset_x(), 16);
        assert_eq!(frame.offset_y(), 8);
        assert_eq!(frame.buffer_size(), 640 * 480);
        assert_eq!(frame.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_pixel_format_sizes() {
        assert_eq!(PixelFormat::MONO12.bits_per_pixel(), 16);
        assert_eq!(PixelFormat::MONO12.payload_size(1920, 1080), 4_147_200);
        assert_eq!(PixelFormat::MONO12_PACKED.payload_size(4, 2), 12);
        assert_eq!(PixelFormat::RGB8.payload_size(10, 10), 300);
    }

    #[test]
    fn test_pixel_format_names() {
        assert_eq!(PixelFormat::from_name("mono12"), Some(PixelFormat::MONO12));
        assert_eq!(PixelFormat::MONO8.name(), Some("Mono8"));
        assert_eq!(PixelFormat(0xDEAD).name(), None);
    }

    #[test]
    fn test_zero_sized_frame_bytes_per_pixel() {
        let frame = Frame::new(Vec::new(), 0, 0, PixelFormat::MONO8, 1, 0);
        assert_eq!(frame.bytes_per_pixel(), 0);
    }
}
