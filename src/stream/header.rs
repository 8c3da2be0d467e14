//! Binary frame header sent ahead of every payload.
//!
//! All fields are little endian. The extended header is 40 bytes:
//!
//! ```text
//! offset  size  field
//!      0     4  buffer_size
//!      4     4  width
//!      8     4  height
//!     12     4  offset_x
//!     16     4  offset_y
//!     20     4  pixel_format
//!     24     8  timestamp
//!     32     8  frame_id
//! ```
//!
//! The legacy header is 12 bytes: width, height, bytes per pixel.
//! Exactly `buffer_size` payload bytes follow the header, with no padding
//! and no checksum.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::Frame;

pub const EXTENDED_HEADER_LEN: usize = 40;
pub const LEGACY_HEADER_LEN: usize = 12;

/// Errors from encoding or decoding frame headers.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("frame buffer of {0} bytes does not fit the 32-bit size field")]
    BufferTooLarge(usize),
    #[error("{width}x{height} frame of {buffer_size} bytes has no whole bytes per pixel, legacy header cannot describe it")]
    NotWholePixels {
        width: u32,
        height: u32,
        buffer_size: usize,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Which header layout a server writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderFormat {
    #[default]
    Extended,
    Legacy,
}

impl HeaderFormat {
    /// Number of header bytes preceding each payload.
    pub fn encoded_len(self) -> usize {
        match self {
            Self::Extended => EXTENDED_HEADER_LEN,
            Self::Legacy => LEGACY_HEADER_LEN,
        }
    }
}

/// Decoded 40-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub buffer_size: u32,
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub pixel_format: u32,
    pub timestamp: u64,
    pub frame_id: u64,
}

impl FrameHeader {
    pub fn from_frame(frame: &Frame) -> Result<Self, HeaderError> {
        let buffer_size = u32::try_from(frame.buffer_size())
            .map_err(|_| HeaderError::BufferTooLarge(frame.buffer_size()))?;
        Ok(Self {
            buffer_size,
            width: frame.width(),
            height: frame.height(),
            offset_x: frame.offset_x(),
            offset_y: frame.offset_y(),
            pixel_format: frame.pixel_format().code(),
            timestamp: frame.timestamp(),
            frame_id: frame.frame_id(),
        })
    }

    pub fn encode(&self) -> [u8; EXTENDED_HEADER_LEN] {
        let mut buf = [0u8; EXTENDED_HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.buffer_size);
        LittleEndian::write_u32(&mut buf[4..8], self.width);
        LittleEndian::write_u32(&mut buf[8..12], self.height);
        LittleEndian::write_u32(&mut buf[12..16], self.offset_x);
        LittleEndian::write_u32(&mut buf[16..20], self.offset_y);
        LittleEndian::write_u32(&mut buf[20..24], self.pixel_format);
        LittleEndian::write_u64(&mut buf[24..32], self.timestamp);
        LittleEndian::write_u64(&mut buf[32..40], self.frame_id);
        buf
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.encode())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            buffer_size: r.read_u32::<LittleEndian>()?,
            width: r.read_u32::<LittleEndian>()?,
            height: r.read_u32::<LittleEndian>()?,
            offset_x: r.read_u32::<LittleEndian>()?,
            offset_y: r.read_u32::<LittleEndian>()?,
            pixel_format: r.read_u32::<LittleEndian>()?,
            timestamp: r.read_u64::<LittleEndian>()?,
            frame_id: r.read_u64::<LittleEndian>()?,
        })
    }
}

/// Decoded 12-byte header of the first server versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyHeader {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl LegacyHeader {
    /// Fails for packed formats, where the payload is not
    /// `width * height * bytes_per_pixel` and a client would lose framing.
    pub fn from_frame(frame: &Frame) -> Result<Self, HeaderError> {
        let header = Self {
            width: frame.width(),
            height: frame.height(),
            bytes_per_pixel: frame.bytes_per_pixel(),
        };
        if header.payload_len() != frame.buffer_size() {
            return Err(HeaderError::NotWholePixels {
                width: frame.width(),
                height: frame.height(),
                buffer_size: frame.buffer_size(),
            });
        }
        Ok(header)
    }

    /// Payload length implied by the header.
    pub fn payload_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel as usize
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.width)?;
        w.write_u32::<LittleEndian>(self.height)?;
        w.write_u32::<LittleEndian>(self.bytes_per_pixel)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            width: r.read_u32::<LittleEndian>()?,
            height: r.read_u32::<LittleEndian>()?,
            bytes_per_pixel: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Writes header and payload of `frame` to `w`.
///
/// Header and payload are written into a single buffered write when the
/// frame is small, and as two `write_all` calls otherwise.
pub fn write_frame<W: Write>(
    w: &mut W,
    frame: &Frame,
    format: HeaderFormat,
) -> Result<(), HeaderError> {
    let mut header = Vec::with_capacity(EXTENDED_HEADER_LEN);
    match format {
        HeaderFormat::Extended => FrameHeader::from_frame(frame)?.write_to(&mut header)?,
        HeaderFormat::Legacy => LegacyHeader::from_frame(frame)?.write_to(&mut header)?,
    }
    if frame.buffer_size() <= 4096 {
        header.extend_from_slice(frame.data());
        w.write_all(&header)?;
    } else {
        w.write_all(&header)?;
        w.write_all(frame.data())?;
    }
    Ok(())
}

/// Reads one extended-header record. Used by clients and tests.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<(FrameHeader, Vec<u8>)> {
    let header = FrameHeader::read_from(r)?;
    let mut payload = vec![0u8; header.buffer_size as usize];
    r.read_exact(&mut payload)?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn test_mono12_full_hd_header() {
        let frame = Frame::new(
            vec![0xA5; 4_147_200],
            1920,
            1080,
            PixelFormat::MONO12,
            42,
            1_000_000,
        );
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame, HeaderFormat::Extended).unwrap();
        assert_eq!(wire.len(), EXTENDED_HEADER_LEN + 4_147_200);

        let bytes = &wire[..EXTENDED_HEADER_LEN];
        assert_eq!(&bytes[0..4], &4_147_200u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &0x0110_0005u32.to_le_bytes());
        assert_eq!(&bytes[24..32], &1_000_000u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &42u64.to_le_bytes());

        let (header, payload) = read_frame(&mut &wire[..]).unwrap();
        assert_eq!(
            header,
            FrameHeader {
                buffer_size: 4_147_200,
                width: 1920,
                height: 1080,
                offset_x: 0,
                offset_y: 0,
                pixel_format: 0x0110_0005,
                timestamp: 1_000_000,
                frame_id: 42,
            }
        );
        assert_eq!(payload.len(), 4_147_200);
        assert!(payload.iter().all(|b| *b == 0xA5));
    }

    #[test]
    fn test_encode_matches_write_to() {
        let header = FrameHeader {
            buffer_size: 16,
            width: 4,
            height: 2,
            offset_x: 8,
            offset_y: 12,
            pixel_format: PixelFormat::MONO16.code(),
            timestamp: u64::MAX,
            frame_id: 1,
        };
        let encoded = header.encode();
        let mut written = Vec::new();
        header.write_to(&mut written).unwrap();
        assert_eq!(&encoded[..], &written[..]);
        assert_eq!(&encoded[12..16], &12u32.to_le_bytes());
    }

    #[test]
    fn test_legacy_header() {
        let frame = Frame::new(vec![1; 4 * 3 * 2], 4, 3, PixelFormat::MONO16, 9, 0);
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame, HeaderFormat::Legacy).unwrap();
        assert_eq!(wire.len(), LEGACY_HEADER_LEN + 24);

        let header = LegacyHeader::read_from(&mut &wire[..]).unwrap();
        assert_eq!(
            header,
            LegacyHeader {
                width: 4,
                height: 3,
                bytes_per_pixel: 2
            }
        );
        assert_eq!(header.payload_len(), 24);
    }

    #[test]
    fn test_legacy_header_refuses_packed_pixels() {
        let format = PixelFormat::MONO12_PACKED;
        let frame = Frame::new(vec![0; format.payload_size(4, 2)], 4, 2, format, 1, 0);
        assert_eq!(frame.buffer_size(), 12);

        let mut wire = Vec::new();
        assert!(matches!(
            write_frame(&mut wire, &frame, HeaderFormat::Legacy),
            Err(HeaderError::NotWholePixels { buffer_size: 12, .. })
        ));
        assert!(wire.is_empty());
        // The extended header carries the real size and is fine.
        write_frame(&mut wire, &frame, HeaderFormat::Extended).unwrap();
        assert_eq!(wire.len(), EXTENDED_HEADER_LEN + 12);
    }

    #[test]
    fn test_truncated_header_is_an_error() {
        let short = [0u8; 20];
        assert!(FrameHeader::read_from(&mut &short[..]).is_err());
    }

    #[test]
    fn test_header_format_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            header: HeaderFormat,
        }
        let w: Wrapper = toml::from_str("header = \"legacy\"").unwrap();
        assert_eq!(w.header, HeaderFormat::Legacy);
    }
}
