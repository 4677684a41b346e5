//! Byte layout of the shared region.
//!
//! ```text
//! offset 0                     FrameHeader    (30 bytes)
//! offset 30                    PacketHeader   (16 bytes)
//! offset 46                    frame buffer   (frame_capacity bytes)
//! offset 46 + frame_capacity   packet buffer  (packet_capacity bytes)
//! ```
//!
//! Headers are packed: every field sits at the offset listed in `frame_field` /
//! `packet_field`, with no padding other than the trailing bytes each header
//! declares. Integers use native byte order, both peers run on the same host.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const FRAME_HEADER_SIZE: usize = 30;
pub const PACKET_HEADER_SIZE: usize = 16;

/// Largest raw frame of the reference deployment (4096x2160 RGBA).
pub const REFERENCE_FRAME_CAPACITY: usize = 4096 * 2160 * 4;
/// Largest encoded packet of the reference deployment.
pub const REFERENCE_PACKET_CAPACITY: usize = 4 * 1024 * 1024;

pub(crate) mod frame_field {
    pub const WIDTH: usize = 0;
    pub const HEIGHT: usize = 4;
    pub const TIMESTAMP_NS: usize = 8;
    pub const INSERT_IDR: usize = 16;
    pub const PIXEL_FORMAT: usize = 17;
    pub const ROW_PITCH: usize = 18;
    pub const DATA_SIZE: usize = 22;
    pub const SHUTDOWN: usize = 26;
    // 27..30 padding
}

pub(crate) mod packet_field {
    pub const SIZE: usize = 0;
    pub const TIMESTAMP_NS: usize = 4;
    pub const IS_IDR: usize = 12;
    // 13..16 padding
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PixelFormat {
    Rgba = 0,
    Nv12 = 1,
    P010 = 2,
}

impl PixelFormat {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(PixelFormat::Rgba),
            1 => Some(PixelFormat::Nv12),
            2 => Some(PixelFormat::P010),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Smallest payload holding a tightly packed `width` x `height` image.
    pub fn packed_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgba => pixels * 4,
            PixelFormat::Nv12 => pixels * 3 / 2,
            PixelFormat::P010 => pixels * 3,
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Rgba => "rgba",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::P010 => "p010",
        };
        f.write_str(name)
    }
}

/// Metadata of the frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    pub timestamp_ns: u64,
    pub insert_idr: bool,
    /// Raw wire value, see [`FrameHeader::format`].
    pub pixel_format: u8,
    pub row_pitch: u32,
    pub data_size: u32,
    pub shutdown: bool,
}

impl FrameHeader {
    pub fn format(&self) -> Option<PixelFormat> {
        PixelFormat::from_wire(self.pixel_format)
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        use frame_field::*;
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        put_u32(&mut buf, WIDTH, self.width);
        put_u32(&mut buf, HEIGHT, self.height);
        put_u64(&mut buf, TIMESTAMP_NS, self.timestamp_ns);
        buf[INSERT_IDR] = self.insert_idr as u8;
        buf[PIXEL_FORMAT] = self.pixel_format;
        put_u32(&mut buf, ROW_PITCH, self.row_pitch);
        put_u32(&mut buf, DATA_SIZE, self.data_size);
        buf[SHUTDOWN] = self.shutdown as u8;
        buf
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        use frame_field::*;
        Self {
            width: get_u32(buf, WIDTH),
            height: get_u32(buf, HEIGHT),
            timestamp_ns: get_u64(buf, TIMESTAMP_NS),
            insert_idr: buf[INSERT_IDR] != 0,
            pixel_format: buf[PIXEL_FORMAT],
            row_pitch: get_u32(buf, ROW_PITCH),
            data_size: get_u32(buf, DATA_SIZE),
            shutdown: buf[SHUTDOWN] != 0,
        }
    }
}

/// Metadata of the packet slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub size: u32,
    pub timestamp_ns: u64,
    pub is_idr: bool,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        use packet_field::*;
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        put_u32(&mut buf, SIZE, self.size);
        put_u64(&mut buf, TIMESTAMP_NS, self.timestamp_ns);
        buf[IS_IDR] = self.is_idr as u8;
        buf
    }

    pub fn decode(buf: &[u8; PACKET_HEADER_SIZE]) -> Self {
        use packet_field::*;
        Self {
            size: get_u32(buf, SIZE),
            timestamp_ns: get_u64(buf, TIMESTAMP_NS),
            is_idr: buf[IS_IDR] != 0,
        }
    }
}

/// Capacities of the two payload buffers. Both peers of a channel must agree
/// on these, the mapping size is derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionLayout {
    pub frame_capacity: usize,
    pub packet_capacity: usize,
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self::reference()
    }
}

impl RegionLayout {
    pub const fn new(frame_capacity: usize, packet_capacity: usize) -> Self {
        Self {
            frame_capacity,
            packet_capacity,
        }
    }

    pub const fn reference() -> Self {
        Self::new(REFERENCE_FRAME_CAPACITY, REFERENCE_PACKET_CAPACITY)
    }

    pub fn is_reference(&self) -> bool {
        *self == Self::reference()
    }

    pub const fn frame_header_offset(&self) -> usize {
        0
    }

    pub const fn packet_header_offset(&self) -> usize {
        FRAME_HEADER_SIZE
    }

    pub const fn frame_buffer_offset(&self) -> usize {
        FRAME_HEADER_SIZE + PACKET_HEADER_SIZE
    }

    pub const fn packet_buffer_offset(&self) -> usize {
        self.frame_buffer_offset() + self.frame_capacity
    }

    pub const fn total_size(&self) -> usize {
        self.packet_buffer_offset() + self.packet_capacity
    }
}

impl Display for RegionLayout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame {} bytes, packet {} bytes, total {} bytes",
            self.frame_capacity,
            self.packet_capacity,
            self.total_size()
        )
    }
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_ne_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(raw)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_layout_offsets() {
        let layout = RegionLayout::reference();
        assert_eq!(layout.frame_header_offset(), 0);
        assert_eq!(layout.packet_header_offset(), 30);
        assert_eq!(layout.frame_buffer_offset(), 46);
        assert_eq!(layout.packet_buffer_offset(), 46 + 4096 * 2160 * 4);
        assert_eq!(
            layout.total_size(),
            46 + REFERENCE_FRAME_CAPACITY + REFERENCE_PACKET_CAPACITY
        );
        assert!(layout.is_reference());
        assert!(!RegionLayout::new(16, 16).is_reference());
    }

    #[test]
    fn test_frame_header_field_positions() {
        let header = FrameHeader {
            width: 0x0102_0304,
            height: 7,
            timestamp_ns: 1000,
            insert_idr: true,
            pixel_format: PixelFormat::P010.to_wire(),
            row_pitch: 7680,
            data_size: 42,
            shutdown: true,
        };
        let buf = header.encode();
        assert_eq!(&buf[0..4], &0x0102_0304u32.to_ne_bytes());
        assert_eq!(&buf[8..16], &1000u64.to_ne_bytes());
        assert_eq!(buf[16], 1);
        assert_eq!(buf[17], 2);
        assert_eq!(&buf[18..22], &7680u32.to_ne_bytes());
        assert_eq!(&buf[22..26], &42u32.to_ne_bytes());
        assert_eq!(buf[26], 1);
        assert_eq!(&buf[27..30], &[0, 0, 0]);
        assert_eq!(FrameHeader::decode(&buf), header);
    }

    #[test]
    fn test_packet_header_field_positions() {
        let header = PacketHeader {
            size: 4096,
            timestamp_ns: u64::MAX - 1,
            is_idr: true,
        };
        let buf = header.encode();
        assert_eq!(&buf[0..4], &4096u32.to_ne_bytes());
        assert_eq!(&buf[4..12], &(u64::MAX - 1).to_ne_bytes());
        assert_eq!(buf[12], 1);
        assert_eq!(&buf[13..16], &[0, 0, 0]);
        assert_eq!(PacketHeader::decode(&buf), header);
    }

    #[test]
    fn test_pixel_format_wire_values() {
        assert_eq!(PixelFormat::from_wire(0), Some(PixelFormat::Rgba));
        assert_eq!(PixelFormat::from_wire(1), Some(PixelFormat::Nv12));
        assert_eq!(PixelFormat::from_wire(2), Some(PixelFormat::P010));
        assert_eq!(PixelFormat::from_wire(3), None);

        let header = FrameHeader {
            pixel_format: 9,
            ..Default::default()
        };
        assert_eq!(header.format(), None);
    }

    #[test]
    fn test_packed_size() {
        assert_eq!(PixelFormat::Rgba.packed_size(1920, 1080), 1920 * 1080 * 4);
        assert_eq!(PixelFormat::Nv12.packed_size(1920, 1080), 1920 * 1080 * 3 / 2);
        assert_eq!(PixelFormat::P010.packed_size(2, 2), 12);
    }

    #[test]
    fn test_layout_deserialize() {
        let layout: RegionLayout =
            serde_json::from_str(r#"{"frame_capacity": 1024, "packet_capacity": 512}"#).unwrap();
        assert_eq!(layout, RegionLayout::new(1024, 512));
        assert_eq!(layout.total_size(), 46 + 1024 + 512);
    }
}
