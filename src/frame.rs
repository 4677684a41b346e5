use std::fmt::{Display, Formatter};

use bytes::Bytes;
use shm_channel::{FrameHeader, PixelFormat};

/// Metadata of one raw frame handed to [`crate::EncoderClient::send_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane.
    pub row_pitch: u32,
    pub timestamp_ns: u64,
    pub insert_idr: bool,
    pub pixel_format: PixelFormat,
}

impl FrameDescriptor {
    /// Tightly packed frame: the row pitch is derived from the width.
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        let row_pitch = match pixel_format {
            PixelFormat::Rgba => width * 4,
            PixelFormat::Nv12 => width,
            PixelFormat::P010 => width * 2,
        };
        Self {
            width,
            height,
            row_pitch,
            timestamp_ns: 0,
            insert_idr: false,
            pixel_format,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    pub fn with_idr(mut self, insert_idr: bool) -> Self {
        self.insert_idr = insert_idr;
        self
    }

    pub fn with_row_pitch(mut self, row_pitch: u32) -> Self {
        self.row_pitch = row_pitch;
        self
    }

    pub(crate) fn to_header(self, data_size: u32) -> FrameHeader {
        FrameHeader {
            width: self.width,
            height: self.height,
            timestamp_ns: self.timestamp_ns,
            insert_idr: self.insert_idr,
            pixel_format: self.pixel_format.to_wire(),
            row_pitch: self.row_pitch,
            data_size,
            shutdown: false,
        }
    }
}

/// Encoded packet returned by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub data: Bytes,
    pub timestamp_ns: u64,
    pub is_idr: bool,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Packet data_len: {}, timestamp_ns: {}, is_idr: {}",
            self.data.len(),
            self.timestamp_ns,
            self.is_idr
        )
    }
}
