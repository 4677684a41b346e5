//! FFmpeg-backed encoder for the worker. Hardware encoders are tried first,
//! the software encoder of the codec is the fallback.

use std::collections::HashMap;

use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::{Dictionary, Rational, picture};
use shm_channel::PixelFormat;

use super::{EncodedPacket, FrameEncoder, InboundFrame};
use crate::codec::Codec;

#[derive(Debug, Clone)]
pub struct Settings {
    pub width: u32,
    pub height: u32,
    pub codec: Codec,
    pub fps: u32,
    /// Bits per second, `None` keeps the encoder default.
    pub bitrate: Option<usize>,
    pub keyframe_interval: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            codec: Codec::H264,
            fps: 60,
            bitrate: None,
            keyframe_interval: 120,
        }
    }
}

fn find_hw_encoder(codec: Codec) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec {
        Codec::H264 => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        Codec::Hevc => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
    };
    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

fn is_hw_encoder(name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|hw| name.contains(hw))
}

fn source_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::P010 => Pixel::P010LE,
    }
}

struct Scaler {
    key: (Pixel, u32, u32),
    context: scaling::Context,
}

// The scaling context is only touched from the serve loop.
unsafe impl Send for Scaler {}

pub struct FfmpegEncoder {
    name: String,
    encoder: ffmpeg_next::codec::encoder::Video,
    scaler: Option<Scaler>,
    frame_index: i64,
    /// Frame timestamps keyed by the pts handed to the encoder.
    pending: HashMap<i64, u64>,
}

// The encoder context is owned exclusively and moved into the serve thread once.
unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        ffmpeg_next::init()?;
        let sw_name = settings.codec.software_encoder();

        if let Some(hw_codec) = find_hw_encoder(settings.codec) {
            let hw_name = hw_codec.name().to_string();
            log::info!("attempting hardware encoder: {}", hw_name);
            match open_encoder(hw_codec, &hw_name, settings) {
                Ok(encoder) => return Ok(Self::with_encoder(hw_name, encoder)),
                Err(e) => log::warn!(
                    "hardware encoder {} failed: {}, falling back to {}",
                    hw_name,
                    e,
                    sw_name
                ),
            }
        } else {
            log::info!("no hardware encoder found, using software encoder: {}", sw_name);
        }

        let sw_codec = ffmpeg_next::encoder::find_by_name(sw_name)
            .ok_or_else(|| anyhow::anyhow!("codec not found: {}", sw_name))?;
        let encoder = open_encoder(sw_codec, sw_name, settings)?;
        Ok(Self::with_encoder(sw_name.to_string(), encoder))
    }

    fn with_encoder(name: String, encoder: ffmpeg_next::codec::encoder::Video) -> Self {
        log::info!("encoder opened successfully: {}", name);
        Self {
            name,
            encoder,
            scaler: None,
            frame_index: 0,
            pending: HashMap::new(),
        }
    }

    fn convert(&mut self, frame: &InboundFrame<'_>) -> anyhow::Result<ffmpeg_next::frame::Video> {
        let src_format = source_pixel(frame.format);
        let (width, height) = (frame.header.width, frame.header.height);
        let mut src = ffmpeg_next::frame::Video::new(src_format, width, height);
        copy_planes(frame, &mut src)?;

        let (dst_format, dst_width, dst_height) =
            (self.encoder.format(), self.encoder.width(), self.encoder.height());
        if src_format == dst_format && width == dst_width && height == dst_height {
            return Ok(src);
        }

        let key = (src_format, width, height);
        if self.scaler.as_ref().map(|s| s.key) != Some(key) {
            self.scaler = Some(Scaler {
                key,
                context: scaling::Context::get(
                    src_format,
                    width,
                    height,
                    dst_format,
                    dst_width,
                    dst_height,
                    scaling::flag::Flags::BILINEAR,
                )?,
            });
        }
        let mut converted = ffmpeg_next::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.context.run(&src, &mut converted)?;
        }
        Ok(converted)
    }

    fn drain(&mut self, out: &mut Vec<EncodedPacket>) -> anyhow::Result<()> {
        loop {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    let timestamp_ns = packet
                        .pts()
                        .and_then(|pts| self.pending.remove(&pts))
                        .unwrap_or_default();
                    out.push(EncodedPacket {
                        data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                        timestamp_ns,
                        is_idr: packet.is_key(),
                    });
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(());
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn open_encoder(
    codec: ffmpeg_next::Codec,
    name: &str,
    settings: &Settings,
) -> anyhow::Result<ffmpeg_next::codec::encoder::Video> {
    let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
    let mut encoder = ctx.encoder().video()?;
    encoder.set_width(settings.width);
    encoder.set_height(settings.height);
    encoder.set_format(if is_hw_encoder(name) {
        Pixel::NV12
    } else {
        Pixel::YUV420P
    });
    let fps = settings.fps.max(1) as i32;
    encoder.set_frame_rate(Some(Rational(fps, 1)));
    encoder.set_time_base(Rational(1, fps));
    encoder.set_gop(settings.keyframe_interval);
    encoder.set_max_b_frames(0);
    if let Some(bitrate) = settings.bitrate {
        encoder.set_bit_rate(bitrate);
    }

    let mut opts = Dictionary::new();
    if !is_hw_encoder(name) {
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
    }
    Ok(encoder.open_with(opts)?)
}

/// Copies the tightly or loosely pitched payload into `dst`, plane by plane.
fn copy_planes(frame: &InboundFrame<'_>, dst: &mut ffmpeg_next::frame::Video) -> anyhow::Result<()> {
    let width = frame.header.width as usize;
    let height = frame.header.height as usize;
    let pitch = frame.header.row_pitch as usize;
    let chroma_rows = height.div_ceil(2);

    // (rows, bytes per row) of each plane; every plane shares the source pitch.
    let planes: &[(usize, usize)] = match frame.format {
        PixelFormat::Rgba => &[(height, width * 4)],
        PixelFormat::Nv12 => &[(height, width), (chroma_rows, width.next_multiple_of(2))],
        PixelFormat::P010 => &[(height, width * 2), (chroma_rows, width.next_multiple_of(2) * 2)],
    };

    let mut offset = 0;
    for (plane, &(rows, row_bytes)) in planes.iter().enumerate() {
        if pitch < row_bytes {
            anyhow::bail!("row pitch {} below row size {}", pitch, row_bytes);
        }
        let needed = pitch * (rows - 1) + row_bytes;
        if offset + needed > frame.data.len() {
            anyhow::bail!(
                "payload of {} bytes too short for {}x{} {}",
                frame.data.len(),
                width,
                height,
                frame.format
            );
        }
        let stride = dst.stride(plane);
        let out = dst.data_mut(plane);
        for row in 0..rows {
            let src = &frame.data[offset + row * pitch..offset + row * pitch + row_bytes];
            out[row * stride..row * stride + row_bytes].copy_from_slice(src);
        }
        offset += pitch * rows;
    }
    Ok(())
}

impl FrameEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&mut self, frame: &InboundFrame<'_>) -> anyhow::Result<Vec<EncodedPacket>> {
        if frame.header.width == 0 || frame.header.height == 0 {
            anyhow::bail!("empty frame geometry");
        }
        let mut video = self.convert(frame)?;
        let pts = self.frame_index;
        self.frame_index += 1;
        video.set_pts(Some(pts));
        if frame.header.insert_idr {
            video.set_kind(picture::Type::I);
        }
        self.pending.insert(pts, frame.header.timestamp_ns);
        self.encoder.send_frame(&video)?;

        let mut packets = Vec::new();
        self.drain(&mut packets)?;
        // zerolatency encoders emit in order; anything older was dropped inside the encoder
        self.pending.retain(|&p, _| p > pts - 64);
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use shm_channel::FrameHeader;

    use super::*;

    #[test]
    fn test_libx264_encodes_idr() {
        let settings = Settings {
            width: 64,
            height: 64,
            ..Default::default()
        };
        let Ok(mut encoder) = FfmpegEncoder::new(&settings) else {
            return;
        };
        let data = vec![128u8; 64 * 64 * 4];
        let frame = InboundFrame {
            header: FrameHeader {
                width: 64,
                height: 64,
                timestamp_ns: 1000,
                insert_idr: true,
                pixel_format: PixelFormat::Rgba.to_wire(),
                row_pitch: 256,
                data_size: data.len() as u32,
                shutdown: false,
            },
            format: PixelFormat::Rgba,
            data: &data,
        };
        let packets = encoder.encode(&frame).unwrap();
        let packet = crate::worker::merge_packets(packets).unwrap();
        assert!(packet.is_idr);
        assert_eq!(packet.timestamp_ns, 1000);
        assert!(!packet.data.is_empty());
    }
}
