//! Worker half of the channel: owns the region and the signals, consumes
//! frames and produces packets.

use std::time::Duration;

use shm_channel::{
    ChannelNames, FrameHeader, NamedSignal, OwnerLock, PacketHeader, PixelFormat, RegionLayout,
    SharedRegion,
};
use tokio_util::sync::CancellationToken;

use crate::error::IpcError;

pub mod encoder;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use encoder::{EncodedPacket, FrameEncoder, PassthroughEncoder, merge_packets};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegEncoder;

/// Log every Nth frame at debug level.
const FRAME_LOG_INTERVAL: u64 = 300;

pub struct WorkerChannel {
    names: ChannelNames,
    frame_ready: NamedSignal,
    packet_ready: NamedSignal,
    worker_ready: NamedSignal,
    region: SharedRegion,
    frame_buf: Vec<u8>,
}

/// A frame read out of the frame slot.
#[derive(Debug)]
pub struct InboundFrame<'a> {
    pub header: FrameHeader,
    pub format: PixelFormat,
    pub data: &'a [u8],
}

#[derive(Debug)]
pub enum WorkerEvent<'a> {
    Frame(InboundFrame<'a>),
    /// The frame carried an unknown pixel format and was skipped.
    Unsupported(FrameHeader),
    Shutdown,
}

impl WorkerChannel {
    /// Takes ownership of the channel name, creates the signals, then the
    /// region. A client polling for the region therefore always finds every
    /// signal once the region is visible. Objects left behind by a worker
    /// that died are replaced; a running worker on the same channel is left
    /// untouched and reported as `SharedRegionUnavailable`.
    pub fn create(names: ChannelNames, layout: RegionLayout) -> Result<Self, IpcError> {
        let lock = OwnerLock::acquire(&names.region).map_err(IpcError::region)?;
        let frame_ready = NamedSignal::create(&names.frame_ready)
            .map_err(|e| IpcError::signal(&names.frame_ready, e))?;
        let packet_ready = NamedSignal::create(&names.packet_ready)
            .map_err(|e| IpcError::signal(&names.packet_ready, e))?;
        let worker_ready = NamedSignal::create(&names.worker_ready)
            .map_err(|e| IpcError::signal(&names.worker_ready, e))?;
        let region =
            SharedRegion::create_locked(&names.region, layout, lock).map_err(IpcError::region)?;
        log::info!("worker channel {} created ({})", names.prefix(), layout);
        Ok(Self {
            names,
            frame_ready,
            packet_ready,
            worker_ready,
            region,
            frame_buf: Vec::new(),
        })
    }

    pub fn names(&self) -> &ChannelNames {
        &self.names
    }

    pub fn layout(&self) -> RegionLayout {
        self.region.layout()
    }

    pub fn signal_ready(&self) -> Result<(), IpcError> {
        self.worker_ready
            .raise()
            .map_err(|e| IpcError::raise(self.worker_ready.name(), e))
    }

    pub fn shutdown_requested(&self) -> bool {
        self.region.shutdown_requested()
    }

    /// Waits for frame-ready. `Ok(None)` when `timeout` elapsed without one.
    /// The shutdown flag is checked before anything else is read.
    pub fn wait_frame(&mut self, timeout: Duration) -> Result<Option<WorkerEvent<'_>>, IpcError> {
        let raised = self
            .frame_ready
            .wait(timeout)
            .map_err(|e| IpcError::signal(self.frame_ready.name(), e))?;
        if !raised {
            return Ok(None);
        }
        if self.region.shutdown_requested() {
            return Ok(Some(WorkerEvent::Shutdown));
        }

        let header = self.region.read_frame_header();
        let size = header.data_size as usize;
        let capacity = self.region.layout().frame_capacity;
        if size > capacity {
            return Err(IpcError::FrameTooLarge { size, capacity });
        }
        let Some(format) = header.format() else {
            return Ok(Some(WorkerEvent::Unsupported(header)));
        };
        self.region
            .read_frame_payload(size, &mut self.frame_buf)
            .map_err(|_| IpcError::FrameTooLarge { size, capacity })?;
        Ok(Some(WorkerEvent::Frame(InboundFrame {
            header,
            format,
            data: &self.frame_buf,
        })))
    }

    /// Writes the packet into the packet slot and raises packet-ready.
    pub fn send_packet(&mut self, packet: &EncodedPacket) -> Result<(), IpcError> {
        let size = packet.data.len();
        let capacity = self.region.layout().packet_capacity;
        if size > capacity || u32::try_from(size).is_err() {
            return Err(IpcError::PacketTooLarge { size, capacity });
        }
        self.region
            .write_packet_payload(&packet.data)
            .map_err(|_| IpcError::PacketTooLarge { size, capacity })?;
        self.region.write_packet_header(&PacketHeader {
            size: size as u32,
            timestamp_ns: packet.timestamp_ns,
            is_idr: packet.is_idr,
        });
        self.packet_ready
            .raise()
            .map_err(|e| IpcError::raise(self.packet_ready.name(), e))
    }
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Upper bound of each frame-ready wait; cancellation and the parent
    /// check are evaluated at this rate.
    pub poll_interval: Duration,
    /// Exit once the process that launched the worker is gone.
    pub watch_parent: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            watch_parent: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    Shutdown,
    Cancelled,
    ParentExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub exit: ServeExit,
    pub frames_received: u64,
    pub packets_sent: u64,
    pub frames_dropped: u64,
}

impl ServeSummary {
    fn new() -> Self {
        Self {
            exit: ServeExit::Shutdown,
            frames_received: 0,
            packets_sent: 0,
            frames_dropped: 0,
        }
    }
}

/// Runs the frame loop until the client requests shutdown, `cancel` fires, or
/// the parent process disappears. Frames that cannot be encoded are dropped;
/// the client sees a packet timeout for them.
pub fn serve<E: FrameEncoder + ?Sized>(
    channel: &mut WorkerChannel,
    encoder: &mut E,
    cancel: &CancellationToken,
    opts: &ServeOptions,
) -> Result<ServeSummary, IpcError> {
    let parent = unsafe { libc::getppid() };
    let mut summary = ServeSummary::new();
    log::info!("worker loop started, encoder: {}", encoder.name());

    loop {
        if cancel.is_cancelled() {
            summary.exit = ServeExit::Cancelled;
            break;
        }
        if opts.watch_parent && unsafe { libc::getppid() } != parent {
            log::warn!("parent process {} is gone", parent);
            summary.exit = ServeExit::ParentExited;
            break;
        }

        let packet = match channel.wait_frame(opts.poll_interval) {
            Ok(None) => continue,
            Ok(Some(WorkerEvent::Shutdown)) => {
                summary.exit = ServeExit::Shutdown;
                break;
            }
            Ok(Some(WorkerEvent::Unsupported(header))) => {
                log::warn!(
                    "dropping frame ts={} with unknown pixel format {}",
                    header.timestamp_ns,
                    header.pixel_format
                );
                summary.frames_dropped += 1;
                continue;
            }
            Ok(Some(WorkerEvent::Frame(frame))) => {
                summary.frames_received += 1;
                if summary.frames_received % FRAME_LOG_INTERVAL == 1 {
                    log::debug!(
                        "frame #{} {}x{} {} ts={} size={}",
                        summary.frames_received,
                        frame.header.width,
                        frame.header.height,
                        frame.format,
                        frame.header.timestamp_ns,
                        frame.data.len()
                    );
                }
                match encoder.encode(&frame) {
                    Ok(packets) => merge_packets(packets),
                    Err(e) => {
                        log::error!("encode failed for ts={}: {:#}", frame.header.timestamp_ns, e);
                        None
                    }
                }
            }
            Err(e @ IpcError::FrameTooLarge { .. }) => {
                log::warn!("dropping frame: {}", e);
                summary.frames_dropped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let Some(packet) = packet else {
            summary.frames_dropped += 1;
            continue;
        };
        match channel.send_packet(&packet) {
            Ok(()) => summary.packets_sent += 1,
            Err(e @ IpcError::PacketTooLarge { .. }) => {
                log::error!("dropping packet: {}", e);
                summary.frames_dropped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    log::info!(
        "worker loop finished ({:?}): {} frames, {} packets, {} dropped",
        summary.exit,
        summary.frames_received,
        summary.packets_sent,
        summary.frames_dropped
    );
    Ok(summary)
}

#[cfg(test)]
mod worker_test;
