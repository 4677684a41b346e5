use std::time::Duration;

use bytes::Bytes;
use shm_channel::{ChannelNames, FrameHeader, NamedSignal, RegionLayout, SharedRegion};

use super::{BackendKind, MediaTransportBackend};
use crate::error::IpcError;
use crate::frame::Packet;

struct Signals {
    frame_ready: NamedSignal,
    packet_ready: NamedSignal,
    worker_ready: NamedSignal,
}

/// Shared-memory backend: the region and signals are created by the worker,
/// this side only opens them.
pub struct ShmBackend {
    names: ChannelNames,
    layout: RegionLayout,
    region: Option<SharedRegion>,
    signals: Option<Signals>,
}

impl ShmBackend {
    pub fn new(names: ChannelNames, layout: RegionLayout) -> Self {
        Self {
            names,
            layout,
            region: None,
            signals: None,
        }
    }

    fn parts(&mut self) -> Result<(&mut SharedRegion, &Signals), IpcError> {
        match (self.region.as_mut(), self.signals.as_ref()) {
            (Some(region), Some(signals)) => Ok((region, signals)),
            _ => Err(IpcError::NotConnected),
        }
    }
}

fn open_signal(name: &str) -> Result<NamedSignal, IpcError> {
    match NamedSignal::open(name) {
        Ok(Some(signal)) => Ok(signal),
        Ok(None) => Err(IpcError::signal(name, "does not exist")),
        Err(e) => Err(IpcError::signal(name, e)),
    }
}

impl MediaTransportBackend for ShmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SharedMemory
    }

    fn frame_capacity(&self) -> usize {
        self.layout.frame_capacity
    }

    fn packet_capacity(&self) -> usize {
        self.layout.packet_capacity
    }

    fn try_attach(&mut self) -> Result<bool, IpcError> {
        if self.region.is_some() {
            return Ok(true);
        }
        match SharedRegion::open(&self.names.region, self.layout) {
            Ok(Some(region)) => {
                self.region = Some(region);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(IpcError::region(e)),
        }
    }

    fn is_attached(&self) -> bool {
        self.region.is_some()
    }

    fn open_signals(&mut self) -> Result<(), IpcError> {
        if self.signals.is_some() {
            return Ok(());
        }
        self.signals = Some(Signals {
            frame_ready: open_signal(&self.names.frame_ready)?,
            packet_ready: open_signal(&self.names.packet_ready)?,
            worker_ready: open_signal(&self.names.worker_ready)?,
        });
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), IpcError> {
        let signals = self.signals.as_ref().ok_or(IpcError::NotConnected)?;
        let ready = signals
            .worker_ready
            .wait(timeout)
            .map_err(|e| IpcError::signal(signals.worker_ready.name(), e))?;
        if !ready {
            return Err(IpcError::WorkerNotReady { timeout });
        }
        // A packet raised for a previous client must not satisfy our first wait.
        let stale = signals.packet_ready.drain();
        if stale > 0 {
            log::debug!("discarded {} stale packet-ready raise(s)", stale);
        }
        Ok(())
    }

    fn publish_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), IpcError> {
        let capacity = self.layout.frame_capacity;
        let (region, signals) = self.parts()?;
        if payload.len() > capacity {
            return Err(IpcError::FrameTooLarge {
                size: payload.len(),
                capacity,
            });
        }
        region.write_frame_header(header);
        region
            .write_frame_payload(payload)
            .map_err(|_| IpcError::FrameTooLarge {
                size: payload.len(),
                capacity,
            })?;
        signals
            .frame_ready
            .raise()
            .map_err(|e| IpcError::raise(signals.frame_ready.name(), e))
    }

    fn await_packet(&mut self, timeout: Duration) -> Result<Packet, IpcError> {
        let capacity = self.layout.packet_capacity;
        let (region, signals) = self.parts()?;
        let raised = signals
            .packet_ready
            .wait(timeout)
            .map_err(|e| IpcError::signal(signals.packet_ready.name(), e))?;
        if !raised {
            return Err(IpcError::Timeout(timeout));
        }

        let header = region.read_packet_header();
        let size = header.size as usize;
        if size > capacity {
            return Err(IpcError::PacketTooLarge { size, capacity });
        }
        let mut data = Vec::with_capacity(size);
        region
            .read_packet_payload(size, &mut data)
            .map_err(|_| IpcError::PacketTooLarge { size, capacity })?;

        Ok(Packet {
            data: Bytes::from(data),
            timestamp_ns: header.timestamp_ns,
            is_idr: header.is_idr,
        })
    }

    fn request_shutdown(&mut self) {
        if let Some(region) = self.region.as_mut() {
            region.request_shutdown();
        }
        if let Some(signals) = self.signals.as_ref() {
            if let Err(e) = signals.frame_ready.raise() {
                log::warn!("failed to wake worker for shutdown: {}", e);
            }
        }
    }

    fn release(&mut self) {
        self.signals = None;
        self.region = None;
    }
}

impl Drop for ShmBackend {
    fn drop(&mut self) {
        self.release();
    }
}
