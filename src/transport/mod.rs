//! Transport backends the client can drive a worker through.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shm_channel::FrameHeader;

use crate::config::BridgeConfig;
use crate::error::IpcError;
use crate::frame::Packet;

pub mod shm;

pub use shm::ShmBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum BackendKind {
    /// Named shared-memory region plus named semaphores.
    #[default]
    SharedMemory,
}

/// Client half of a single-slot frame / packet channel.
///
/// Implementations own every OS handle they acquire and give them back in
/// `release`, which must be safe to call in any state and more than once.
pub trait MediaTransportBackend: Send {
    fn kind(&self) -> BackendKind;

    fn frame_capacity(&self) -> usize;

    fn packet_capacity(&self) -> usize;

    /// Attaches to the worker's region. `Ok(false)` while it does not exist yet.
    fn try_attach(&mut self) -> Result<bool, IpcError>;

    fn is_attached(&self) -> bool;

    /// Opens the frame-ready, packet-ready and worker-ready signals. The
    /// worker creates them before announcing readiness, a missing one is fatal.
    fn open_signals(&mut self) -> Result<(), IpcError>;

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), IpcError>;

    /// Writes `header` and `payload` into the frame slot and raises frame-ready.
    fn publish_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), IpcError>;

    fn await_packet(&mut self, timeout: Duration) -> Result<Packet, IpcError>;

    /// Sets the shutdown flag and wakes a worker blocked on frame-ready.
    fn request_shutdown(&mut self);

    fn release(&mut self);
}

pub fn create_backend(config: &BridgeConfig) -> Result<Box<dyn MediaTransportBackend>, IpcError> {
    match config.backend {
        BackendKind::SharedMemory => Ok(Box::new(ShmBackend::new(
            config.channel_names()?,
            config.layout,
        ))),
    }
}
