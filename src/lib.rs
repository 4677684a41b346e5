//! Offloads real-time video encoding to a separate worker process. Raw frames
//! travel to the worker through a named shared-memory region, encoded packets
//! come back through the same region, one slot per direction.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod launcher;
pub mod transport;
pub mod worker;

pub use client::{ChannelStats, ConnectionState, EncoderClient};
pub use codec::Codec;
pub use config::{BridgeConfig, config};
pub use error::IpcError;
pub use frame::{FrameDescriptor, Packet};
pub use shm_channel::{PixelFormat, RegionLayout};
pub use transport::{BackendKind, MediaTransportBackend};
