//! Shared-memory building blocks of the encoder offload channel: the packed
//! byte layout both processes agree on, the named mapping that carries it,
//! and the named binary signals used for the frame / packet / readiness
//! handshake.

#[cfg(not(unix))]
compile_error!("shm-channel requires POSIX shared memory and named semaphores");

pub mod error;
pub mod layout;
pub mod lock;
pub mod names;
pub mod region;
pub mod signal;

pub use error::{ShmError, ShmResult};
pub use layout::{FrameHeader, PacketHeader, PixelFormat, RegionLayout};
pub use lock::OwnerLock;
pub use names::ChannelNames;
pub use region::SharedRegion;
pub use signal::NamedSignal;
