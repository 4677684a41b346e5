use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of the offload channel.
///
/// Setup failures (`WorkerBinaryNotFound` through `WorkerNotReady`) fail
/// `initialize`; the caller is expected to fall back to in-process encoding.
/// Per-frame failures leave the session connected.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("worker binary not found at {}", path.display())]
    WorkerBinaryNotFound { path: PathBuf },

    #[error("shared region unavailable: {reason}")]
    SharedRegionUnavailable { reason: String },

    #[error("signal {name} unavailable: {reason}")]
    SignalUnavailable { name: String, reason: String },

    #[error("worker did not signal readiness within {timeout:?}")]
    WorkerNotReady { timeout: Duration },

    #[error("channel is not connected")]
    NotConnected,

    #[error("frame of {size} bytes exceeds the {capacity} byte frame buffer")]
    FrameTooLarge { size: usize, capacity: usize },

    #[error("packet of {size} bytes exceeds the {capacity} byte packet buffer")]
    PacketTooLarge { size: usize, capacity: usize },

    #[error("raising {name} failed: {reason}")]
    SignalRaiseFailed { name: String, reason: String },

    #[error("no packet within {0:?}")]
    Timeout(Duration),
}

impl IpcError {
    /// The caller may simply try again on the next cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, IpcError::Timeout(_))
    }

    /// The session cannot be trusted any more and should be shut down.
    pub fn requires_teardown(&self) -> bool {
        matches!(
            self,
            IpcError::WorkerBinaryNotFound { .. }
                | IpcError::SharedRegionUnavailable { .. }
                | IpcError::SignalUnavailable { .. }
                | IpcError::WorkerNotReady { .. }
                | IpcError::PacketTooLarge { .. }
        )
    }

    pub(crate) fn region(err: impl std::fmt::Display) -> Self {
        IpcError::SharedRegionUnavailable {
            reason: err.to_string(),
        }
    }

    pub(crate) fn signal(name: &str, err: impl std::fmt::Display) -> Self {
        IpcError::SignalUnavailable {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn raise(name: &str, err: impl std::fmt::Display) -> Self {
        IpcError::SignalRaiseFailed {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}
