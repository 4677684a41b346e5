//! Host side of the encoder offload: attaches to or launches the worker,
//! hands it raw frames and collects encoded packets.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::codec::Codec;
use crate::config::BridgeConfig;
use crate::error::IpcError;
use crate::frame::{FrameDescriptor, Packet};
use crate::launcher::{self, WorkerProcess};
use crate::transport::{self, MediaTransportBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Counters since the client was created; they survive reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_rejected: u64,
    pub packets_received: u64,
    pub packet_timeouts: u64,
}

impl Display for ChannelStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent: {}, rejected: {}, received: {}, timeouts: {}",
            self.frames_sent, self.frames_rejected, self.packets_received, self.packet_timeouts
        )
    }
}

/// Every OS resource of one connection. Dropping it tears the connection
/// down, whichever state it reached.
struct Session {
    backend: Box<dyn MediaTransportBackend>,
    worker: Option<WorkerProcess>,
    connected: bool,
    shutdown_grace: Duration,
}

impl Drop for Session {
    fn drop(&mut self) {
        // A worker we merely attached to and never finished connecting with
        // belongs to someone else.
        if self.connected || self.worker.is_some() {
            self.backend.request_shutdown();
        }
        if let Some(worker) = self.worker.as_mut() {
            worker.wait_for_exit(self.shutdown_grace);
        }
        self.backend.release();
        self.worker = None;
    }
}

pub struct EncoderClient {
    config: BridgeConfig,
    state: ConnectionState,
    session: Option<Session>,
    stats: ChannelStats,
    awaiting_packet: bool,
}

impl EncoderClient {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            session: None,
            stats: ChannelStats::default(),
            awaiting_packet: false,
        }
    }

    /// Client using the process-wide [`crate::config::config`].
    pub fn from_global_config() -> Self {
        Self::new(crate::config::config().clone())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether the shared region is currently mapped.
    pub fn is_attached(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.backend.is_attached())
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Pid of the worker this client launched, if any.
    pub fn worker_pid(&self) -> Option<u32> {
        self.session
            .as_ref()
            .and_then(|session| session.worker.as_ref())
            .map(WorkerProcess::id)
    }

    /// Connects to the worker, launching it with `width height codec` when no
    /// region exists yet. On failure every acquired resource is released and
    /// the client is back in `Disconnected`.
    pub fn initialize(&mut self, width: u32, height: u32, codec: Codec) -> Result<(), IpcError> {
        if self.session.is_some() {
            log::info!("re-initializing, closing the current session first");
            self.shutdown();
        }

        self.state = ConnectionState::Connecting;
        match self.connect(width, height, codec) {
            Ok(session) => {
                self.session = Some(session);
                self.state = ConnectionState::Connected;
                log::info!(
                    "connected to encode worker ({}x{} {}, {})",
                    width,
                    height,
                    codec,
                    self.config.layout
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                log::error!("encode worker connection failed: {}", e);
                Err(e)
            }
        }
    }

    fn connect(&self, width: u32, height: u32, codec: Codec) -> Result<Session, IpcError> {
        let mut session = Session {
            backend: transport::create_backend(&self.config)?,
            worker: None,
            connected: false,
            shutdown_grace: self.config.shutdown_grace(),
        };

        if session.backend.try_attach()? {
            log::info!("attached to a running encode worker");
        } else {
            let path = launcher::resolve_worker_binary(&self.config)?;
            let args = launcher::worker_args(width, height, codec, &self.config);
            session.worker = Some(WorkerProcess::spawn(&path, &args)?);
            self.discover(&mut session)?;
        }

        session.backend.open_signals()?;
        session.backend.wait_ready(self.config.ready_timeout())?;
        session.connected = true;
        Ok(session)
    }

    /// Polls for the region the launched worker creates.
    fn discover(&self, session: &mut Session) -> Result<(), IpcError> {
        let interval = self.config.discovery_interval();
        for attempt in 1..=self.config.discovery_attempts {
            std::thread::sleep(interval);
            if session.backend.try_attach()? {
                log::debug!("shared region appeared after {} poll(s)", attempt);
                return Ok(());
            }
            if let Some(worker) = session.worker.as_mut() {
                if let Some(status) = worker.has_exited() {
                    return Err(IpcError::SharedRegionUnavailable {
                        reason: format!("worker exited with {} before creating it", status),
                    });
                }
            }
        }
        Err(IpcError::SharedRegionUnavailable {
            reason: format!(
                "not created within {} polls of {:?}",
                self.config.discovery_attempts, interval
            ),
        })
    }

    fn connected_session(&mut self) -> Result<&mut Session, IpcError> {
        match self.session.as_mut() {
            Some(session) if self.state == ConnectionState::Connected => Ok(session),
            _ => Err(IpcError::NotConnected),
        }
    }

    /// Publishes one frame. The data size is `pixels.len()`. The frame slot is
    /// overwritten even if the previous packet was never collected.
    pub fn send_frame(&mut self, pixels: &[u8], frame: &FrameDescriptor) -> Result<(), IpcError> {
        let awaiting = self.awaiting_packet;
        let session = self.connected_session()?;

        let capacity = session.backend.frame_capacity();
        let data_size = match u32::try_from(pixels.len()) {
            Ok(size) if pixels.len() <= capacity => size,
            _ => {
                self.stats.frames_rejected += 1;
                return Err(IpcError::FrameTooLarge {
                    size: pixels.len(),
                    capacity,
                });
            }
        };
        if awaiting {
            log::warn!(
                "frame ts={} sent before the previous packet was received",
                frame.timestamp_ns
            );
        }

        if let Err(e) = session
            .backend
            .publish_frame(&frame.to_header(data_size), pixels)
        {
            self.stats.frames_rejected += 1;
            return Err(e);
        }
        self.stats.frames_sent += 1;
        self.awaiting_packet = true;
        Ok(())
    }

    /// Waits up to `timeout` for the packet of the last frame. A `Timeout` is
    /// not a connection fault; the caller may send the next frame.
    pub fn receive_packet(&mut self, timeout: Duration) -> Result<Packet, IpcError> {
        let session = self.connected_session()?;
        let result = session.backend.await_packet(timeout);
        match &result {
            Ok(_) => self.stats.packets_received += 1,
            Err(IpcError::Timeout(_)) => self.stats.packet_timeouts += 1,
            Err(_) => {}
        }
        self.awaiting_packet = false;
        result
    }

    /// [`Self::receive_packet`] with the configured packet timeout.
    pub fn receive_packet_default(&mut self) -> Result<Packet, IpcError> {
        self.receive_packet(self.config.packet_timeout())
    }

    /// Tears the session down. Safe in every state and any number of times.
    pub fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            log::info!("shutting down encode worker session ({})", self.stats);
            drop(session);
        }
        self.state = ConnectionState::Disconnected;
        self.awaiting_packet = false;
    }
}

impl Drop for EncoderClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;
