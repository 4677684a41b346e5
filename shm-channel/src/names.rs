//! Names of the OS objects making up one channel.

use crate::error::{ShmError, ShmResult};

pub const DEFAULT_PREFIX: &str = "encode_offload";

/// Semaphore names are limited to NAME_MAX - 4 on Linux, keep room for the
/// longest suffix.
const MAX_PREFIX_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    prefix: String,
    pub region: String,
    pub frame_ready: String,
    pub packet_ready: String,
    pub worker_ready: String,
}

impl ChannelNames {
    pub fn from_prefix(prefix: &str) -> ShmResult<Self> {
        validate_prefix(prefix)?;
        Ok(Self::build(prefix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_default(&self) -> bool {
        self.prefix == DEFAULT_PREFIX
    }

    fn build(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            region: format!("/{}", prefix),
            frame_ready: format!("/{}_frame_ready", prefix),
            packet_ready: format!("/{}_packet_ready", prefix),
            worker_ready: format!("/{}_worker_ready", prefix),
        }
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self::build(DEFAULT_PREFIX)
    }
}

fn validate_prefix(prefix: &str) -> ShmResult<()> {
    let reason = if prefix.is_empty() {
        Some("empty prefix")
    } else if prefix.len() > MAX_PREFIX_LEN {
        Some("prefix too long")
    } else if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        Some("only [A-Za-z0-9_.-] allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ShmError::InvalidName {
            name: prefix.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
