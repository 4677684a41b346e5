use std::io;

use thiserror::Error;

pub type ShmResult<T> = Result<T, ShmError>;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("invalid channel name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("{op} {name} failed: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("region {name} is {actual} bytes, layout expects {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("region {name} is owned by a running process")]
    InUse { name: String },

    #[error("{len} bytes exceed the {capacity} byte {buffer} buffer")]
    OutOfBounds {
        buffer: &'static str,
        len: usize,
        capacity: usize,
    },
}

impl ShmError {
    /// Captures `errno` of the call that just failed.
    pub(crate) fn last_os(op: &'static str, name: &str) -> Self {
        Self::from_io(op, name, io::Error::last_os_error())
    }

    pub(crate) fn from_io(op: &'static str, name: &str, source: io::Error) -> Self {
        ShmError::Os {
            op,
            name: name.to_string(),
            source,
        }
    }
}
