//! Client error types.

use std::time::Duration;

use thiserror::Error;

use texshare_protocol::{ProtocolError, SegmentError, Status};

/// Errors returned by [`TextureShareClient`](crate::TextureShareClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The command segment could not be opened or written.
    #[error("command segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No response arrived in time. The command may or may not have run.
    #[error("no response from daemon within {0:?}")]
    ChannelTimeout(Duration),

    #[error("image not found")]
    NotFound,

    #[error("image exists with a different definition, or the name is taken")]
    Conflict,

    #[error("process does not hold this image")]
    PermissionDenied,

    #[error("daemon capacity exceeded")]
    CapacityExceeded,

    /// Rejected by the daemon, or too large for the command slot.
    #[error("request rejected as malformed")]
    MalformedRequest,

    #[error("daemon speaks an incompatible protocol version")]
    VersionMismatch,

    #[error("daemon failed to allocate the image")]
    AllocationFailed,

    /// A success response carried the wrong payload.
    #[error("unexpected response payload for {0}")]
    UnexpectedPayload(&'static str),

    /// Duplicating a handle into this process failed.
    #[error("failed to import handle: {0}")]
    Import(String),
}

impl ClientError {
    /// Maps a failure status from the daemon. Returns `None` for `Ok`.
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::Ok => None,
            Status::NotFound => Some(Self::NotFound),
            Status::Conflict => Some(Self::Conflict),
            Status::PermissionDenied => Some(Self::PermissionDenied),
            Status::CapacityExceeded => Some(Self::CapacityExceeded),
            Status::MalformedRequest => Some(Self::MalformedRequest),
            Status::VersionMismatch => Some(Self::VersionMismatch),
            Status::AllocationFailed => Some(Self::AllocationFailed),
        }
    }

    /// True when the outcome of the command is unknown.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ChannelTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(ClientError::from_status(Status::Ok).is_none());
        assert!(matches!(
            ClientError::from_status(Status::NotFound),
            Some(ClientError::NotFound)
        ));
        assert!(matches!(
            ClientError::from_status(Status::PermissionDenied),
            Some(ClientError::PermissionDenied)
        ));
        assert!(matches!(
            ClientError::from_status(Status::AllocationFailed),
            Some(ClientError::AllocationFailed)
        ));
    }

    #[test]
    fn test_timeout_classification() {
        assert!(ClientError::ChannelTimeout(Duration::from_millis(5)).is_timeout());
        assert!(!ClientError::Conflict.is_timeout());
    }
}
