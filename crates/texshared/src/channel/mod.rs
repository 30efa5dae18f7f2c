//! Command channel seam.
//!
//! The dispatcher consumes commands through [`CommandChannel`], which hides
//! the transport. [`ShmChannel`] is the production implementation over the
//! shared-memory command segment.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Transport failures surface as `ChannelError`, never as panics

mod shm;

pub use shm::ShmChannel;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use texshare_core::ProcessId;
use texshare_protocol::{ProtocolError, Response, SegmentError};

/// A raw command pulled off the channel, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Sequence number the client framed the command with
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// Transport the dispatcher receives commands from.
#[async_trait]
pub trait CommandChannel: Send {
    /// Waits up to `max_wait` for the next command.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn try_dequeue(&mut self, max_wait: Duration) -> Result<Option<Incoming>, ChannelError>;

    /// Answers the command previously dequeued with `seq`.
    async fn write_response(&mut self, seq: u64, response: &Response) -> Result<(), ChannelError>;

    /// Process currently holding the channel's advisory lock.
    fn lock_owner(&self) -> Option<ProcessId>;

    /// Clears the advisory lock if `owner` still holds it.
    fn clear_stale_lock(&mut self, owner: ProcessId) -> bool;
}

/// Errors raised by a command channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("command segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("failed to frame response: {0}")]
    Protocol(#[from] ProtocolError),
}
