//! Command channel over the shared-memory segment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{error, trace, warn};

use texshare_core::ProcessId;
use texshare_protocol::{poll_interval, Response, SegmentError, ShmSegment, SlotState, Status};

use super::{ChannelError, CommandChannel, Incoming};

/// Daemon side of the command segment.
///
/// Owns the segment file: it is created (replacing any leftover from a
/// previous run) on construction and removed on drop.
#[derive(Debug)]
pub struct ShmChannel {
    segment: ShmSegment,
}

impl ShmChannel {
    /// Creates the command segment at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let segment = ShmSegment::create(path)?;
        Ok(Self { segment })
    }

    pub fn path(&self) -> PathBuf {
        self.segment.path().to_path_buf()
    }

    fn publish(&self, seq: u64, bytes: &[u8]) -> Result<(), SegmentError> {
        self.segment.publish_response(seq, bytes)
    }
}

#[async_trait]
impl CommandChannel for ShmChannel {
    async fn try_dequeue(&mut self, max_wait: Duration) -> Result<Option<Incoming>, ChannelError> {
        let deadline = Instant::now() + max_wait;
        let interval = poll_interval(max_wait);

        loop {
            if let Some((seq, bytes)) = self.segment.take_request() {
                trace!(seq, len = bytes.len(), "Dequeued command");
                return Ok(Some(Incoming { seq, bytes }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(interval).await;
        }
    }

    async fn write_response(&mut self, seq: u64, response: &Response) -> Result<(), ChannelError> {
        if self.segment.state() != SlotState::Executing {
            warn!(seq, "Writing response while no command is executing");
        }

        let result = response
            .encode()
            .map_err(ChannelError::from)
            .and_then(|bytes| self.publish(seq, &bytes).map_err(ChannelError::from));

        if let Err(e) = result {
            // The client is still waiting on the slot, so it must get some answer.
            error!(seq, error = %e, "Failed to publish response, sending bare failure");
            let fallback = Response::failure(seq, Status::MalformedRequest).encode()?;
            self.publish(seq, &fallback)?;
            return Err(e);
        }
        Ok(())
    }

    fn lock_owner(&self) -> Option<ProcessId> {
        self.segment
            .lock_owner()
            .and_then(|pid| ProcessId::new(pid).ok())
    }

    fn clear_stale_lock(&mut self, owner: ProcessId) -> bool {
        self.segment.clear_stale_lock(owner.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texshare_protocol::ResponsePayload;

    #[tokio::test]
    async fn test_dequeue_times_out_on_empty_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = ShmChannel::create(dir.path().join("cmd")).unwrap();

        let got = channel.try_dequeue(Duration::from_millis(5)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_dequeue_and_respond() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");
        let mut channel = ShmChannel::create(&path).unwrap();
        let client = ShmSegment::open(&path).unwrap();

        client.submit_request(5, b"{}").unwrap();
        let incoming = channel
            .try_dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.seq, 5);
        assert_eq!(incoming.bytes, b"{}");

        let pid = ProcessId::new(9).unwrap();
        let response = Response::ok(5, ResponsePayload::Registered { pid });
        channel.write_response(5, &response).await.unwrap();

        let bytes = client.take_response(5).unwrap();
        assert_eq!(Response::decode(&bytes).unwrap(), response);
    }

    #[tokio::test]
    async fn test_lock_owner_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");
        let mut channel = ShmChannel::create(&path).unwrap();
        let client = ShmSegment::open(&path).unwrap();

        assert_eq!(channel.lock_owner(), None);
        assert!(client.try_lock(77));
        let owner = channel.lock_owner().unwrap();
        assert_eq!(owner.get(), 77);

        assert!(channel.clear_stale_lock(owner));
        assert_eq!(channel.lock_owner(), None);
        assert!(!channel.clear_stale_lock(owner));
    }
}
