//! Client for the texshare daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use texshare_core::{ImageFormat, ImageId, ImageName, ProcessId};
use texshare_protocol::{
    poll_interval, Command, ImageHandlesReply, Request, Response, ResponsePayload, ShmSegment,
    SlotState, SLOT_CAPACITY,
};

use crate::error::ClientError;

/// Default location of the command segment.
pub const DEFAULT_CHANNEL_PATH: &str = "/dev/shm/texshare.cmd";

/// Environment variable overriding the segment location.
pub const CHANNEL_ENV: &str = "TEXSHARE_CHANNEL";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the client.
///
/// # Example
///
/// ```rust
/// use texshare_client::ClientConfig;
///
/// let config = ClientConfig {
///     channel_path: std::path::PathBuf::from("/tmp/texshare.cmd"),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the daemon's command segment.
    pub channel_path: PathBuf,

    /// Pid used to take the channel lock. Defaults to the calling process.
    pub lock_pid: ProcessId,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let channel_path = std::env::var(CHANNEL_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_CHANNEL_PATH.to_string());
        Self {
            channel_path: PathBuf::from(channel_path),
            lock_pid: ProcessId::current(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Issues commands to the daemon through the shared-memory command segment.
///
/// Calls from tasks of the same process are serialized; calls from different
/// processes are serialized by the segment's advisory lock. Every operation
/// takes a timeout. When it expires the call fails with
/// [`ClientError::ChannelTimeout`] and the command's effect is unknown: it
/// may have run. `init_image` and `request_handles` are safe to retry.
pub struct TextureShareClient {
    segment: ShmSegment,
    lock_pid: ProcessId,
    /// Serializes callers within this process
    gate: Mutex<()>,
    /// Last handles seen per image name
    cache: Mutex<HashMap<ImageName, ImageHandlesReply>>,
}

impl TextureShareClient {
    /// Opens the daemon's command segment.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let segment = ShmSegment::open(&config.channel_path)?;
        debug!(path = %config.channel_path.display(), "Opened command segment");
        Ok(Self {
            segment,
            lock_pid: config.lock_pid,
            gate: Mutex::new(()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Opens the segment at the default (or environment-provided) path.
    pub fn connect_default() -> Result<Self, ClientError> {
        Self::connect(ClientConfig::default())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Adds `pid` to the daemon's liveness set.
    pub async fn register_process(
        &self,
        pid: ProcessId,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        match self.call(Command::RegisterProc { pid }, timeout).await? {
            ResponsePayload::Registered { .. } => Ok(()),
            _ => Err(ClientError::UnexpectedPayload("register_proc")),
        }
    }

    /// Creates the image `name`, or joins it if it already exists with the
    /// same definition. Returns its id.
    pub async fn init_image(
        &self,
        name: &ImageName,
        pid: ProcessId,
        width: u32,
        height: u32,
        format: ImageFormat,
        timeout: Duration,
    ) -> Result<ImageId, ClientError> {
        let command = Command::ImageInit {
            name: name.clone(),
            pid,
            width,
            height,
            format,
        };
        match self.call(command, timeout).await? {
            ResponsePayload::ImageCreated { id, joined } => {
                debug!(id = %id, image = %name, joined, "Image initialized");
                Ok(id)
            }
            _ => Err(ClientError::UnexpectedPayload("image_init")),
        }
    }

    /// Renames an image held by `pid`.
    pub async fn rename_image(
        &self,
        old_name: &ImageName,
        new_name: &ImageName,
        pid: ProcessId,
        timeout: Duration,
    ) -> Result<ImageId, ClientError> {
        let command = Command::Rename {
            old_name: old_name.clone(),
            new_name: new_name.clone(),
            pid,
        };
        let result = self.call(command, timeout).await;

        let mut cache = self.cache.lock().await;
        match result {
            Ok(ResponsePayload::Renamed { id }) => {
                if let Some(mut entry) = cache.remove(old_name) {
                    entry.name = new_name.clone();
                    cache.insert(new_name.clone(), entry);
                }
                Ok(id)
            }
            Ok(_) => Err(ClientError::UnexpectedPayload("rename")),
            Err(ClientError::NotFound) => {
                cache.remove(old_name);
                Err(ClientError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Asks the daemon for the handles of `name`, joining the image.
    ///
    /// Always goes to the daemon; the reply refreshes the local cache.
    pub async fn request_handles(
        &self,
        name: &ImageName,
        pid: ProcessId,
        force_update: bool,
        timeout: Duration,
    ) -> Result<ImageHandlesReply, ClientError> {
        let command = Command::RequestImageHandles {
            name: name.clone(),
            pid,
            force_update,
        };
        let result = self.call(command, timeout).await;

        let mut cache = self.cache.lock().await;
        match result {
            Ok(ResponsePayload::Handles(reply)) => {
                cache.insert(name.clone(), reply.clone());
                Ok(reply)
            }
            Ok(_) => Err(ClientError::UnexpectedPayload("request_image_handles")),
            Err(ClientError::NotFound) => {
                cache.remove(name);
                Err(ClientError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the cached handles for `name`, asking the daemon only when
    /// nothing is cached or `force_update` is set.
    ///
    /// Use `force_update` after a rename or when the image may have been
    /// destroyed and recreated under the same name.
    pub async fn find_image(
        &self,
        name: &ImageName,
        force_update: bool,
        timeout: Duration,
    ) -> Result<ImageHandlesReply, ClientError> {
        if !force_update {
            if let Some(reply) = self.cache.lock().await.get(name) {
                return Ok(reply.clone());
            }
        }
        self.request_handles(name, self.lock_pid, force_update, timeout)
            .await
    }

    /// Drops every cached reply.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    // ========================================================================
    // Channel Exchange
    // ========================================================================

    async fn call(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<ResponsePayload, ClientError> {
        let kind = command.kind();
        let response = self.exchange(command, timeout).await?;
        if let Some(error) = ClientError::from_status(response.status) {
            debug!(kind, status = %response.status, "Command failed");
            return Err(error);
        }
        response
            .payload
            .ok_or(ClientError::UnexpectedPayload(kind))
    }

    /// Sends one command and waits for its response, holding the channel
    /// lock for the whole exchange.
    async fn exchange(&self, command: Command, timeout: Duration) -> Result<Response, ClientError> {
        let seq = self.segment.next_seq();
        let bytes = Request::new(seq, command).encode()?;
        if bytes.len() > SLOT_CAPACITY {
            debug!(seq, size = bytes.len(), max = SLOT_CAPACITY, "Request does not fit the slot");
            return Err(ClientError::MalformedRequest);
        }

        let _gate = self.gate.lock().await;
        let deadline = Instant::now() + timeout;
        let interval = poll_interval(timeout);
        let pid = self.lock_pid.get();

        if !self.acquire_lock(pid, deadline, interval).await {
            debug!(owner = ?self.segment.lock_owner(), "Timed out waiting for channel lock");
            return Err(ClientError::ChannelTimeout(timeout));
        }

        let result = self
            .locked_exchange(seq, &bytes, deadline, interval, timeout)
            .await;

        if !self.segment.release_lock(pid) {
            warn!(pid, "Channel lock was taken from us during the exchange");
        }
        result
    }

    /// Polls the segment's advisory lock until it is ours or `deadline`
    /// passes.
    async fn acquire_lock(&self, pid: u32, deadline: Instant, interval: Duration) -> bool {
        loop {
            if self.segment.try_lock(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(interval).await;
        }
    }

    async fn locked_exchange(
        &self,
        seq: u64,
        bytes: &[u8],
        deadline: Instant,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        // Wait out a command still in flight from a previous holder and drop
        // any response nobody collected.
        loop {
            match self.segment.state() {
                SlotState::Empty => break,
                SlotState::Response => {
                    debug!("Discarding orphaned response");
                    self.segment.discard_response();
                }
                SlotState::Command | SlotState::Executing => {
                    if Instant::now() >= deadline {
                        return Err(ClientError::ChannelTimeout(timeout));
                    }
                    sleep(interval).await;
                }
            }
        }

        self.segment.submit_request(seq, bytes)?;

        loop {
            if let Some(bytes) = self.segment.take_response(seq) {
                return Ok(Response::decode(&bytes)?);
            }
            if Instant::now() >= deadline {
                if self.segment.withdraw_request() {
                    debug!(seq, "Withdrew command the daemon never picked up");
                }
                return Err(ClientError::ChannelTimeout(timeout));
            }
            sleep(interval).await;
        }
    }
}

impl std::fmt::Debug for TextureShareClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureShareClient")
            .field("segment", &self.segment)
            .field("lock_pid", &self.lock_pid)
            .finish()
    }
}
