//! Protocol message types for daemon communication.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use texshare_core::{ExternalHandles, ImageDescriptor, ImageFormat, ImageId, ImageName, ProcessId};

use crate::status::Status;
use crate::version::ProtocolVersion;

/// Commands a client can submit to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Add a process to the daemon's liveness set
    RegisterProc { pid: ProcessId },

    /// Create a shared image, or join it if one with the same definition exists
    ImageInit {
        name: ImageName,
        pid: ProcessId,
        width: u32,
        height: u32,
        format: ImageFormat,
    },

    /// Move an image to a new name
    Rename {
        old_name: ImageName,
        new_name: ImageName,
        pid: ProcessId,
    },

    /// Ask for the exportable handles of a named image
    RequestImageHandles {
        name: ImageName,
        pid: ProcessId,
        #[serde(default)]
        force_update: bool,
    },
}

impl Command {
    /// Wire name of the command kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterProc { .. } => "register_proc",
            Self::ImageInit { .. } => "image_init",
            Self::Rename { .. } => "rename",
            Self::RequestImageHandles { .. } => "request_image_handles",
        }
    }

    /// The process on whose behalf the command runs.
    pub fn pid(&self) -> ProcessId {
        match self {
            Self::RegisterProc { pid }
            | Self::ImageInit { pid, .. }
            | Self::Rename { pid, .. }
            | Self::RequestImageHandles { pid, .. } => *pid,
        }
    }
}

/// A command framed for the command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Client-chosen sequence number, echoed in the response
    pub seq: u64,

    /// Command payload
    #[serde(flatten)]
    pub command: Command,
}

impl Request {
    /// Creates a request with the current protocol version.
    pub fn new(seq: u64, command: Command) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            seq,
            command,
        }
    }

    /// Serializes the request for the channel.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parses a request from raw channel bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` for non-JSON input, an unknown
    /// command kind, missing fields or invalid values. The sequence number
    /// is salvaged when present so the daemon can still answer.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| {
            let seq = serde_json::from_slice::<serde_json::Value>(bytes)
                .ok()
                .and_then(|v| v.get("seq").and_then(serde_json::Value::as_u64));
            ProtocolError::Malformed {
                seq,
                reason: e.to_string(),
            }
        })
    }
}

/// Handles and metadata needed to import a shared image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHandlesReply {
    pub id: ImageId,
    pub name: ImageName,
    pub descriptor: ImageDescriptor,
    pub handles: ExternalHandles,
}

/// Payload attached to a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    /// Process is in the liveness set
    Registered { pid: ProcessId },

    /// Image exists under the requested name; `joined` when it already did
    ImageCreated { id: ImageId, joined: bool },

    /// Image now answers to its new name
    Renamed { id: ImageId },

    /// Handles of the requested image
    Handles(ImageHandlesReply),
}

/// The daemon's answer to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Sequence number of the request being answered
    pub seq: u64,

    pub status: Status,

    /// Present only when `status` is `Ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResponsePayload>,
}

impl Response {
    /// Creates a success response.
    pub fn ok(seq: u64, payload: ResponsePayload) -> Self {
        Self {
            seq,
            status: Status::Ok,
            payload: Some(payload),
        }
    }

    /// Creates a failure response; failures never carry a payload.
    pub fn failure(seq: u64, status: Status) -> Self {
        Self {
            seq,
            status,
            payload: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed {
            seq: None,
            reason: e.to_string(),
        })
    }
}

/// Errors raised while framing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {reason}")]
    Malformed { seq: Option<u64>, reason: String },

    #[error("Failed to encode message: {0}")]
    Encode(String),
}
