//! texshare protocol - wire contract between clients and the daemon
//!
//! This crate provides the request/response message types and the
//! shared-memory command segment through which clients submit one
//! command at a time to the daemon.

pub mod message;
pub mod segment;
pub mod status;
pub mod version;

pub use message::{Command, ImageHandlesReply, ProtocolError, Request, Response, ResponsePayload};
pub use segment::{
    poll_interval, SegmentError, ShmSegment, SlotState, LAYOUT_VERSION, SEGMENT_SIZE, SLOT_CAPACITY,
};
pub use status::Status;
pub use version::ProtocolVersion;
