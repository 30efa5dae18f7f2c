//! texshare client - talk to the texshare daemon
//!
//! Provides [`TextureShareClient`] for registering processes, creating and
//! joining shared images, renaming them and fetching their handles, plus
//! [`import_handles`] to duplicate those handles into the calling process.

pub mod client;
pub mod error;
pub mod import;

pub use client::{ClientConfig, TextureShareClient, CHANNEL_ENV, DEFAULT_CHANNEL_PATH};
pub use error::ClientError;
pub use import::{import_handles, ImportedImage};

pub use texshare_core::{ImageFormat, ImageId, ImageName, ProcessId};
pub use texshare_protocol::ImageHandlesReply;
