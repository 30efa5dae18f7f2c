//! texshared - shared image broker daemon
//!
//! This crate provides the core infrastructure for the texshare daemon:
//! - `registry` - name/id index of shared images and their allocations
//! - `liveness` - registered client processes and death detection
//! - `gpu` - allocation backend producing exportable handles
//! - `channel` - command transport (shared-memory segment)
//! - `dispatcher` - single-flight command loop owning all state
//! - `config` - daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      texshared daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   ShmChannel    │────▶│        Dispatcher           │    │
//! │  │ (command slot)  │◀────│  (one command at a time)    │    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │                   │
//! │                                         ▼                   │
//! │                          ┌─────────────────────────────┐    │
//! │                          │        DaemonState          │    │
//! │                          │ registry · liveness · gpu   │    │
//! │                          └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod gpu;
pub mod liveness;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::{ChannelError, CommandChannel, Incoming, ShmChannel};
pub use config::{ConfigError, DaemonConfig};
pub use dispatcher::{spawn_dispatcher, DaemonState, Dispatcher, DispatcherHandle, RegistryStats};
pub use gpu::{GpuBackend, GpuError, HostMemoryBackend};
pub use liveness::LivenessTracker;
pub use registry::{DestroyReason, ImageEvent, ImageRegistry, RegistryError};
