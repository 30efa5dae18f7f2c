//! Shared image registry.
//!
//! The registry is the single source of truth for name → image and
//! id → image lookups. It is owned by the dispatcher and only mutated inside
//! a single command's execution window, so both indexes always agree.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌─────────────────────────────┐
//! │ by_name              │        │ images (arena)              │
//! │ HashMap<ImageName,   │───────▶│ HashMap<ImageId,            │
//! │         ImageId>     │        │         SharedImage<A>>     │
//! └──────────────────────┘        └─────────────────────────────┘
//!                                     │ allocation: A (owned, !Clone)
//!                                     ▼
//!                               released exactly once via
//!                               GpuBackend::release_shared_image
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`

mod events;
mod store;

pub use events::{DestroyReason, ImageEvent, RegistryError};
pub use store::{ImageRegistry, SharedImage, VacantImage};

/// Default maximum number of images the registry can hold.
pub const MAX_IMAGES: usize = 256;
