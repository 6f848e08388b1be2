//! Shared memory coordination primitives
//!
//! Named shared regions, a named binary gate, and reference-counted typed
//! segments that combine the two.

#[cfg(not(unix))]
compile_error!("shm-coord-shared-memory requires POSIX shared memory and named semaphores");

pub mod error;
pub mod gate;
pub mod platform;
pub mod region;
pub mod segment;

pub use error::*;
pub use gate::*;
pub use platform::*;
pub use region::*;
pub use segment::*;

/// Current version of the segment layout
pub const SHARED_MEMORY_VERSION: u8 = 1;
