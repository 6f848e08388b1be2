//! Shared-memory coordination - Core Module
//!
//! Protocols built on the shared segments of `shm-coord-shared-memory`:
//! a shared accumulator folded into by many workers, a shared bounded
//! stack, the launcher that runs accumulator workers, and parallel matrix
//! symmetry checks.

pub mod accumulator;
pub mod error;
pub mod launcher;
pub mod stack;
pub mod symmetry;

pub use accumulator::{compute_local, sum_file, write_result, Accumulator, LocalSum, NumberTokens};
pub use error::*;
pub use launcher::{LaunchOptions, Launcher, RunReport, WorkerMode, WorkerReport, WorkerStatus};
pub use stack::SharedStack;
pub use symmetry::{Matrix, Pattern, SymmetryReport};

/// Re-export common types
pub mod prelude {
    pub use crate::{
        accumulator::{Accumulator, LocalSum, ACCUMULATOR_BASE},
        error::{CoordError, ErrorCategory, Result},
        launcher::{run_worker, LaunchOptions, Launcher, RunReport, WorkerMode, WorkerStatus},
        stack::{SharedStack, CAPACITY, MAX_LEN, STACK_BASE},
        symmetry::{Matrix, MatrixFile, Pattern, SymmetryReport},
    };
    pub use serde::{Deserialize, Serialize};
    pub use shm_coord_shared_memory::{Detached, SegmentOptions, SessionNames};
}

/// Current version of the coordination protocols
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
