//! Element-wise vector addition offloaded to the GPU with
//! [wgpu](https://github.com/gfx-rs/wgpu) compute shaders.
//!
//! The crate acquires the first GPU-class device, uploads two `f32`
//! vectors, runs one data-parallel addition kernel, and reads the result
//! back. The API is synchronous and blocking: every call waits for the GPU
//! to finish before returning. Device objects are owned by ordinary Rust
//! values, so they are released on every exit path, and a
//! [`ResourceTracker`] reports how many are still alive.
//!
//! ```no_run
//! let report = gpu_vector_add::run_vector_add(5)?;
//! assert_eq!(report.result, vec![3.0, 6.0, 9.0, 12.0, 15.0]);
//! # Ok::<(), gpu_vector_add::Error>(())
//! ```

pub mod buffer;
pub mod compute;
pub mod context;
pub mod error;
pub mod kernel;
pub mod runner;
pub mod tracker;

// Re-export the most common types at the crate root.
pub use buffer::{Access, BufferConfig, BufferContents, GpuBuffer};
pub use compute::{workgroup_grid, Dispatch};
pub use context::{select_adapter, AdapterSummary, ContextConfig, GpuContext, Platform};
pub use error::{Diagnostic, Error, Result, Severity};
pub use kernel::{CompiledKernel, KernelArg, KernelSpec};
pub use runner::{
    cpu_vector_add, generate_inputs, run_vector_add, RunConfig, RunReport, VectorAddRunner,
    DEFAULT_LEN,
};
pub use tracker::{ResourceGuard, ResourceKind, ResourceTracker};
