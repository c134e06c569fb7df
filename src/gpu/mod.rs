//! Compute device management using wgpu

pub mod completion;
pub mod context;
pub mod timing;

pub use completion::Completion;
pub use context::GpuContext;
