//! Local fallback: rewrite the intercepted argv for the host GPU and run
//! the real transcoder in place when no remote capacity is available.

pub mod gpu;
pub mod rewrite;
pub mod run;
pub mod selfheal;

pub use gpu::GpuKind;
pub use rewrite::rewrite_for_gpu;
