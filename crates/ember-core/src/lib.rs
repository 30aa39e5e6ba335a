//! # ember-core
//!
//! Safe ownership layer over the libtorch C wrapper.
//!
//! Provides:
//! - `Tensor`, the exclusive owner of one native tensor handle
//! - `OutputBuffer<K>` and the `ops` table, the only path for native calls
//!   that return tensors
//! - `grad`, the process-wide gradient mode with scoped restore
//! - `Device`, CPU / CUDA / MPS with availability and lifecycle queries
//! - `runtime`, loading or installing the native entry points

pub mod buffer;
pub mod device;
pub mod error;
pub mod grad;
pub mod kind;
pub mod ops;
pub mod runtime;
pub mod shape;
pub mod tensor;

pub use buffer::OutputBuffer;
pub use device::{Cuda, Device, Mps};
pub use error::EmberError;
pub use grad::GradModeGuard;
pub use kind::Kind;
pub use runtime::RuntimeConfig;
pub use shape::Shape;
pub use tensor::{live_tensors, Tensor};

pub type Result<T> = std::result::Result<T, EmberError>;

#[cfg(test)]
pub(crate) mod test_support {
    /// Route this test binary to the in-process fake runtime.
    pub fn init() {
        let _ = crate::runtime::install(ember_sys::fake::api());
    }
}
