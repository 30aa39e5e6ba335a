//! # ember-sys
//!
//! Raw bindings to the libtorch C wrapper (`torch_api.h`).
//!
//! Provides:
//! - [`NativeHandle`], the non-null ownership tag for one native tensor
//! - [`NativeApi`], a runtime-loaded entry-point table (no link-time libtorch dependency)
//! - `fake`, an in-process stand-in for the wrapper used by tests (feature `fake`)

pub mod api;
pub mod handle;

#[cfg(feature = "fake")]
pub mod fake;

pub use api::{default_library_name, LoadError, NativeApi};
pub use handle::{C_tensor, NativeHandle, RawTensor};
