//! Runtime-loaded libtorch C wrapper entry points via dlopen.
//!
//! The wrapper (`torch_api.h`) exposes every operator as
//! `void atg_<name>(tensor *out__, ...)`: results are written into a
//! caller-supplied array of handle-sized slots. Errors are reported through a
//! thread-local message retrieved with `get_and_reset_last_err`.

use std::ffi::{c_char, c_double, c_int, CStr};
use std::path::Path;

use libloading::Library;

use crate::handle::RawTensor;

// ---------------------------------------------------------------------------
// Entry-point signatures
// ---------------------------------------------------------------------------

type FnLastErr = unsafe extern "C" fn() -> *mut c_char;
type FnFree = unsafe extern "C" fn(RawTensor);
type FnDim = unsafe extern "C" fn(RawTensor) -> usize;
type FnShape = unsafe extern "C" fn(RawTensor, *mut i64);
type FnTensorInt = unsafe extern "C" fn(RawTensor) -> c_int;
type FnIntToInt = unsafe extern "C" fn(c_int) -> c_int;
type FnQueryInt = unsafe extern "C" fn() -> c_int;
type FnSetInt = unsafe extern "C" fn(c_int);
type FnSynchronize = unsafe extern "C" fn(i64);
type FnQueryU64 = unsafe extern "C" fn() -> u64;
type FnVoid = unsafe extern "C" fn();

type FnFactory = unsafe extern "C" fn(
    *mut RawTensor, // out__
    *const i64,     // size_data
    c_int,          // size_len
    c_int,          // options_kind
    c_int,          // options_device
);
type FnUnsqueeze = unsafe extern "C" fn(*mut RawTensor, RawTensor, i64);
type FnLstm = unsafe extern "C" fn(
    *mut RawTensor,  // out__: output, h, c
    RawTensor,       // input
    *const RawTensor, // hx_data
    c_int,           // hx_len
    *const RawTensor, // params_data
    c_int,           // params_len
    c_int,           // has_biases
    i64,             // num_layers
    c_double,        // dropout
    c_int,           // train
    c_int,           // bidirectional
    c_int,           // batch_first
);
type FnGru = unsafe extern "C" fn(
    *mut RawTensor,  // out__: output, h
    RawTensor,       // input
    RawTensor,       // hx
    *const RawTensor, // params_data
    c_int,           // params_len
    c_int,           // has_biases
    i64,             // num_layers
    c_double,        // dropout
    c_int,           // train
    c_int,           // bidirectional
    c_int,           // batch_first
);
type FnLstmCell = unsafe extern "C" fn(
    *mut RawTensor,  // out__: h, c
    RawTensor,       // input
    *const RawTensor, // hx_data
    c_int,           // hx_len
    RawTensor,       // w_ih
    RawTensor,       // w_hh
    RawTensor,       // b_ih (nullable)
    RawTensor,       // b_hh (nullable)
);
type FnGruCell = unsafe extern "C" fn(
    *mut RawTensor, // out__: h
    RawTensor,      // input
    RawTensor,      // hx
    RawTensor,      // w_ih
    RawTensor,      // w_hh
    RawTensor,      // b_ih (nullable)
    RawTensor,      // b_hh (nullable)
);

// ---------------------------------------------------------------------------
// Loaded API table
// ---------------------------------------------------------------------------

/// Function-pointer table for the subset of the C wrapper the bindings use.
///
/// Built either by [`NativeApi::load`] from a shared library, or by hand
/// (the `fake` runtime) with `library: None`.
pub struct NativeApi {
    pub library: Option<Library>,

    pub get_and_reset_last_err: FnLastErr,
    pub at_free: FnFree,
    pub at_dim: FnDim,
    pub at_shape: FnShape,
    pub at_scalar_type: FnTensorInt,
    pub at_device: FnTensorInt,
    pub at_requires_grad: FnTensorInt,
    pub at_grad_set_enabled: FnIntToInt,

    pub atc_cuda_device_count: FnQueryInt,
    pub atc_cuda_is_available: FnQueryInt,
    pub atc_cudnn_is_available: FnQueryInt,
    pub atc_set_benchmark_cudnn: FnSetInt,
    pub atc_synchronize: FnSynchronize,

    pub atc_mps_is_available: FnQueryInt,
    pub atc_mps_current_allocated_memory: FnQueryU64,
    pub atc_mps_empty_cache: FnVoid,
    pub atc_mps_synchronize: FnVoid,

    pub atg_zeros: FnFactory,
    pub atg_randn: FnFactory,
    pub atg_unsqueeze: FnUnsqueeze,
    pub atg_lstm: FnLstm,
    pub atg_gru: FnGru,
    pub atg_lstm_cell: FnLstmCell,
    pub atg_gru_cell: FnGruCell,
}

/// Failure to open the native library or resolve one of its entry points.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to open native library {path}: {source}")]
    Open {
        path: String,
        source: libloading::Error,
    },

    #[error("symbol `{name}` missing from native library: {source}")]
    Symbol {
        name: String,
        source: libloading::Error,
    },
}

fn sym<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, LoadError> {
    // Safety: every caller pairs `name` with the signature declared in torch_api.h.
    match unsafe { lib.get::<T>(name) } {
        Ok(symbol) => Ok(*symbol),
        Err(source) => Err(LoadError::Symbol {
            name: String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned(),
            source,
        }),
    }
}

impl NativeApi {
    /// Open the C wrapper at `path` and resolve every entry point.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| LoadError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(NativeApi {
            get_and_reset_last_err: sym(&lib, b"get_and_reset_last_err\0")?,
            at_free: sym(&lib, b"at_free\0")?,
            at_dim: sym(&lib, b"at_dim\0")?,
            at_shape: sym(&lib, b"at_shape\0")?,
            at_scalar_type: sym(&lib, b"at_scalar_type\0")?,
            at_device: sym(&lib, b"at_device\0")?,
            at_requires_grad: sym(&lib, b"at_requires_grad\0")?,
            at_grad_set_enabled: sym(&lib, b"at_grad_set_enabled\0")?,
            atc_cuda_device_count: sym(&lib, b"atc_cuda_device_count\0")?,
            atc_cuda_is_available: sym(&lib, b"atc_cuda_is_available\0")?,
            atc_cudnn_is_available: sym(&lib, b"atc_cudnn_is_available\0")?,
            atc_set_benchmark_cudnn: sym(&lib, b"atc_set_benchmark_cudnn\0")?,
            atc_synchronize: sym(&lib, b"atc_synchronize\0")?,
            atc_mps_is_available: sym(&lib, b"atc_mps_is_available\0")?,
            atc_mps_current_allocated_memory: sym(&lib, b"atc_mps_current_allocated_memory\0")?,
            atc_mps_empty_cache: sym(&lib, b"atc_mps_empty_cache\0")?,
            atc_mps_synchronize: sym(&lib, b"atc_mps_synchronize\0")?,
            atg_zeros: sym(&lib, b"atg_zeros\0")?,
            atg_randn: sym(&lib, b"atg_randn\0")?,
            atg_unsqueeze: sym(&lib, b"atg_unsqueeze\0")?,
            atg_lstm: sym(&lib, b"atg_lstm\0")?,
            atg_gru: sym(&lib, b"atg_gru\0")?,
            atg_lstm_cell: sym(&lib, b"atg_lstm_cell\0")?,
            atg_gru_cell: sym(&lib, b"atg_gru_cell\0")?,
            library: Some(lib),
        })
    }

    /// Take the pending error message of the calling thread, if any.
    ///
    /// The wrapper hands over a `malloc`ed string; it is copied and freed here.
    pub fn take_last_error(&self) -> Option<String> {
        let ptr = unsafe { (self.get_and_reset_last_err)() };
        if ptr.is_null() {
            return None;
        }
        let message = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { libc::free(ptr.cast()) };
        Some(message)
    }
}

/// Platform file name of the C wrapper library.
pub fn default_library_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "torch_c_api.dll"
    } else if cfg!(target_os = "macos") {
        "libtorch_c_api.dylib"
    } else {
        "libtorch_c_api.so"
    }
}
