//! Process-wide selection of the native runtime.
//!
//! Exactly one [`NativeApi`] is active per process. It is either loaded from
//! the C wrapper library ([`init`], or lazily by the first [`api`] call) or
//! installed by the embedder ([`install`]).

use std::path::PathBuf;
use std::sync::OnceLock;

use ember_sys::NativeApi;
use serde::{Deserialize, Serialize};

use crate::error::EmberError;
use crate::Result;

/// Environment variable naming the C wrapper library to load.
pub const LIBRARY_ENV: &str = "EMBER_TORCH_LIB";

static API: OnceLock<NativeApi> = OnceLock::new();

/// Where to find the native runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path (or bare file name, resolved by the dynamic loader) of the C wrapper.
    pub library: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            library: PathBuf::from(ember_sys::default_library_name()),
        }
    }
}

impl RuntimeConfig {
    /// Read `EMBER_TORCH_LIB`, falling back to the platform default name.
    pub fn from_env() -> Self {
        match std::env::var_os(LIBRARY_ENV) {
            Some(path) if !path.is_empty() => Self {
                library: PathBuf::from(path),
            },
            _ => Self::default(),
        }
    }
}

/// Load the runtime described by `config`, unless one is already active.
pub fn init(config: &RuntimeConfig) -> Result<&'static NativeApi> {
    if let Some(api) = API.get() {
        return Ok(api);
    }
    let loaded = NativeApi::load(&config.library)?;
    if API.set(loaded).is_ok() {
        tracing::info!(library = %config.library.display(), "native runtime loaded");
    }
    // Either our table or one installed concurrently; both are valid.
    API.get().ok_or(EmberError::AlreadyInitialized)
}

/// Install a caller-built entry-point table.
pub fn install(api: NativeApi) -> Result<()> {
    API.set(api).map_err(|_| EmberError::AlreadyInitialized)?;
    tracing::debug!("native runtime installed");
    Ok(())
}

/// The active runtime, loading it from the environment on first use.
pub fn api() -> Result<&'static NativeApi> {
    match API.get() {
        Some(api) => Ok(api),
        None => init(&RuntimeConfig::from_env()),
    }
}

/// Whether a runtime has been loaded or installed.
pub fn is_initialized() -> bool {
    API.get().is_some()
}

/// Turn a pending native error on this thread into [`EmberError::Native`].
pub fn check(api: &NativeApi, op: &'static str) -> Result<()> {
    match api.take_last_error() {
        Some(message) => Err(EmberError::Native { op, message }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_names_the_wrapper() {
        let config = RuntimeConfig::default();
        assert!(config.library.to_string_lossy().contains("torch_c_api"));
    }

    #[test]
    fn test_install_twice_is_rejected() {
        crate::test_support::init();
        assert!(is_initialized());
        let err = install(ember_sys::fake::api()).unwrap_err();
        assert!(matches!(err, EmberError::AlreadyInitialized));
    }

    #[test]
    fn test_check_surfaces_native_message() {
        crate::test_support::init();
        let api = api().unwrap();
        ember_sys::fake::fail_next("shape mismatch");
        let mut out = [std::ptr::null_mut(); 1];
        unsafe { (api.atg_zeros)(out.as_mut_ptr(), std::ptr::null(), 0, 6, -1) };
        match check(api, "atg_zeros") {
            Err(EmberError::Native { op, message }) => {
                assert_eq!(op, "atg_zeros");
                assert_eq!(message, "shape mismatch");
            }
            other => panic!("expected native failure, got {other:?}"),
        }
        assert!(check(api, "atg_zeros").is_ok());
    }
}
