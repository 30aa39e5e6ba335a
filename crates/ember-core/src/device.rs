//! Compute devices and their runtime queries.
//!
//! [`Device`] maps to the wrapper's integer index: `-1` is the CPU, `-2`
//! is MPS and any ordinal from zero up is a CUDA device.

use std::ffi::c_int;
use std::fmt;
use std::str::FromStr;

use ember_sys::NativeApi;
use serde::{Deserialize, Serialize};

use crate::error::EmberError;
use crate::runtime;
use crate::Result;

const CPU_INDEX: c_int = -1;
const MPS_INDEX: c_int = -2;

/// Compute device for tensor placement.
///
/// The native runtime encodes devices as one integer: `-1` for the CPU, `-2`
/// for Metal (MPS) and a non-negative ordinal for a CUDA device. CPU and
/// `cuda:0` therefore never share an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA GPU with device index
    Cuda(usize),
    /// Apple unified-memory GPU through Metal Performance Shaders
    Mps,
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    pub fn is_mps(&self) -> bool {
        matches!(self, Device::Mps)
    }

    /// Get the CUDA device index, if applicable.
    pub fn cuda_index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            _ => None,
        }
    }

    /// Encode for the native runtime.
    ///
    /// # Panics
    /// If a CUDA ordinal does not fit the native integer width.
    pub fn to_native_index(self) -> c_int {
        match self {
            Device::Cpu => CPU_INDEX,
            Device::Mps => MPS_INDEX,
            Device::Cuda(idx) => match c_int::try_from(idx) {
                Ok(idx) => idx,
                Err(_) => panic!("CUDA ordinal {idx} does not fit the native device encoding"),
            },
        }
    }

    /// Decode a native device index.
    ///
    /// # Panics
    /// On any value below `-2`. Such a value can only come from a defect at
    /// the native boundary, so there is no "unknown device" to return.
    pub fn from_native_index(index: c_int) -> Device {
        match index {
            CPU_INDEX => Device::Cpu,
            MPS_INDEX => Device::Mps,
            // Non-negative, so the cast is lossless.
            idx if idx >= 0 => Device::Cuda(idx as usize),
            other => panic!("invalid native device index {other}"),
        }
    }

    /// Whether the backend is present. Never has side effects.
    ///
    /// Returns `false` for accelerators when the native runtime cannot be
    /// loaded; the CPU is always available.
    pub fn is_available(&self) -> bool {
        match self {
            Device::Cpu => true,
            Device::Cuda(idx) => Cuda::is_available() && *idx < Cuda::device_count(),
            Device::Mps => Mps::is_available(),
        }
    }

    /// CUDA first, then MPS, then the CPU.
    pub fn best_available() -> Device {
        if Cuda::is_available() {
            Device::Cuda(0)
        } else if Mps::is_available() {
            Device::Mps
        } else {
            Device::Cpu
        }
    }

    /// The CUDA device `index`.
    ///
    /// # Panics
    /// If that device is not available.
    pub fn require_cuda(index: usize) -> Device {
        let device = Device::Cuda(index);
        if !device.is_available() {
            panic!("{device} requested but not available ({} CUDA device(s))", Cuda::device_count());
        }
        device
    }

    /// The MPS device.
    ///
    /// # Panics
    /// If MPS is not available.
    pub fn require_mps() -> Device {
        if !Mps::is_available() {
            panic!("mps requested but not available");
        }
        Device::Mps
    }

    /// `cuda:0` when CUDA is available, otherwise the CPU.
    pub fn cuda_if_available() -> Device {
        if Cuda::is_available() {
            Device::Cuda(0)
        } else {
            tracing::warn!("CUDA not available, falling back to cpu");
            Device::Cpu
        }
    }

    /// MPS when available, otherwise the CPU.
    pub fn mps_if_available() -> Device {
        if Mps::is_available() {
            Device::Mps
        } else {
            tracing::warn!("MPS not available, falling back to cpu");
            Device::Cpu
        }
    }

    /// Block until queued work on the device has finished.
    pub fn synchronize(&self) -> Result<()> {
        match self {
            Device::Cuda(idx) => Cuda::synchronize(*idx),
            Device::Mps => Mps::synchronize(),
            Device::Cpu => Err(EmberError::Unsupported {
                op: "synchronize",
                device: *self,
            }),
        }
    }

    /// Return cached allocator memory to the system. MPS only.
    pub fn empty_cache(&self) -> Result<()> {
        match self {
            Device::Mps => Mps::empty_cache(),
            _ => Err(EmberError::Unsupported {
                op: "empty_cache",
                device: *self,
            }),
        }
    }

    /// Bytes currently held by the device allocator. MPS only.
    pub fn current_allocated_memory(&self) -> Result<u64> {
        match self {
            Device::Mps => Mps::current_allocated_memory(),
            _ => Err(EmberError::Unsupported {
                op: "current_allocated_memory",
                device: *self,
            }),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
            Device::Mps => write!(f, "mps"),
        }
    }
}

impl FromStr for Device {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "mps" => Ok(Device::Mps),
            "cuda" => Ok(Device::Cuda(0)),
            _ => s
                .strip_prefix("cuda:")
                .and_then(|idx| idx.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| EmberError::InvalidArgument(format!("unknown device `{s}`"))),
        }
    }
}

/// Run an infallible-looking query and read the error slot after it.
/// `None` without a runtime or when the query raised.
fn query<T>(name: &'static str, f: impl FnOnce(&NativeApi) -> T) -> Option<T> {
    let api = runtime::api().ok()?;
    let value = f(api);
    match api.take_last_error() {
        None => Some(value),
        Some(message) => {
            tracing::warn!(op = name, %message, "native query failed");
            None
        }
    }
}

/// CUDA runtime queries.
pub struct Cuda;

impl Cuda {
    pub fn is_available() -> bool {
        query("atc_cuda_is_available", |api| unsafe { (api.atc_cuda_is_available)() }).is_some_and(|v| v != 0)
    }

    /// Number of visible CUDA devices, zero without a runtime.
    pub fn device_count() -> usize {
        query("atc_cuda_device_count", |api| unsafe { (api.atc_cuda_device_count)() })
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0)
    }

    pub fn cudnn_is_available() -> bool {
        query("atc_cudnn_is_available", |api| unsafe { (api.atc_cudnn_is_available)() }).is_some_and(|v| v != 0)
    }

    /// Let cuDNN benchmark convolution algorithms and cache the fastest.
    pub fn set_cudnn_benchmark(enabled: bool) -> Result<()> {
        let api = runtime::api()?;
        unsafe { (api.atc_set_benchmark_cudnn)(c_int::from(enabled)) };
        runtime::check(api, "atc_set_benchmark_cudnn")
    }

    pub fn synchronize(index: usize) -> Result<()> {
        let api = runtime::api()?;
        let index = i64::try_from(index)
            .map_err(|_| EmberError::InvalidArgument(format!("CUDA ordinal {index} out of range")))?;
        unsafe { (api.atc_synchronize)(index) };
        runtime::check(api, "atc_synchronize")
    }
}

/// Metal Performance Shaders runtime queries.
pub struct Mps;

impl Mps {
    pub fn is_available() -> bool {
        query("atc_mps_is_available", |api| unsafe { (api.atc_mps_is_available)() }).is_some_and(|v| v != 0)
    }

    pub fn current_allocated_memory() -> Result<u64> {
        let api = runtime::api()?;
        let bytes = unsafe { (api.atc_mps_current_allocated_memory)() };
        runtime::check(api, "atc_mps_current_allocated_memory")?;
        Ok(bytes)
    }

    pub fn empty_cache() -> Result<()> {
        let api = runtime::api()?;
        unsafe { (api.atc_mps_empty_cache)() };
        runtime::check(api, "atc_mps_empty_cache")
    }

    pub fn synchronize() -> Result<()> {
        let api = runtime::api()?;
        unsafe { (api.atc_mps_synchronize)() };
        runtime::check(api, "atc_mps_synchronize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_sys::fake;
    use serial_test::serial;

    #[test]
    fn test_device_properties() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_cuda());
        assert!(Device::Cuda(0).is_cuda());
        assert!(Device::Mps.is_mps());
        assert_eq!(Device::Cuda(1).cuda_index(), Some(1));
        assert_eq!(Device::Mps.cuda_index(), None);
    }

    #[test]
    fn test_native_round_trip() {
        for device in [Device::Cpu, Device::Mps, Device::Cuda(0), Device::Cuda(3)] {
            assert_eq!(Device::from_native_index(device.to_native_index()), device);
        }
        assert_ne!(Device::Cpu.to_native_index(), Device::Cuda(0).to_native_index());
    }

    #[test]
    #[should_panic(expected = "invalid native device index -3")]
    fn test_unknown_native_index_is_fatal() {
        Device::from_native_index(-3);
    }

    #[test]
    fn test_display_and_parse() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
        assert_eq!(Device::Mps.to_string(), "mps");
        for device in [Device::Cpu, Device::Mps, Device::Cuda(2)] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    #[serial]
    fn test_cpu_lifecycle_ops_are_unsupported() {
        crate::test_support::init();
        let err = Device::Cpu.empty_cache().unwrap_err();
        assert!(matches!(err, EmberError::Unsupported { op: "empty_cache", device: Device::Cpu }));
        assert_eq!(err.to_string(), "`empty_cache` is not supported on cpu");
        assert!(Device::Cpu.synchronize().is_err());
        assert!(Device::Cuda(0).current_allocated_memory().is_err());
    }

    #[test]
    #[serial]
    fn test_availability_follows_runtime() {
        crate::test_support::init();
        fake::set_cuda_devices(2);
        fake::set_mps_available(true);
        assert!(Device::Cuda(1).is_available());
        assert!(!Device::Cuda(2).is_available());
        assert_eq!(Device::best_available(), Device::Cuda(0));

        fake::set_cuda_devices(0);
        assert_eq!(Device::best_available(), Device::Mps);
        assert_eq!(Device::cuda_if_available(), Device::Cpu);

        fake::set_mps_available(false);
        assert_eq!(Device::best_available(), Device::Cpu);
        assert_eq!(Device::mps_if_available(), Device::Cpu);
        assert!(Device::Cpu.is_available());
    }

    #[test]
    #[serial]
    fn test_mps_memory_queries() {
        crate::test_support::init();
        fake::set_mps_available(true);
        fake::set_mps_allocated(4096);
        assert_eq!(Device::Mps.current_allocated_memory().unwrap(), 4096);
        Device::Mps.empty_cache().unwrap();
        assert_eq!(Device::Mps.current_allocated_memory().unwrap(), 0);
        Device::Mps.synchronize().unwrap();
        fake::set_mps_available(false);
    }

    #[test]
    #[serial]
    fn test_cuda_synchronize_checks_ordinal() {
        crate::test_support::init();
        fake::set_cuda_devices(1);
        Device::Cuda(0).synchronize().unwrap();
        let err = Device::Cuda(4).synchronize().unwrap_err();
        assert!(matches!(err, EmberError::Native { op: "atc_synchronize", .. }));
        Cuda::set_cudnn_benchmark(true).unwrap();
        assert!(fake::cudnn_benchmark());
        Cuda::set_cudnn_benchmark(false).unwrap();
        fake::set_cuda_devices(0);
    }
}
