//! The managed tensor.
//!
//! A [`Tensor`] owns exactly one native handle and frees it once, on
//! [`Tensor::release`] or drop. Shape, kind and device are read from the
//! runtime on first use and cached.

use std::cell::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use ember_sys::{NativeApi, NativeHandle, RawTensor};

use crate::device::Device;
use crate::error::EmberError;
use crate::kind::Kind;
use crate::ops::{self, Randn, Unsqueeze, Zeros};
use crate::shape::Shape;
use crate::{grad, runtime, Result};

static LIVE: AtomicUsize = AtomicUsize::new(0);

/// Number of tensors wrapped and not yet released, process-wide.
pub fn live_tensors() -> usize {
    LIVE.load(Ordering::SeqCst)
}

/// Immutable metadata, queried from the runtime on first use.
#[derive(Debug, Clone)]
struct Meta {
    shape: Shape,
    kind: Kind,
    device: Device,
}

/// Exclusive owner of one native tensor.
///
/// The handle is released exactly once: by [`Tensor::release`] or on drop,
/// whichever comes first. After release every accessor returns
/// [`EmberError::Released`].
///
/// `Send` but not `Sync`: a tensor can move to another thread, but two
/// threads never touch the same native tensor through one wrapper.
pub struct Tensor {
    handle: Option<NativeHandle>,
    meta: OnceCell<Meta>,
    grad_mode: bool,
}

impl Tensor {
    /// Take ownership of a handle produced by a native call.
    ///
    /// # Safety
    /// `handle` must refer to a live native tensor not owned by any other
    /// wrapper, and must not be freed by anyone else afterwards.
    pub unsafe fn wrap(handle: NativeHandle) -> Self {
        LIVE.fetch_add(1, Ordering::SeqCst);
        Self {
            handle: Some(handle),
            meta: OnceCell::new(),
            grad_mode: grad::is_enabled(),
        }
    }

    /// Hand the native tensor back to the runtime. Idempotent.
    pub fn release(&mut self) {
        self.release_with(runtime::api());
    }

    /// A leaked handle stays counted in [`live_tensors`].
    fn release_with(&mut self, api: Result<&NativeApi>) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let raw = handle.into_raw();
        match api {
            Ok(api) => {
                unsafe { (api.at_free)(raw) };
                LIVE.fetch_sub(1, Ordering::SeqCst);
                tracing::trace!(handle = ?raw, "released native tensor");
            }
            // Only reachable if the runtime that produced the handle is gone.
            Err(err) => tracing::error!(%err, handle = ?raw, "leaking native tensor, no runtime to free it"),
        }
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    /// Borrow the raw pointer for a native call.
    pub fn as_raw(&self) -> Result<RawTensor> {
        self.handle
            .as_ref()
            .map(NativeHandle::as_raw)
            .ok_or(EmberError::Released)
    }

    fn meta(&self) -> Result<&Meta> {
        if let Some(meta) = self.meta.get() {
            return Ok(meta);
        }
        let raw = self.as_raw()?;
        let api = runtime::api()?;

        let ndim = unsafe { (api.at_dim)(raw) };
        runtime::check(api, "at_dim")?;
        let mut dims = vec![0i64; ndim];
        unsafe { (api.at_shape)(raw, dims.as_mut_ptr()) };
        runtime::check(api, "at_shape")?;

        let code = unsafe { (api.at_scalar_type)(raw) };
        runtime::check(api, "at_scalar_type")?;
        let index = unsafe { (api.at_device)(raw) };
        runtime::check(api, "at_device")?;

        let meta = Meta {
            shape: Shape::new(&dims),
            kind: Kind::from_c_int(code)?,
            device: Device::from_native_index(index),
        };
        Ok(self.meta.get_or_init(|| meta))
    }

    pub fn shape(&self) -> Result<&Shape> {
        Ok(&self.meta()?.shape)
    }

    /// The dimensions as an owned vector.
    pub fn size(&self) -> Result<Vec<i64>> {
        Ok(self.shape()?.to_vec())
    }

    pub fn dim(&self) -> Result<usize> {
        Ok(self.shape()?.ndim())
    }

    pub fn kind(&self) -> Result<Kind> {
        Ok(self.meta()?.kind)
    }

    pub fn device(&self) -> Result<Device> {
        Ok(self.meta()?.device)
    }

    /// Not cached; the flag can change over a tensor's lifetime.
    pub fn requires_grad(&self) -> Result<bool> {
        let raw = self.as_raw()?;
        let api = runtime::api()?;
        let flag = unsafe { (api.at_requires_grad)(raw) };
        runtime::check(api, "at_requires_grad")?;
        Ok(flag != 0)
    }

    /// The ambient gradient mode when this wrapper was created.
    pub fn grad_mode_at_creation(&self) -> bool {
        self.grad_mode
    }

    pub fn zeros(size: &[i64], kind: Kind, device: Device) -> Result<Tensor> {
        let [t] = ops::call::<1, _>(&Zeros { size, kind, device })?;
        Ok(t)
    }

    /// Standard-normal samples.
    pub fn randn(size: &[i64], kind: Kind, device: Device) -> Result<Tensor> {
        let [t] = ops::call::<1, _>(&Randn { size, kind, device })?;
        Ok(t)
    }

    /// Insert a dimension of size one at `dim`. Negative values count from the end.
    pub fn unsqueeze(&self, dim: i64) -> Result<Tensor> {
        let [t] = ops::call::<1, _>(&Unsqueeze { input: self, dim })?;
        Ok(t)
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Tensor");
        match &self.handle {
            Some(handle) => s.field("handle", &handle.as_raw()),
            None => s.field("handle", &"released"),
        };
        if let Some(meta) = self.meta.get() {
            s.field("shape", &meta.shape)
                .field("kind", &meta.kind)
                .field("device", &meta.device);
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_zeros_metadata() {
        crate::test_support::init();
        let t = Tensor::zeros(&[2, 3], Kind::Float, Device::Cpu).unwrap();
        assert_eq!(t.size().unwrap(), vec![2, 3]);
        assert_eq!(t.dim().unwrap(), 2);
        assert_eq!(t.kind().unwrap(), Kind::Float);
        assert_eq!(t.device().unwrap(), Device::Cpu);
        assert!(!t.requires_grad().unwrap());
        // Cached: a second query returns the same reference.
        assert!(std::ptr::eq(t.shape().unwrap(), t.shape().unwrap()));
    }

    #[test]
    #[serial]
    fn test_release_is_idempotent() {
        crate::test_support::init();
        let mut t = Tensor::randn(&[4], Kind::Float, Device::Cpu).unwrap();
        t.release();
        assert!(t.is_released());
        t.release();
        drop(t);
        assert_eq!(ember_sys::fake::double_frees(), 0);
    }

    #[test]
    #[serial]
    fn test_use_after_release_is_an_error() {
        crate::test_support::init();
        let mut t = Tensor::zeros(&[1], Kind::Int64, Device::Cpu).unwrap();
        t.release();
        assert!(matches!(t.as_raw(), Err(EmberError::Released)));
        assert!(matches!(t.size(), Err(EmberError::Released)));
        assert!(matches!(t.unsqueeze(0), Err(EmberError::Released)));
    }

    #[test]
    #[serial]
    fn test_unsqueeze_negative_dim() {
        crate::test_support::init();
        let t = Tensor::zeros(&[5, 2], Kind::Float, Device::Cpu).unwrap();
        assert_eq!(t.unsqueeze(1).unwrap().size().unwrap(), vec![5, 1, 2]);
        assert_eq!(t.unsqueeze(-1).unwrap().size().unwrap(), vec![5, 2, 1]);
        assert!(matches!(t.unsqueeze(4), Err(EmberError::Native { op: "atg_unsqueeze", .. })));
    }

    #[test]
    #[serial]
    fn test_records_grad_mode_at_creation() {
        crate::test_support::init();
        grad::set_enabled(true).unwrap();
        let tracked = Tensor::zeros(&[1], Kind::Float, Device::Cpu).unwrap();
        let untracked = grad::with_disabled(|| Tensor::zeros(&[1], Kind::Float, Device::Cpu)).unwrap();
        assert!(tracked.grad_mode_at_creation());
        assert!(!untracked.grad_mode_at_creation());
    }

    #[test]
    #[serial]
    fn test_leaked_handle_stays_counted() {
        crate::test_support::init();
        let mut t = Tensor::zeros(&[2], Kind::Float, Device::Cpu).unwrap();
        let before = live_tensors();
        let handles = ember_sys::fake::live_handles();
        t.release_with(Err(EmberError::InvalidArgument("no runtime".into())));
        assert!(t.is_released());
        assert_eq!(live_tensors(), before);
        assert_eq!(ember_sys::fake::live_handles(), handles);
        // Nothing left to free on drop.
        drop(t);
        assert_eq!(live_tensors(), before);
    }

    #[test]
    #[serial]
    fn test_live_count_tracks_ownership() {
        crate::test_support::init();
        let before = live_tensors();
        let a = Tensor::zeros(&[3], Kind::Float, Device::Cpu).unwrap();
        let mut b = a.unsqueeze(0).unwrap();
        assert_eq!(live_tensors(), before + 2);
        b.release();
        assert_eq!(live_tensors(), before + 1);
        drop(a);
        assert_eq!(live_tensors(), before);
    }
}
