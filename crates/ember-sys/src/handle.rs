use std::ptr::NonNull;

/// Opaque tensor type of the C wrapper (`tensor` in torch_api.h).
#[allow(non_camel_case_types)]
#[repr(C)]
pub struct C_tensor {
    _private: [u8; 0],
}

/// Raw, possibly-null tensor pointer as it crosses the C boundary.
pub type RawTensor = *mut C_tensor;

/// A non-null handle to one tensor resident in native memory.
///
/// Neither `Copy` nor `Clone`: holding a `NativeHandle` is the ownership tag for
/// the native tensor. Releasing it is the owner's job (see `ember_core::Tensor`).
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq)]
pub struct NativeHandle(NonNull<C_tensor>);

// Native tensors are not tied to the thread that created them.
unsafe impl Send for NativeHandle {}

impl NativeHandle {
    /// Claim a raw pointer. Returns `None` for null.
    ///
    /// # Safety
    /// `raw` must be null or point to a live native tensor that no other
    /// `NativeHandle` owns.
    pub unsafe fn from_raw(raw: RawTensor) -> Option<Self> {
        NonNull::new(raw).map(NativeHandle)
    }

    /// # Safety
    /// Same as [`NativeHandle::from_raw`], and `raw` must be non-null.
    pub unsafe fn from_raw_unchecked(raw: RawTensor) -> Self {
        NativeHandle(NonNull::new_unchecked(raw))
    }

    /// Borrow the pointer for a native call. Ownership stays here.
    pub fn as_raw(&self) -> RawTensor {
        self.0.as_ptr()
    }

    /// Give up ownership, returning the pointer for `at_free`.
    pub fn into_raw(self) -> RawTensor {
        self.0.as_ptr()
    }
}
