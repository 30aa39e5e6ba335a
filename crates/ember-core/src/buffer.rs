//! Output buffers for multi-output native calls.
//!
//! Every `atg_*` entry point writes its results into caller-supplied
//! handle-sized slots. [`OutputBuffer<K>`] is that storage for an op with
//! arity `K`: the slot count is part of the type, so it comes from the op's
//! declaration and never from arithmetic at the call site.
//!
//! One extra guard slot holding a sentinel sits directly after the `K`
//! slots. An op that writes past its arity overwrites the guard instead of
//! unrelated memory, and [`OutputBuffer::into_tensors`] refuses to continue.

use std::mem::size_of;
use std::ptr;

use ember_sys::{C_tensor, NativeHandle, RawTensor};

use crate::tensor::Tensor;

const GUARD_WORD: usize = 0x0EB0_0EB0;

fn guard_value() -> RawTensor {
    GUARD_WORD as *mut C_tensor
}

#[repr(C)]
pub struct OutputBuffer<const K: usize> {
    slots: [RawTensor; K],
    guard: RawTensor,
}

impl<const K: usize> OutputBuffer<K> {
    const NON_EMPTY: () = assert!(K >= 1, "an output buffer needs at least one slot");

    /// Number of handle slots the native call may write.
    pub const ARITY: usize = K;

    /// Bytes available to the native call, guard excluded.
    pub const BYTES: usize = K * size_of::<RawTensor>();

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_EMPTY;
        Self {
            slots: [ptr::null_mut(); K],
            guard: guard_value(),
        }
    }

    /// Address of slot 0, passed as the `out__` argument.
    ///
    /// Derived from the whole buffer so that a write into the guard slot
    /// stays inside the allocation.
    pub fn as_mut_ptr(&mut self) -> *mut RawTensor {
        (self as *mut Self).cast::<RawTensor>()
    }

    /// Number of slots currently holding a handle.
    pub fn written(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_null()).count()
    }

    /// Transfer every slot to a [`Tensor`], in slot order.
    ///
    /// # Safety
    /// Must only be called after the native call reported success; each
    /// non-null slot must be a fresh handle owned by nobody else.
    ///
    /// # Panics
    /// If the guard was overwritten or any slot is still null. Either way the
    /// op wrote a different number of handles than its declared arity.
    pub unsafe fn into_tensors(self) -> [Tensor; K] {
        if self.guard != guard_value() {
            panic!("native op wrote past its {K} output slot(s)");
        }
        if let Some(slot) = self.slots.iter().position(|slot| slot.is_null()) {
            panic!("native op left output slot {slot} of {K} unwritten");
        }
        let slots = self.slots;
        std::array::from_fn(|i| Tensor::wrap(NativeHandle::from_raw_unchecked(slots[i])))
    }
}

impl<const K: usize> Default for OutputBuffer<K> {
    fn default() -> Self {
        Self::new()
    }
}
