//! The static op table and the single dispatch path for native calls.
//!
//! Each op is a struct holding its inputs and an impl of [`NativeOp<K>`]
//! declaring its arity `K`:
//!
//! | op           | K | outputs              |
//! |--------------|---|----------------------|
//! | [`Zeros`]    | 1 | tensor               |
//! | [`Randn`]    | 1 | tensor               |
//! | [`Unsqueeze`]| 1 | tensor               |
//! | [`GruCell`]  | 1 | hidden               |
//! | [`LstmCell`] | 2 | hidden, cell         |
//! | [`Gru`]      | 2 | output, hidden       |
//! | [`Lstm`]     | 3 | output, hidden, cell |
//!
//! [`call`] is the only code that allocates an [`OutputBuffer`]. Asking for a
//! different number of outputs than the op declares does not compile:
//!
//! ```compile_fail
//! use ember_core::ops::{self, Lstm};
//!
//! fn two_outputs(op: &Lstm<'_>) -> ember_core::Result<()> {
//!     let [_output, _hidden] = ops::call::<2, _>(op)?;
//!     Ok(())
//! }
//! ```

use std::ffi::c_int;
use std::ptr;

use ember_sys::{NativeApi, RawTensor};

use crate::buffer::OutputBuffer;
use crate::device::Device;
use crate::error::EmberError;
use crate::kind::Kind;
use crate::tensor::Tensor;
use crate::{runtime, Result};

/// A native entry point producing exactly `K` tensors.
pub trait NativeOp<const K: usize> {
    /// Entry-point name, used in logs and errors.
    const NAME: &'static str;

    /// Marshal the inputs and invoke the entry point.
    ///
    /// # Safety
    /// `out` must point to `K` writable handle slots.
    unsafe fn invoke(&self, api: &NativeApi, out: *mut RawTensor) -> Result<()>;
}

/// Invoke `op` and take ownership of its `K` outputs, in slot order.
///
/// On native failure no slot is read and no tensor is created. An error
/// left in the slot by an earlier unchecked call is discarded first, so it
/// is never charged to `op`.
pub fn call<const K: usize, O: NativeOp<K>>(op: &O) -> Result<[Tensor; K]> {
    let api = runtime::api()?;
    if let Some(stale) = api.take_last_error() {
        tracing::warn!(op = O::NAME, %stale, "discarding unread native error");
    }
    let mut buffer = OutputBuffer::<K>::new();
    tracing::debug!(op = O::NAME, arity = K, bytes = OutputBuffer::<K>::BYTES, "native call");
    unsafe { op.invoke(api, buffer.as_mut_ptr())? };
    runtime::check(api, O::NAME)?;
    // Safety: the call succeeded, so every written slot is a fresh handle.
    Ok(unsafe { buffer.into_tensors() })
}

fn len_c_int(what: &str, len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| EmberError::InvalidArgument(format!("{what} length {len} exceeds C int")))
}

fn raw_all(tensors: &[Tensor]) -> Result<Vec<RawTensor>> {
    tensors.iter().map(Tensor::as_raw).collect()
}

fn raw_opt(tensor: Option<&Tensor>) -> Result<RawTensor> {
    tensor.map_or(Ok(ptr::null_mut()), Tensor::as_raw)
}

pub struct Zeros<'a> {
    pub size: &'a [i64],
    pub kind: Kind,
    pub device: Device,
}

impl NativeOp<1> for Zeros<'_> {
    const NAME: &'static str = "atg_zeros";

    unsafe fn invoke(&self, api: &NativeApi, out: *mut RawTensor) -> Result<()> {
        let len = len_c_int("size", self.size.len())?;
        (api.atg_zeros)(out, self.size.as_ptr(), len, self.kind.c_int(), self.device.to_native_index());
        Ok(())
    }
}

pub struct Randn<'a> {
    pub size: &'a [i64],
    pub kind: Kind,
    pub device: Device,
}

impl NativeOp<1> for Randn<'_> {
    const NAME: &'static str = "atg_randn";

    unsafe fn invoke(&self, api: &NativeApi, out: *mut RawTensor) -> Result<()> {
        let len = len_c_int("size", self.size.len())?;
        (api.atg_randn)(out, self.size.as_ptr(), len, self.kind.c_int(), self.device.to_native_index());
        Ok(())
    }
}

pub struct Unsqueeze<'a> {
    pub input: &'a Tensor,
    pub dim: i64,
}

impl NativeOp<1> for Unsqueeze<'_> {
    const NAME: &'static str = "atg_unsqueeze";

    unsafe fn invoke(&self, api: &NativeApi, out: *mut RawTensor) -> Result<()> {
        (api.atg_unsqueeze)(out, self.input.as_raw()?, self.dim);
        Ok(())
    }
}

/// Scalar options shared by the fused recurrent entry points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RnnFlags {
    pub has_biases: bool,
    pub num_layers: i64,
    pub dropout: f64,
    pub train: bool,
    pub bidirectional: bool,
    pub batch_first: bool,
}

/// Whole-sequence LSTM: output, final hidden, final cell.
pub struct Lstm<'a> {
    pub input: &'a Tensor,
    pub hx: [&'a Tensor; 2],
    pub params: &'a [Tensor],
    pub flags: RnnFlags,
}

impl NativeOp<3> for Lstm<'_> {
    const NAME: &'static str = "atg_lstm";

    unsafe fn invoke(&self, api: &NativeApi, out: *mut RawTensor) -> Result<()> {
        let hx = [self.hx[0].as_raw()?, self.hx[1].as_raw()?];
        let params = raw_all(self.params)?;
        let f = self.flags;
        (api.atg_lstm)(
            out,
            self.input.as_raw()?,
            hx.as_ptr(),
            2,
            params.as_ptr(),
            len_c_int("params", params.len())?,
            c_int::from(f.has_biases),
            f.num_layers,
            f.dropout,
            c_int::from(f.train),
            c_int::from(f.bidirectional),
            c_int::from(f.batch_first),
        );
        Ok(())
    }
}

/// Whole-sequence GRU: output, final hidden.
pub struct Gru<'a> {
    pub input: &'a Tensor,
    pub hx: &'a Tensor,
    pub params: &'a [Tensor],
    pub flags: RnnFlags,
}

impl NativeOp<2> for Gru<'_> {
    const NAME: &'static str = "atg_gru";

    unsafe fn invoke(&self, api: &NativeApi, out: *mut RawTensor) -> Result<()> {
        let params = raw_all(self.params)?;
        let f = self.flags;
        (api.atg_gru)(
            out,
            self.input.as_raw()?,
            self.hx.as_raw()?,
            params.as_ptr(),
            len_c_int("params", params.len())?,
            c_int::from(f.has_biases),
            f.num_layers,
            f.dropout,
            c_int::from(f.train),
            c_int::from(f.bidirectional),
            c_int::from(f.batch_first),
        );
        Ok(())
    }
}

/// One LSTM time step over `[batch, input]`: hidden, cell.
pub struct LstmCell<'a> {
    pub input: &'a Tensor,
    pub hx: [&'a Tensor; 2],
    pub w_ih: &'a Tensor,
    pub w_hh: &'a Tensor,
    pub b_ih: Option<&'a Tensor>,
    pub b_hh: Option<&'a Tensor>,
}

impl NativeOp<2> for LstmCell<'_> {
    const NAME: &'static str = "atg_lstm_cell";

    unsafe fn invoke(&self, api: &NativeApi, out: *mut RawTensor) -> Result<()> {
        let hx = [self.hx[0].as_raw()?, self.hx[1].as_raw()?];
        (api.atg_lstm_cell)(
            out,
            self.input.as_raw()?,
            hx.as_ptr(),
            2,
            self.w_ih.as_raw()?,
            self.w_hh.as_raw()?,
            raw_opt(self.b_ih)?,
            raw_opt(self.b_hh)?,
        );
        Ok(())
    }
}

/// One GRU time step over `[batch, input]`: hidden.
pub struct GruCell<'a> {
    pub input: &'a Tensor,
    pub hx: &'a Tensor,
    pub w_ih: &'a Tensor,
    pub w_hh: &'a Tensor,
    pub b_ih: Option<&'a Tensor>,
    pub b_hh: Option<&'a Tensor>,
}

impl NativeOp<1> for GruCell<'_> {
    const NAME: &'static str = "atg_gru_cell";

    unsafe fn invoke(&self, api: &NativeApi, out: *mut RawTensor) -> Result<()> {
        (api.atg_gru_cell)(
            out,
            self.input.as_raw()?,
            self.hx.as_raw()?,
            self.w_ih.as_raw()?,
            self.w_hh.as_raw()?,
            raw_opt(self.b_ih)?,
            raw_opt(self.b_hh)?,
        );
        Ok(())
    }
}
