//! In-process stand-in for the libtorch C wrapper.
//!
//! Tensors are modelled by shape, kind and device only; no data is stored.
//! Every entry point follows the wrapper's conventions: results go into the
//! caller's `out__` slots, failures leave the slots untouched and set the
//! thread-local last error.
//!
//! Backend availability and the gradient mode are process-wide, like the real
//! runtime. Failure injection and call counters are per thread so that tests
//! running in parallel do not observe each other.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, c_double, c_int, CString};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::api::NativeApi;
use crate::handle::{C_tensor, RawTensor};

const CPU: c_int = -1;
const MPS: c_int = -2;
const KIND_FLOAT: c_int = 6;

#[derive(Debug, Clone)]
struct FakeTensor {
    shape: Vec<i64>,
    kind: c_int,
    device: c_int,
    requires_grad: bool,
}

static LIVE: OnceLock<Mutex<HashSet<usize>>> = OnceLock::new();
static DOUBLE_FREES: AtomicUsize = AtomicUsize::new(0);
static GRAD_MODE: AtomicBool = AtomicBool::new(true);
static CUDA_DEVICES: AtomicI32 = AtomicI32::new(0);
static CUDNN: AtomicBool = AtomicBool::new(false);
static CUDNN_BENCHMARK: AtomicBool = AtomicBool::new(false);
static MPS_AVAILABLE: AtomicBool = AtomicBool::new(false);
static MPS_ALLOCATED: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static LAST_ERR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static FAIL_NEXT: RefCell<Option<String>> = const { RefCell::new(None) };
    static FAIL_NEXT_QUERY: RefCell<Option<String>> = const { RefCell::new(None) };
    static WRITE_SKEW: Cell<isize> = const { Cell::new(0) };
    static CALLS: RefCell<HashMap<&'static str, usize>> = RefCell::new(HashMap::new());
}

fn live() -> &'static Mutex<HashSet<usize>> {
    LIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

// ---------------------------------------------------------------------------
// Test controls
// ---------------------------------------------------------------------------

/// Build an API table backed by this module.
pub fn api() -> NativeApi {
    NativeApi {
        library: None,
        get_and_reset_last_err,
        at_free,
        at_dim,
        at_shape,
        at_scalar_type,
        at_device,
        at_requires_grad,
        at_grad_set_enabled,
        atc_cuda_device_count,
        atc_cuda_is_available,
        atc_cudnn_is_available,
        atc_set_benchmark_cudnn,
        atc_synchronize,
        atc_mps_is_available,
        atc_mps_current_allocated_memory,
        atc_mps_empty_cache,
        atc_mps_synchronize,
        atg_zeros,
        atg_randn,
        atg_unsqueeze,
        atg_lstm,
        atg_gru,
        atg_lstm_cell,
        atg_gru_cell,
    }
}

/// Number of fake tensors allocated and not yet freed.
pub fn live_handles() -> usize {
    live().lock().len()
}

/// Number of `at_free` calls on pointers that were not live.
pub fn double_frees() -> usize {
    DOUBLE_FREES.load(Ordering::SeqCst)
}

/// The gradient mode as the native side sees it.
pub fn grad_mode() -> bool {
    GRAD_MODE.load(Ordering::SeqCst)
}

/// Number of visible CUDA devices. Zero makes CUDA unavailable.
pub fn set_cuda_devices(count: i32) {
    CUDA_DEVICES.store(count, Ordering::SeqCst);
}

pub fn set_cudnn_available(available: bool) {
    CUDNN.store(available, Ordering::SeqCst);
}

pub fn cudnn_benchmark() -> bool {
    CUDNN_BENCHMARK.load(Ordering::SeqCst)
}

pub fn set_mps_available(available: bool) {
    MPS_AVAILABLE.store(available, Ordering::SeqCst);
}

pub fn set_mps_allocated(bytes: u64) {
    MPS_ALLOCATED.store(bytes, Ordering::SeqCst);
}

/// Make the next `atg_*` call on this thread fail with `message`.
pub fn fail_next(message: &str) {
    FAIL_NEXT.with(|f| *f.borrow_mut() = Some(message.to_string()));
}

/// Make the next `atc_*` availability query on this thread raise `message`
/// while still returning its value.
pub fn fail_next_query(message: &str) {
    FAIL_NEXT_QUERY.with(|f| *f.borrow_mut() = Some(message.to_string()));
}

/// Make the next `atg_*` call on this thread leave its last slot unwritten.
pub fn short_write_next() {
    WRITE_SKEW.with(|s| s.set(-1));
}

/// Make the next `atg_*` call on this thread write one slot past its outputs.
pub fn overrun_next() {
    WRITE_SKEW.with(|s| s.set(1));
}

/// Number of times entry point `name` was invoked on this thread.
pub fn calls(name: &str) -> usize {
    CALLS.with(|c| c.borrow().get(name).copied().unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn set_error(message: impl Into<String>) {
    let message = CString::new(message.into().replace('\0', " ")).unwrap_or_default();
    LAST_ERR.with(|e| *e.borrow_mut() = Some(message));
}

/// Record the call and consume any injected failure. Returns false when the
/// call must fail.
fn begin(name: &'static str) -> bool {
    CALLS.with(|c| *c.borrow_mut().entry(name).or_insert(0) += 1);
    match FAIL_NEXT.with(|f| f.borrow_mut().take()) {
        Some(message) => {
            set_error(message);
            false
        }
        None => true,
    }
}

/// Queries report through the error slot without failing outright.
fn query(name: &'static str) {
    CALLS.with(|c| *c.borrow_mut().entry(name).or_insert(0) += 1);
    if let Some(message) = FAIL_NEXT_QUERY.with(|f| f.borrow_mut().take()) {
        set_error(message);
    }
}

fn alloc(tensor: FakeTensor) -> RawTensor {
    let ptr = Box::into_raw(Box::new(tensor));
    live().lock().insert(ptr as usize);
    ptr.cast::<C_tensor>()
}

unsafe fn tensor<'a>(raw: RawTensor) -> Result<&'a FakeTensor, String> {
    if raw.is_null() {
        return Err("null tensor".to_string());
    }
    if !live().lock().contains(&(raw as usize)) {
        return Err("use of a freed tensor".to_string());
    }
    Ok(&*raw.cast::<FakeTensor>())
}

unsafe fn finish(out: *mut RawTensor, result: Result<Vec<FakeTensor>, String>) {
    let outputs = match result {
        Ok(outputs) => outputs,
        Err(message) => {
            WRITE_SKEW.with(|s| s.set(0));
            set_error(message);
            return;
        }
    };
    let skew = WRITE_SKEW.with(|s| s.replace(0));
    let count = outputs.len();
    for (i, t) in outputs.into_iter().enumerate() {
        if skew < 0 && i + 1 == count {
            break;
        }
        *out.add(i) = alloc(t);
    }
    if skew > 0 {
        *out.add(count) = NonNull::<C_tensor>::dangling().as_ptr();
    }
}

fn check_device(device: c_int) -> Result<(), String> {
    match device {
        CPU => Ok(()),
        MPS if MPS_AVAILABLE.load(Ordering::SeqCst) => Ok(()),
        MPS => Err("MPS backend is not available".to_string()),
        d if d >= 0 && d < CUDA_DEVICES.load(Ordering::SeqCst) => Ok(()),
        d => Err(format!("invalid device index {d}")),
    }
}

unsafe fn factory(size_data: *const i64, size_len: c_int, kind: c_int, device: c_int) -> Result<Vec<FakeTensor>, String> {
    if size_len < 0 || (size_data.is_null() && size_len > 0) {
        return Err(format!("invalid size array of length {size_len}"));
    }
    let shape = if size_len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(size_data, size_len as usize).to_vec()
    };
    if let Some(d) = shape.iter().find(|&&d| d < 0) {
        return Err(format!("negative dimension {d}"));
    }
    check_device(device)?;
    Ok(vec![FakeTensor { shape, kind, device, requires_grad: false }])
}

fn like(t: &FakeTensor, requires_grad: bool) -> FakeTensor {
    FakeTensor { requires_grad, ..t.clone() }
}

unsafe fn check_params(
    params_data: *const RawTensor,
    params_len: c_int,
    has_biases: c_int,
    num_layers: i64,
    bidirectional: c_int,
) -> Result<bool, String> {
    let dirs = if bidirectional != 0 { 2 } else { 1 };
    let per_layer = if has_biases != 0 { 4 } else { 2 };
    let expected = num_layers * dirs * per_layer;
    if i64::from(params_len) != expected {
        return Err(format!("expected {expected} parameter tensors, got {params_len}"));
    }
    let mut requires_grad = false;
    for &p in std::slice::from_raw_parts(params_data, params_len as usize) {
        requires_grad |= tensor(p)?.requires_grad;
    }
    Ok(requires_grad)
}

unsafe fn rnn_output(
    input: &FakeTensor,
    hx: &FakeTensor,
    num_layers: i64,
    bidirectional: c_int,
    batch_first: c_int,
) -> Result<FakeTensor, String> {
    if input.shape.len() != 3 {
        return Err(format!("input must have 3 dimensions, got {}", input.shape.len()));
    }
    let (batch, seq) = if batch_first != 0 {
        (input.shape[0], input.shape[1])
    } else {
        (input.shape[1], input.shape[0])
    };
    let dirs = if bidirectional != 0 { 2 } else { 1 };
    if hx.shape.len() != 3 || hx.shape[0] != num_layers * dirs || hx.shape[1] != batch {
        return Err(format!(
            "expected hidden size [{}, {batch}, H], got {:?}",
            num_layers * dirs,
            hx.shape
        ));
    }
    let hidden = hx.shape[2] * dirs;
    let shape = if batch_first != 0 {
        vec![batch, seq, hidden]
    } else {
        vec![seq, batch, hidden]
    };
    Ok(FakeTensor { shape, kind: input.kind, device: input.device, requires_grad: false })
}

fn tracks(inputs_require_grad: bool) -> bool {
    inputs_require_grad && GRAD_MODE.load(Ordering::SeqCst)
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

unsafe extern "C" fn get_and_reset_last_err() -> *mut c_char {
    match LAST_ERR.with(|e| e.borrow_mut().take()) {
        Some(message) => libc::strdup(message.as_ptr()),
        None => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn at_free(t: RawTensor) {
    if t.is_null() {
        return;
    }
    if live().lock().remove(&(t as usize)) {
        drop(Box::from_raw(t.cast::<FakeTensor>()));
    } else {
        DOUBLE_FREES.fetch_add(1, Ordering::SeqCst);
    }
}

unsafe extern "C" fn at_dim(t: RawTensor) -> usize {
    match tensor(t) {
        Ok(t) => t.shape.len(),
        Err(message) => {
            set_error(message);
            0
        }
    }
}

unsafe extern "C" fn at_shape(t: RawTensor, dims: *mut i64) {
    match tensor(t) {
        Ok(t) => std::ptr::copy_nonoverlapping(t.shape.as_ptr(), dims, t.shape.len()),
        Err(message) => set_error(message),
    }
}

unsafe extern "C" fn at_scalar_type(t: RawTensor) -> c_int {
    match tensor(t) {
        Ok(t) => t.kind,
        Err(message) => {
            set_error(message);
            -1
        }
    }
}

unsafe extern "C" fn at_device(t: RawTensor) -> c_int {
    match tensor(t) {
        Ok(t) => t.device,
        Err(message) => {
            set_error(message);
            CPU
        }
    }
}

unsafe extern "C" fn at_requires_grad(t: RawTensor) -> c_int {
    match tensor(t) {
        Ok(t) => c_int::from(t.requires_grad),
        Err(message) => {
            set_error(message);
            0
        }
    }
}

unsafe extern "C" fn at_grad_set_enabled(enabled: c_int) -> c_int {
    c_int::from(GRAD_MODE.swap(enabled != 0, Ordering::SeqCst))
}

unsafe extern "C" fn atc_cuda_device_count() -> c_int {
    query("atc_cuda_device_count");
    CUDA_DEVICES.load(Ordering::SeqCst)
}

unsafe extern "C" fn atc_cuda_is_available() -> c_int {
    query("atc_cuda_is_available");
    c_int::from(CUDA_DEVICES.load(Ordering::SeqCst) > 0)
}

unsafe extern "C" fn atc_cudnn_is_available() -> c_int {
    query("atc_cudnn_is_available");
    c_int::from(CUDNN.load(Ordering::SeqCst))
}

unsafe extern "C" fn atc_set_benchmark_cudnn(enabled: c_int) {
    CUDNN_BENCHMARK.store(enabled != 0, Ordering::SeqCst);
}

unsafe extern "C" fn atc_synchronize(device_index: i64) {
    if device_index < 0 || device_index >= i64::from(CUDA_DEVICES.load(Ordering::SeqCst)) {
        set_error(format!("invalid CUDA device index {device_index}"));
    }
}

unsafe extern "C" fn atc_mps_is_available() -> c_int {
    query("atc_mps_is_available");
    c_int::from(MPS_AVAILABLE.load(Ordering::SeqCst))
}

unsafe extern "C" fn atc_mps_current_allocated_memory() -> u64 {
    MPS_ALLOCATED.load(Ordering::SeqCst)
}

unsafe extern "C" fn atc_mps_empty_cache() {
    MPS_ALLOCATED.store(0, Ordering::SeqCst);
}

unsafe extern "C" fn atc_mps_synchronize() {}

unsafe extern "C" fn atg_zeros(out: *mut RawTensor, size_data: *const i64, size_len: c_int, kind: c_int, device: c_int) {
    if !begin("atg_zeros") {
        return;
    }
    finish(out, factory(size_data, size_len, kind, device));
}

unsafe extern "C" fn atg_randn(out: *mut RawTensor, size_data: *const i64, size_len: c_int, kind: c_int, device: c_int) {
    if !begin("atg_randn") {
        return;
    }
    let kind = if kind < 0 { KIND_FLOAT } else { kind };
    finish(out, factory(size_data, size_len, kind, device));
}

unsafe fn unsqueeze(input: RawTensor, dim: i64) -> Result<Vec<FakeTensor>, String> {
    let t = tensor(input)?;
    let rank = t.shape.len() as i64 + 1;
    let d = if dim < 0 { dim + rank } else { dim };
    if !(0..rank).contains(&d) {
        return Err(format!("dimension {dim} out of range for unsqueeze of rank {}", rank - 1));
    }
    let mut shape = t.shape.clone();
    shape.insert(d as usize, 1);
    Ok(vec![FakeTensor { shape, ..like(t, tracks(t.requires_grad)) }])
}

unsafe extern "C" fn atg_unsqueeze(out: *mut RawTensor, input: RawTensor, dim: i64) {
    if !begin("atg_unsqueeze") {
        return;
    }
    finish(out, unsqueeze(input, dim));
}

#[allow(clippy::too_many_arguments)]
unsafe fn lstm(
    input: RawTensor,
    hx_data: *const RawTensor,
    hx_len: c_int,
    params_data: *const RawTensor,
    params_len: c_int,
    has_biases: c_int,
    num_layers: i64,
    bidirectional: c_int,
    batch_first: c_int,
) -> Result<Vec<FakeTensor>, String> {
    let input = tensor(input)?;
    if hx_len != 2 || hx_data.is_null() {
        return Err(format!("lstm expects 2 hidden tensors, got {hx_len}"));
    }
    let hx = std::slice::from_raw_parts(hx_data, 2);
    let (h, c) = (tensor(hx[0])?, tensor(hx[1])?);
    if h.shape != c.shape {
        return Err(format!("hidden {:?} and cell {:?} shapes differ", h.shape, c.shape));
    }
    let params_grad = check_params(params_data, params_len, has_biases, num_layers, bidirectional)?;
    let grad = tracks(params_grad || input.requires_grad || h.requires_grad || c.requires_grad);
    let output = rnn_output(input, h, num_layers, bidirectional, batch_first)?;
    Ok(vec![like(&output, grad), like(h, grad), like(c, grad)])
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn atg_lstm(
    out: *mut RawTensor,
    input: RawTensor,
    hx_data: *const RawTensor,
    hx_len: c_int,
    params_data: *const RawTensor,
    params_len: c_int,
    has_biases: c_int,
    num_layers: i64,
    _dropout: c_double,
    _train: c_int,
    bidirectional: c_int,
    batch_first: c_int,
) {
    if !begin("atg_lstm") {
        return;
    }
    let result = lstm(
        input, hx_data, hx_len, params_data, params_len, has_biases, num_layers, bidirectional, batch_first,
    );
    finish(out, result);
}

#[allow(clippy::too_many_arguments)]
unsafe fn gru(
    input: RawTensor,
    hx: RawTensor,
    params_data: *const RawTensor,
    params_len: c_int,
    has_biases: c_int,
    num_layers: i64,
    bidirectional: c_int,
    batch_first: c_int,
) -> Result<Vec<FakeTensor>, String> {
    let input = tensor(input)?;
    let h = tensor(hx)?;
    let params_grad = check_params(params_data, params_len, has_biases, num_layers, bidirectional)?;
    let grad = tracks(params_grad || input.requires_grad || h.requires_grad);
    let output = rnn_output(input, h, num_layers, bidirectional, batch_first)?;
    Ok(vec![like(&output, grad), like(h, grad)])
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn atg_gru(
    out: *mut RawTensor,
    input: RawTensor,
    hx: RawTensor,
    params_data: *const RawTensor,
    params_len: c_int,
    has_biases: c_int,
    num_layers: i64,
    _dropout: c_double,
    _train: c_int,
    bidirectional: c_int,
    batch_first: c_int,
) {
    if !begin("atg_gru") {
        return;
    }
    let result = gru(input, hx, params_data, params_len, has_biases, num_layers, bidirectional, batch_first);
    finish(out, result);
}

unsafe fn cell_hidden(input: &FakeTensor, hx: &FakeTensor, w_ih: RawTensor, w_hh: RawTensor) -> Result<bool, String> {
    if input.shape.len() != 2 || hx.shape.len() != 2 || input.shape[0] != hx.shape[0] {
        return Err(format!("cell input {:?} does not match hidden {:?}", input.shape, hx.shape));
    }
    Ok(tensor(w_ih)?.requires_grad || tensor(w_hh)?.requires_grad)
}

unsafe fn lstm_cell(
    input: RawTensor,
    hx_data: *const RawTensor,
    hx_len: c_int,
    w_ih: RawTensor,
    w_hh: RawTensor,
) -> Result<Vec<FakeTensor>, String> {
    let input = tensor(input)?;
    if hx_len != 2 || hx_data.is_null() {
        return Err(format!("lstm_cell expects 2 hidden tensors, got {hx_len}"));
    }
    let hx = std::slice::from_raw_parts(hx_data, 2);
    let (h, c) = (tensor(hx[0])?, tensor(hx[1])?);
    let weights_grad = cell_hidden(input, h, w_ih, w_hh)?;
    let grad = tracks(weights_grad || input.requires_grad || h.requires_grad || c.requires_grad);
    Ok(vec![like(h, grad), like(c, grad)])
}

unsafe extern "C" fn atg_lstm_cell(
    out: *mut RawTensor,
    input: RawTensor,
    hx_data: *const RawTensor,
    hx_len: c_int,
    w_ih: RawTensor,
    w_hh: RawTensor,
    _b_ih: RawTensor,
    _b_hh: RawTensor,
) {
    if !begin("atg_lstm_cell") {
        return;
    }
    finish(out, lstm_cell(input, hx_data, hx_len, w_ih, w_hh));
}

unsafe fn gru_cell(input: RawTensor, hx: RawTensor, w_ih: RawTensor, w_hh: RawTensor) -> Result<Vec<FakeTensor>, String> {
    let input = tensor(input)?;
    let h = tensor(hx)?;
    let weights_grad = cell_hidden(input, h, w_ih, w_hh)?;
    Ok(vec![like(h, tracks(weights_grad || input.requires_grad || h.requires_grad))])
}

unsafe extern "C" fn atg_gru_cell(
    out: *mut RawTensor,
    input: RawTensor,
    hx: RawTensor,
    w_ih: RawTensor,
    w_hh: RawTensor,
    _b_ih: RawTensor,
    _b_hh: RawTensor,
) {
    if !begin("atg_gru_cell") {
        return;
    }
    finish(out, gru_cell(input, hx, w_ih, w_hh));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_writes_one_slot() {
        let api = api();
        let mut out = [std::ptr::null_mut(); 1];
        let size = [2i64, 3];
        unsafe { (api.atg_zeros)(out.as_mut_ptr(), size.as_ptr(), 2, KIND_FLOAT, CPU) };
        assert!(api.take_last_error().is_none());
        assert!(!out[0].is_null());
        let mut dims = [0i64; 2];
        unsafe {
            assert_eq!((api.at_dim)(out[0]), 2);
            (api.at_shape)(out[0], dims.as_mut_ptr());
            (api.at_free)(out[0]);
        }
        assert_eq!(dims, [2, 3]);
    }

    #[test]
    fn test_injected_failure_leaves_slots_untouched() {
        let api = api();
        let mut out = [std::ptr::null_mut(); 1];
        let size = [4i64];
        fail_next("boom");
        unsafe { (api.atg_zeros)(out.as_mut_ptr(), size.as_ptr(), 1, KIND_FLOAT, CPU) };
        assert!(out[0].is_null());
        assert_eq!(api.take_last_error().as_deref(), Some("boom"));
        assert!(api.take_last_error().is_none());
    }

    #[test]
    fn test_unavailable_device_is_an_error() {
        let api = api();
        let mut out = [std::ptr::null_mut(); 1];
        let size = [1i64];
        unsafe { (api.atg_zeros)(out.as_mut_ptr(), size.as_ptr(), 1, KIND_FLOAT, 7) };
        assert!(out[0].is_null());
        assert!(api.take_last_error().unwrap().contains("invalid device index 7"));
    }

    #[test]
    fn test_call_counter_is_per_thread() {
        let api = api();
        let mut out = [std::ptr::null_mut(); 1];
        let size = [1i64];
        let before = calls("atg_randn");
        unsafe { (api.atg_randn)(out.as_mut_ptr(), size.as_ptr(), 1, KIND_FLOAT, CPU) };
        assert_eq!(calls("atg_randn"), before + 1);
        std::thread::spawn(|| assert_eq!(calls("atg_randn"), 0)).join().unwrap();
        unsafe { (api.at_free)(out[0]) };
    }
}
