//! Gradient-tracking mode.
//!
//! libtorch decides at every allocation whether to record an autograd edge,
//! based on one ambient flag. This module owns the only path that mutates it:
//! [`set_enabled`] swaps the native flag and mirrors the new value locally so
//! tensor creation can read it without crossing the boundary.
//!
//! There is a single ambient mode per process. Callers on different threads
//! must serialize mutations themselves; a lock here could not make nested
//! save/restore on two threads compose anyway. Guards are `!Send` so a scope
//! is always restored on the thread that entered it.

use std::ffi::c_int;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::runtime;
use crate::Result;

static GRAD_ENABLED: AtomicBool = AtomicBool::new(true);

/// Check if gradient tracking is currently enabled.
pub fn is_enabled() -> bool {
    GRAD_ENABLED.load(Ordering::SeqCst)
}

/// Set the gradient mode, returning the mode that was active before.
///
/// The previous value comes from the native runtime, so it is authoritative
/// even if the mode was changed behind this crate's back.
pub fn set_enabled(enabled: bool) -> Result<bool> {
    let api = runtime::api()?;
    let prev = unsafe { (api.at_grad_set_enabled)(c_int::from(enabled)) };
    runtime::check(api, "at_grad_set_enabled")?;
    GRAD_ENABLED.store(enabled, Ordering::SeqCst);
    Ok(prev != 0)
}

/// RAII guard that sets the gradient mode for its scope.
///
/// The mode active at construction is restored on drop, on every exit path
/// including `?` and unwinding.
///
/// # Example
/// ```no_run
/// use ember_core::grad::GradModeGuard;
///
/// # fn main() -> ember_core::Result<()> {
/// {
///     let _guard = GradModeGuard::disable()?;
///     // allocations here build no autograd graph
/// }
/// // previous mode restored
/// # Ok(())
/// # }
/// ```
#[must_use = "the previous mode is restored as soon as the guard is dropped"]
pub struct GradModeGuard {
    prev: bool,
    _not_send: PhantomData<*const ()>,
}

impl GradModeGuard {
    pub fn set(enabled: bool) -> Result<Self> {
        let prev = set_enabled(enabled)?;
        Ok(Self {
            prev,
            _not_send: PhantomData,
        })
    }

    /// Disable gradient tracking for the guard's scope.
    pub fn disable() -> Result<Self> {
        Self::set(false)
    }

    /// Enable gradient tracking for the guard's scope.
    pub fn enable() -> Result<Self> {
        Self::set(true)
    }

    /// The mode that will be restored.
    pub fn previous(&self) -> bool {
        self.prev
    }
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        if let Err(err) = set_enabled(self.prev) {
            tracing::error!(restore = self.prev, %err, "failed to restore gradient mode");
        }
    }
}

/// Run `body` with gradient tracking disabled, then restore the previous mode.
pub fn with_disabled<T, F>(body: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _guard = GradModeGuard::disable()?;
    body()
}

/// Run `body` with gradient tracking enabled, then restore the previous mode.
pub fn with_enabled<T, F>(body: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _guard = GradModeGuard::enable()?;
    body()
}
