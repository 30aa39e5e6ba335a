use crate::device::Device;

/// Recoverable failures at the native boundary.
///
/// Defects that mean the foreign-memory contract may already be broken
/// (an invalid device encoding, a buffer written past or short of its arity)
/// are not represented here: they panic.
#[derive(Debug, thiserror::Error)]
pub enum EmberError {
    /// A native entry point reported failure.
    #[error("native op `{op}` failed: {message}")]
    Native { op: &'static str, message: String },

    #[error(transparent)]
    Load(#[from] ember_sys::LoadError),

    #[error("native runtime already initialized")]
    AlreadyInitialized,

    /// The tensor was released and its handle handed back to the runtime.
    #[error("tensor used after release")]
    Released,

    #[error("`{op}` is not supported on {device}")]
    Unsupported { op: &'static str, device: Device },

    #[error("unknown scalar type code {0}")]
    UnknownKind(i32),

    #[error("expected a {expected} recurrent state, got a {found} one")]
    StateMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
