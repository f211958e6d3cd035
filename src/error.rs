// error.rs — crate-wide error type.
//
// Every fallible operation in the crate returns `gpuwork::Result<T>`. The
// variants follow the lifecycle of a resource: platform rejection at
// creation, compile/entry-point failures for steps, shape checks for staged
// transfers, and handle misuse after release.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by workers, states, steps and platforms.
#[derive(Debug, Error)]
pub enum Error {
    /// The platform rejected device, context or queue creation, or a device
    /// operation failed at the driver level.
    #[error("device error: {0}")]
    Device(String),

    /// Kernel source failed to compile for one or more devices.
    /// `log` carries the compiler output.
    #[error("kernel source failed to compile:\n{log}")]
    Compile { log: String },

    /// A named kernel source could not be located or read.
    #[error("resource not found: {name}")]
    ResourceNotFound { name: String },

    /// The program compiled but does not provide the requested entry point.
    #[error("kernel entry point `{name}` not found")]
    KernelNotFound { name: String },

    /// A host payload does not match the declared shape of a state.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// A handle was released twice.
    #[error("{kind} handle {id} released twice")]
    DoubleRelease { kind: &'static str, id: u64 },

    /// A handle was used after its release.
    #[error("{kind} handle {id} used after release")]
    UseAfterRelease { kind: &'static str, id: u64 },

    /// A handle that the platform never issued.
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    /// An operation was called in a lifecycle state that does not allow it.
    #[error("`{op}` is not valid while {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A host/device transfer could not complete.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The platform cannot express the requested resource.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub(crate) fn shape(expected: impl ToString, actual: impl ToString) -> Self {
        Error::ShapeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}
