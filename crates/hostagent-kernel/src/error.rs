//! Kernel-specific error types.

use hostagent_types::error::PlatformError;
use hostagent_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping PlatformError with boot-time context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped PlatformError.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// The transport failed while the kernel was starting.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
