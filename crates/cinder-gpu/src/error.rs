//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// `Clone` so a single failed construction can be reported to every thread
/// waiting on the same cache slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Native call rejected by the driver (out of memory, device lost, ...).
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The resource's declared usage forbids the requested operation.
    #[error("Usage mismatch: {0}")]
    UsageMismatch(String),

    /// The resource was torn down before this call.
    #[error("Resource already disposed: {0}")]
    Disposed(&'static str),

    /// No native equivalent for the requested format or enum value.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
