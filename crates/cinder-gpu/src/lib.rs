//! Resource and presentation core for the Cinder graphics layer.
//!
//! This crate provides:
//! - A reference-counted cache for immutable device objects
//! - Fences, semaphores and serialized queue submission
//! - Buffer uploads, direct or through a staging copy
//! - Swapchain creation, presentation and recreation
//! - A Vulkan backend behind the [`DeviceBackend`] seam

pub mod backend;
pub mod buffer;
pub mod cache;
pub mod command;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod queue;
pub mod swapchain;
pub mod sync;
pub mod task;
pub mod vulkan;

pub use backend::{
    AcquireOutcome, BufferDescriptor, BufferUsage, ClearPass, DeviceBackend, MemoryUsage,
    PresentRequest, PresentStatus, QueueFamilyInfo, SubmitBatch, SurfaceSource, SurfaceSupport,
    SwapchainCreateInfo,
};
pub use buffer::Buffer;
pub use cache::{CachedObjectFactory, ObjectCache};
pub use command::{CommandPool, CommandRecorder, RecordedCommands};
pub use device::Device;
pub use error::{GpuError, Result};
pub use framebuffer::{
    Framebuffer, FramebufferCache, FramebufferKey, RenderPassCache, RenderPassKey,
};
pub use queue::{Queue, QueueFamily, RecordedWork, SemaphoreWait};
pub use swapchain::{ColorSpace, Swapchain, SwapchainDescriptor};
pub use sync::{CompletionSignal, Fence, Semaphore};
pub use task::Pending;
pub use vulkan::{AdapterInfo, GpuVendor, VulkanBackend, VulkanBackendBuilder};
