//! Vulkan implementation of [`crate::backend::DeviceBackend`].
//!
//! - Instance creation and adapter selection
//! - Buffer memory via gpu-allocator
//! - Surface and swapchain extension loaders

mod adapter;
mod context;
mod instance;
mod memory;
mod native;

pub use adapter::{AdapterInfo, GpuVendor};
pub use context::{VulkanBackend, VulkanBackendBuilder};
pub use instance::MIN_API_VERSION;
pub use memory::{buffer_usage_flags, memory_location};
