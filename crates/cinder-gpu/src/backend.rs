//! Native backend seam.
//!
//! [`DeviceBackend`] is the native function table the core consumes. The
//! Vulkan implementation lives in [`crate::vulkan`]; tests plug in an
//! in-memory fake. Both speak ash's `vk::*` handle types, so everything above
//! this module is backend-agnostic.
//!
//! Handles passed into a backend must have been created by that same backend
//! and not yet destroyed. The core upholds this for every handle it owns.

use std::ptr::NonNull;

use ash::vk;
use bitflags::bitflags;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use crate::error::{GpuError, Result};
use crate::framebuffer::{FramebufferKey, RenderPassKey};

bitflags! {
    /// Portable buffer usage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}

/// Memory affinity of a buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device-local, not reachable from the host.
    GpuOnly,
    /// Host memory the device can read.
    CpuOnly,
    /// Host-visible memory optimized for host writes, device reads.
    CpuToGpu,
    /// Host-visible memory optimized for device writes, host reads.
    GpuToCpu,
}

impl MemoryUsage {
    /// Whether the host can map allocations of this kind.
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

/// Parameters for a native buffer allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryUsage,
    pub label: &'static str,
}

impl BufferDescriptor {
    /// Describe a buffer.
    pub fn new(size: u64, usage: BufferUsage, memory: MemoryUsage) -> Self {
        Self {
            size,
            usage,
            memory,
            label: "buffer",
        }
    }

    /// Describe a transient host-visible staging buffer of `size` bytes.
    pub fn staging(size: u64) -> Self {
        Self {
            size,
            usage: BufferUsage::TRANSFER_SRC,
            memory: MemoryUsage::CpuToGpu,
            label: "staging",
        }
    }
}

/// A queue family as exposed by the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    /// Number of queues the logical device created in this family.
    pub queue_count: u32,
}

/// One batch handed to a native queue submit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitBatch {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// One entry per wait semaphore.
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// One presentation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentRequest {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
}

/// Surface health reported by a present or an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PresentStatus {
    Optimal,
    /// Still presentable, but no longer matches the surface exactly.
    Suboptimal,
    /// The surface changed; the swapchain must be recreated.
    OutOfDate,
}

impl PresentStatus {
    /// The more severe of two statuses.
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether the caller should recreate the swapchain.
    pub fn needs_recreation(self) -> bool {
        self != Self::Optimal
    }
}

/// Result of asking the presentation engine for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Surface properties reported by the device.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Fully resolved swapchain creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub queue_family: u32,
}

/// A render pass instance that clears its single color attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearPass {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub color: [f32; 4],
}

/// Where a presentable surface comes from.
#[derive(Debug, Clone, Copy)]
pub enum SurfaceSource {
    /// A native window.
    Window {
        display: RawDisplayHandle,
        window: RawWindowHandle,
    },
    /// An offscreen surface, for backends that support one.
    Headless,
}

impl SurfaceSource {
    /// Capture the raw handles of a window.
    pub fn from_window<W>(window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        Ok(Self::Window {
            display: display.as_raw(),
            window: window.as_raw(),
        })
    }
}

/// Native function table consumed by the core.
pub trait DeviceBackend: Send + Sync {
    // Queues
    fn queue_families(&self) -> Vec<QueueFamilyInfo>;
    fn queue(&self, family: u32, index: u32) -> vk::Queue;
    /// Not safe to call concurrently for the same `queue`; see [`crate::queue::Queue`].
    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch, fence: vk::Fence) -> Result<()>;
    fn queue_present(&self, queue: vk::Queue, request: &PresentRequest) -> Result<PresentStatus>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    // Synchronization
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn fence_status(&self, fence: vk::Fence) -> Result<bool>;
    /// `Ok(false)` when `timeout_ns` elapses before the fence signals.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Buffers
    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<vk::Buffer>;
    /// Pointer to the start of a host-visible allocation.
    fn map_buffer(&self, buffer: vk::Buffer) -> Result<NonNull<u8>>;
    fn unmap_buffer(&self, buffer: vk::Buffer);
    fn destroy_buffer(&self, buffer: vk::Buffer);

    // Command recording
    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_clear_pass(&self, command_buffer: vk::CommandBuffer, pass: &ClearPass);

    // Surfaces
    fn create_surface(&self, source: &SurfaceSource) -> Result<vk::SurfaceKHR>;
    fn surface_supported(&self, queue_family: u32, surface: vk::SurfaceKHR) -> Result<bool>;
    fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<SurfaceSupport>;
    fn destroy_surface(&self, surface: vk::SurfaceKHR);

    // Swapchains
    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireOutcome>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    // Views and targets
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_render_pass(&self, key: &RenderPassKey) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, key: &FramebufferKey) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_visibility() {
        assert!(!MemoryUsage::GpuOnly.is_host_visible());
        assert!(MemoryUsage::CpuOnly.is_host_visible());
        assert!(MemoryUsage::CpuToGpu.is_host_visible());
        assert!(MemoryUsage::GpuToCpu.is_host_visible());
    }

    #[test]
    fn present_status_severity() {
        assert_eq!(
            PresentStatus::Optimal.combine(PresentStatus::Suboptimal),
            PresentStatus::Suboptimal
        );
        assert_eq!(
            PresentStatus::OutOfDate.combine(PresentStatus::Suboptimal),
            PresentStatus::OutOfDate
        );
        assert!(!PresentStatus::Optimal.needs_recreation());
    }

    #[test]
    fn staging_descriptor_is_host_visible_transfer_source() {
        let desc = BufferDescriptor::staging(1024);
        assert_eq!(desc.size, 1024);
        assert_eq!(desc.usage, BufferUsage::TRANSFER_SRC);
        assert!(desc.memory.is_host_visible());
    }
}
