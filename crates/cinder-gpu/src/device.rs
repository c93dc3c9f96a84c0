//! Device context.
//!
//! A [`Device`] is the explicit context every core object is created from. It
//! owns the queue registry, the transient transfer command pool and the
//! per-device object caches, and tears all of them down when dropped.

use std::fmt;
use std::sync::Arc;

use ash::vk;

use crate::backend::DeviceBackend;
use crate::command::CommandPool;
use crate::error::{GpuError, Result};
use crate::framebuffer::{FramebufferCache, FramebufferFactory, RenderPassCache, RenderPassFactory};
use crate::queue::{Queue, QueueFamily};

/// Logical device context.
pub struct Device {
    backend: Arc<dyn DeviceBackend>,
    queue_families: Vec<QueueFamily>,
    work_queue: Queue,
    transfer_pool: CommandPool,
    framebuffers: Arc<FramebufferCache>,
    render_passes: Arc<RenderPassCache>,
}

impl Device {
    /// Build a device context on top of a native backend.
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Result<Arc<Self>> {
        let mut queue_families = QueueFamily::enumerate(backend.as_ref());
        for family in &mut queue_families {
            family.initialize_queues(&backend);
        }

        let work_queue = [vk::QueueFlags::GRAPHICS, vk::QueueFlags::COMPUTE, vk::QueueFlags::TRANSFER]
            .into_iter()
            .find_map(|flags| first_queue(&queue_families, flags))
            .ok_or(GpuError::NoSuitableDevice)?;

        tracing::debug!(
            "Device context: {} queue families, work queue on family {}",
            queue_families.len(),
            work_queue.family_index()
        );

        let transfer_pool = CommandPool::from_backend(&backend, work_queue.family_index())?;
        let framebuffers = Arc::new(FramebufferCache::new(
            "framebuffers",
            FramebufferFactory::new(Arc::clone(&backend)),
        ));
        let render_passes = Arc::new(RenderPassCache::new(
            "render_passes",
            RenderPassFactory::new(Arc::clone(&backend)),
        ));

        Ok(Arc::new(Self {
            backend,
            queue_families,
            work_queue,
            transfer_pool,
            framebuffers,
            render_passes,
        }))
    }

    /// Native function table.
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Queue families, enumerated once at creation.
    pub fn queue_families(&self) -> &[QueueFamily] {
        &self.queue_families
    }

    /// Queue used for uploads and general work.
    pub fn work_queue(&self) -> &Queue {
        &self.work_queue
    }

    /// First queue whose family supports all of `flags`.
    pub fn find_queue(&self, flags: vk::QueueFlags) -> Option<Queue> {
        first_queue(&self.queue_families, flags)
    }

    /// First queue whose family can present to `surface`.
    pub fn present_queue(&self, surface: vk::SurfaceKHR) -> Result<Queue> {
        for family in &self.queue_families {
            if self.backend.surface_supported(family.index, surface)? {
                if let Some(queue) = family.queues().first() {
                    return Ok(queue.clone());
                }
            }
        }
        Err(GpuError::SurfaceCreation(
            "No queue family can present to this surface".to_string(),
        ))
    }

    /// Pool for one-shot transfer command buffers on the work queue's family.
    pub fn transfer_pool(&self) -> &CommandPool {
        &self.transfer_pool
    }

    /// Framebuffers shared across the device.
    pub fn framebuffers(&self) -> &Arc<FramebufferCache> {
        &self.framebuffers
    }

    /// Render passes shared across the device.
    pub fn render_passes(&self) -> &Arc<RenderPassCache> {
        &self.render_passes
    }

    /// Wait for device to be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        self.backend.wait_idle()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            tracing::warn!("wait_idle failed during device teardown: {e}");
        }
        // Framebuffers reference render passes, so they go first.
        self.framebuffers.clear();
        self.render_passes.clear();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("queue_families", &self.queue_families)
            .field("work_queue", &self.work_queue)
            .finish_non_exhaustive()
    }
}

fn first_queue(families: &[QueueFamily], flags: vk::QueueFlags) -> Option<Queue> {
    families
        .iter()
        .filter(|family| family.supports(flags))
        .find_map(|family| family.queues().first().cloned())
}
