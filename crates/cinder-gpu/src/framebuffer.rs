//! Cached render passes and framebuffers.
//!
//! Both are immutable once built and fully determined by their creation
//! parameters, so the device shares them through [`ObjectCache`]s keyed by
//! those parameters.

use std::sync::Arc;

use ash::vk;

use crate::backend::DeviceBackend;
use crate::cache::{CachedObjectFactory, ObjectCache};
use crate::error::Result;

/// Everything a render pass depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    /// Clear color attachments on load instead of discarding them.
    pub clear_color: bool,
    /// Layout color attachments are left in.
    pub final_layout: vk::ImageLayout,
}

impl RenderPassKey {
    /// Single cleared color attachment left ready for presentation.
    pub fn presentable(format: vk::Format) -> Self {
        Self {
            color_formats: vec![format],
            depth_format: None,
            clear_color: true,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// Everything a framebuffer depends on: the pass, every attachment and the
/// dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

impl FramebufferKey {
    /// Key for a single-layer framebuffer covering `extent`.
    pub fn new(render_pass: vk::RenderPass, attachments: Vec<vk::ImageView>, extent: vk::Extent2D) -> Self {
        Self {
            render_pass,
            attachments,
            width: extent.width,
            height: extent.height,
            layers: 1,
        }
    }

    /// Dimensions as an extent.
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

/// Builds render passes for [`RenderPassCache`].
pub struct RenderPassFactory {
    backend: Arc<dyn DeviceBackend>,
}

impl RenderPassFactory {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }
}

impl CachedObjectFactory for RenderPassFactory {
    type Key = RenderPassKey;
    type Value = vk::RenderPass;

    fn create_cached(&self, key: &RenderPassKey) -> Result<vk::RenderPass> {
        self.backend.create_render_pass(key)
    }

    fn destroy_cached(&self, _key: &RenderPassKey, value: vk::RenderPass) {
        self.backend.destroy_render_pass(value);
    }
}

/// Builds framebuffers for [`FramebufferCache`].
pub struct FramebufferFactory {
    backend: Arc<dyn DeviceBackend>,
}

impl FramebufferFactory {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }
}

impl CachedObjectFactory for FramebufferFactory {
    type Key = FramebufferKey;
    type Value = vk::Framebuffer;

    fn create_cached(&self, key: &FramebufferKey) -> Result<vk::Framebuffer> {
        self.backend.create_framebuffer(key)
    }

    fn destroy_cached(&self, _key: &FramebufferKey, value: vk::Framebuffer) {
        self.backend.destroy_framebuffer(value);
    }
}

pub type RenderPassCache = ObjectCache<RenderPassFactory>;
pub type FramebufferCache = ObjectCache<FramebufferFactory>;

/// A framebuffer handed out by the device's [`FramebufferCache`].
///
/// Holds one cache reference, given back when the owner releases it. Not
/// `Clone`: each value stands for exactly one reference.
#[derive(Debug, PartialEq, Eq)]
pub struct Framebuffer {
    raw: vk::Framebuffer,
    key: FramebufferKey,
}

impl Framebuffer {
    /// Take a reference on the cached framebuffer for `key`.
    pub fn acquire(cache: &FramebufferCache, key: FramebufferKey) -> Result<Self> {
        let raw = cache.get(&key)?;
        Ok(Self { raw, key })
    }

    /// Give the reference back to `cache`.
    pub fn release(self, cache: &FramebufferCache) {
        cache.release(&self.key);
    }

    /// Native handle.
    pub fn raw(&self) -> vk::Framebuffer {
        self.raw
    }

    /// Render pass this framebuffer is compatible with.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.key.render_pass
    }

    /// Dimensions of the framebuffer.
    pub fn extent(&self) -> vk::Extent2D {
        self.key.extent()
    }

    /// Attachments in binding order.
    pub fn attachments(&self) -> &[vk::ImageView] {
        &self.key.attachments
    }
}
