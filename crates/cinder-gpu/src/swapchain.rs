//! Swapchain management.
//!
//! A [`Swapchain`] is Ready once created: an image is already acquired and
//! [`Swapchain::current_index`] is valid. [`Swapchain::present`] presents that
//! image and immediately acquires the next one. [`Swapchain::resize`] tears
//! every per-image object down and rebuilds it against the stored parameters.
//! Recreation after an out-of-date or suboptimal surface is left to the
//! caller, who sees it in the returned [`PresentStatus`].

use std::fmt;
use std::sync::Arc;

use ash::vk;

use crate::backend::{AcquireOutcome, PresentRequest, PresentStatus, SurfaceSource, SwapchainCreateInfo};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::framebuffer::{Framebuffer, FramebufferKey, RenderPassKey};
use crate::queue::Queue;
use crate::sync::{Fence, Semaphore};

/// Preferred color encoding of the presented images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorSpace {
    #[default]
    Srgb,
    Linear,
}

/// Swapchain creation parameters, kept for recreation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDescriptor {
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub vsync: bool,
}

impl SwapchainDescriptor {
    /// sRGB, vsync on.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            color_space: ColorSpace::Srgb,
            vsync: true,
        }
    }

    /// Set the color space preference.
    pub fn with_color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = color_space;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }
}

/// Per-image objects of one native swapchain.
struct SwapchainTargets {
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    render_pass: Option<RenderPassKey>,
    render_pass_raw: vk::RenderPass,
    framebuffers: Vec<Framebuffer>,
    /// Valid between an acquire and the matching present.
    current_index: Option<u32>,
}

enum SwapchainState {
    Ready(SwapchainTargets),
    /// Torn down, waiting for a successful rebuild.
    Invalid,
    Disposed,
}

/// Presentable surface and its rotating images.
pub struct Swapchain {
    device: Arc<Device>,
    descriptor: SwapchainDescriptor,
    surface: vk::SurfaceKHR,
    present_queue: Queue,
    acquire_fence: Fence,
    state: SwapchainState,
}

impl Swapchain {
    /// Create a surface for `source` and a swapchain on it.
    ///
    /// Returns with the first image acquired.
    pub fn new(device: &Arc<Device>, source: &SurfaceSource, descriptor: SwapchainDescriptor) -> Result<Self> {
        let backend = device.backend();
        let surface = backend.create_surface(source)?;

        let parts = device
            .present_queue(surface)
            .and_then(|queue| Ok((queue, Fence::new(device, false)?)));
        let (present_queue, acquire_fence) = match parts {
            Ok(parts) => parts,
            Err(e) => {
                backend.destroy_surface(surface);
                return Err(e);
            }
        };

        let mut swapchain = Self {
            device: Arc::clone(device),
            descriptor,
            surface,
            present_queue,
            acquire_fence,
            state: SwapchainState::Invalid,
        };
        // On failure, Drop releases the surface.
        swapchain.rebuild()?;
        Ok(swapchain)
    }

    /// Parameters the swapchain is (re)built from.
    pub fn descriptor(&self) -> &SwapchainDescriptor {
        &self.descriptor
    }

    /// Queue presentation happens on.
    pub fn present_queue(&self) -> &Queue {
        &self.present_queue
    }

    /// Native surface handle.
    pub fn surface(&self) -> Result<vk::SurfaceKHR> {
        match self.state {
            SwapchainState::Disposed => Err(GpuError::Disposed("swapchain")),
            _ => Ok(self.surface),
        }
    }

    /// Whether the swapchain was disposed.
    pub fn is_disposed(&self) -> bool {
        matches!(self.state, SwapchainState::Disposed)
    }

    /// Index of the image acquired for the next present.
    pub fn current_index(&self) -> Result<u32> {
        self.targets()?
            .current_index
            .ok_or_else(|| GpuError::InvalidState("No swapchain image acquired".to_string()))
    }

    /// Number of images in the swapchain.
    pub fn image_count(&self) -> Result<usize> {
        Ok(self.targets()?.images.len())
    }

    /// Native swapchain handle.
    pub fn handle(&self) -> Result<vk::SwapchainKHR> {
        Ok(self.targets()?.handle)
    }

    /// Image dimensions after clamping to the surface limits.
    pub fn extent(&self) -> Result<vk::Extent2D> {
        Ok(self.targets()?.extent)
    }

    /// Chosen surface format.
    pub fn surface_format(&self) -> Result<vk::SurfaceFormatKHR> {
        Ok(self.targets()?.surface_format)
    }

    /// Chosen present mode.
    pub fn present_mode(&self) -> Result<vk::PresentModeKHR> {
        Ok(self.targets()?.present_mode)
    }

    /// Native swapchain images.
    pub fn images(&self) -> Result<&[vk::Image]> {
        Ok(&self.targets()?.images)
    }

    /// One view per image.
    pub fn views(&self) -> Result<&[vk::ImageView]> {
        Ok(&self.targets()?.views)
    }

    /// Render pass compatible with every framebuffer.
    pub fn render_pass(&self) -> Result<vk::RenderPass> {
        Ok(self.targets()?.render_pass_raw)
    }

    /// One framebuffer per image.
    pub fn framebuffers(&self) -> Result<&[Framebuffer]> {
        Ok(&self.targets()?.framebuffers)
    }

    /// Framebuffer of the acquired image.
    pub fn current_framebuffer(&self) -> Result<&Framebuffer> {
        let index = self.current_index()?;
        Ok(&self.targets()?.framebuffers[index as usize])
    }

    /// Present the acquired image, then acquire the next one.
    ///
    /// The present waits on `wait_semaphores`. The following acquire signals
    /// `signal_semaphore` if given, and blocks on `fence` if given or on an
    /// internal fence otherwise. A caller fence is reset before the acquire,
    /// so no pending submission may still signal it, and is left signaled. When either step reports
    /// [`PresentStatus::OutOfDate`] no image is acquired and the caller must
    /// [`Swapchain::resize`] before presenting again.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(
        &mut self,
        wait_semaphores: &[&Semaphore],
        signal_semaphore: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> Result<PresentStatus> {
        let targets = match &mut self.state {
            SwapchainState::Ready(targets) => targets,
            SwapchainState::Invalid => {
                return Err(GpuError::InvalidState(
                    "Swapchain must be resized before presenting".to_string(),
                ))
            }
            SwapchainState::Disposed => return Err(GpuError::Disposed("swapchain")),
        };
        let image_index = targets
            .current_index
            .take()
            .ok_or_else(|| GpuError::InvalidState("No swapchain image acquired".to_string()))?;

        let status = self.present_queue.present(&PresentRequest {
            wait_semaphores: wait_semaphores.iter().map(|s| s.raw()).collect(),
            swapchain: targets.handle,
            image_index,
        })?;
        if status == PresentStatus::OutOfDate {
            tracing::debug!("Present reported an out-of-date surface");
            return Ok(status);
        }

        let acquired = acquire_next(
            &self.device,
            targets,
            &self.acquire_fence,
            signal_semaphore,
            fence,
        )?;
        Ok(status.combine(acquired))
    }

    /// Rebuild every per-image object at a new size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if self.is_disposed() {
            return Err(GpuError::Disposed("swapchain"));
        }
        self.descriptor.width = width;
        self.descriptor.height = height;

        self.present_queue.wait_idle()?;
        self.device.wait_idle()?;
        self.teardown();
        self.rebuild()
    }

    /// Release every per-image object, the swapchain and the surface.
    ///
    /// Every later call fails with [`GpuError::Disposed`].
    pub fn dispose(&mut self) -> Result<()> {
        if self.is_disposed() {
            return Err(GpuError::Disposed("swapchain"));
        }
        if let Err(e) = self.present_queue.wait_idle() {
            tracing::warn!("Present queue wait failed during swapchain disposal: {e}");
        }
        self.teardown();
        self.device.backend().destroy_surface(self.surface);
        self.state = SwapchainState::Disposed;
        Ok(())
    }

    fn targets(&self) -> Result<&SwapchainTargets> {
        match &self.state {
            SwapchainState::Ready(targets) => Ok(targets),
            SwapchainState::Invalid => Err(GpuError::InvalidState(
                "Swapchain is awaiting recreation".to_string(),
            )),
            SwapchainState::Disposed => Err(GpuError::Disposed("swapchain")),
        }
    }

    /// Ready → Invalid.
    fn teardown(&mut self) {
        if let SwapchainState::Ready(targets) =
            std::mem::replace(&mut self.state, SwapchainState::Invalid)
        {
            targets.destroy(&self.device);
        }
    }

    /// Invalid → Ready, or stays Invalid on error.
    fn rebuild(&mut self) -> Result<()> {
        let backend = self.device.backend();
        let support = backend.surface_support(self.surface)?;
        let caps = &support.capabilities;

        let surface_format = select_surface_format(&support.formats, self.descriptor.color_space)?;
        let present_mode = select_present_mode(
            &support.present_modes,
            self.descriptor.vsync,
            is_mobile_platform(),
        );
        let extent = clamp_extent(caps, self.descriptor.width, self.descriptor.height);
        let min_image_count = desired_image_count(caps);

        let handle = backend
            .create_swapchain(&SwapchainCreateInfo {
                surface: self.surface,
                min_image_count,
                format: surface_format,
                extent,
                present_mode,
                pre_transform: caps.current_transform,
                queue_family: self.present_queue.family_index(),
            })
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let mut targets = SwapchainTargets {
            handle,
            surface_format,
            present_mode,
            extent,
            images: Vec::new(),
            views: Vec::new(),
            render_pass: None,
            render_pass_raw: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            current_index: None,
        };

        if let Err(e) = self.populate(&mut targets) {
            targets.destroy(&self.device);
            return Err(e);
        }

        tracing::info!(
            "Swapchain created: {}x{} ({} images, {:?}, {:?})",
            extent.width,
            extent.height,
            targets.images.len(),
            surface_format.format,
            present_mode
        );
        self.state = SwapchainState::Ready(targets);
        Ok(())
    }

    fn populate(&self, targets: &mut SwapchainTargets) -> Result<()> {
        let backend = self.device.backend();

        targets.images = backend.swapchain_images(targets.handle)?;
        for &image in &targets.images {
            let view = backend.create_image_view(image, targets.surface_format.format)?;
            targets.views.push(view);
        }

        let pass_key = RenderPassKey::presentable(targets.surface_format.format);
        targets.render_pass_raw = self.device.render_passes().get(&pass_key)?;
        targets.render_pass = Some(pass_key);

        for &view in &targets.views {
            let key = FramebufferKey::new(targets.render_pass_raw, vec![view], targets.extent);
            targets
                .framebuffers
                .push(Framebuffer::acquire(self.device.framebuffers(), key)?);
        }

        match acquire_next(&self.device, targets, &self.acquire_fence, None, None)? {
            PresentStatus::OutOfDate => Err(GpuError::SwapchainCreation(
                "Surface went out of date during creation".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl SwapchainTargets {
    fn destroy(self, device: &Device) {
        let backend = device.backend();
        for framebuffer in self.framebuffers {
            framebuffer.release(device.framebuffers());
        }
        if let Some(key) = &self.render_pass {
            device.render_passes().release(key);
        }
        for view in self.views {
            backend.destroy_image_view(view);
        }
        backend.destroy_swapchain(self.handle);
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if !self.is_disposed() {
            let _ = self.dispose();
        }
    }
}

impl fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            SwapchainState::Ready(_) => "ready",
            SwapchainState::Invalid => "invalid",
            SwapchainState::Disposed => "disposed",
        };
        f.debug_struct("Swapchain")
            .field("descriptor", &self.descriptor)
            .field("surface", &self.surface)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

/// Acquire the next image into `targets.current_index`, blocking until it is
/// available.
fn acquire_next(
    device: &Device,
    targets: &mut SwapchainTargets,
    internal_fence: &Fence,
    signal_semaphore: Option<&Semaphore>,
    fence: Option<&Fence>,
) -> Result<PresentStatus> {
    let wait_fence = match fence {
        Some(fence) => {
            fence.reset()?;
            fence
        }
        None => internal_fence,
    };
    let outcome = device.backend().acquire_next_image(
        targets.handle,
        Fence::WAIT_INFINITE,
        signal_semaphore.map_or(vk::Semaphore::null(), Semaphore::raw),
        wait_fence.raw(),
    )?;

    match outcome {
        AcquireOutcome::OutOfDate => {
            tracing::debug!("Acquire reported an out-of-date surface");
            Ok(PresentStatus::OutOfDate)
        }
        AcquireOutcome::Acquired { index, suboptimal } => {
            wait_fence.wait(Fence::WAIT_INFINITE)?;
            if fence.is_none() {
                internal_fence.reset()?;
            }
            targets.current_index = Some(index);
            Ok(if suboptimal {
                PresentStatus::Suboptimal
            } else {
                PresentStatus::Optimal
            })
        }
    }
}

/// Whether the target is a mobile-class platform, where FIFO is forced.
pub fn is_mobile_platform() -> bool {
    cfg!(any(target_os = "android", target_os = "ios"))
}

/// Select the surface format for a color space preference.
///
/// Takes the first exact match and otherwise falls back, with a warning, to
/// the first supported format.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    color_space: ColorSpace,
) -> Result<vk::SurfaceFormatKHR> {
    let preferred: &[vk::Format] = match color_space {
        ColorSpace::Srgb => &[vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB],
        ColorSpace::Linear => &[vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM],
    };

    let exact = available.iter().find(|candidate| {
        candidate.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            && preferred.contains(&candidate.format)
    });
    if let Some(format) = exact {
        return Ok(*format);
    }

    let fallback = available
        .first()
        .copied()
        .ok_or_else(|| GpuError::UnsupportedFormat("Surface reports no formats".to_string()))?;
    tracing::warn!(
        "No {:?} surface format available, falling back to {:?}",
        color_space,
        fallback.format
    );
    Ok(fallback)
}

/// Select the present mode.
///
/// Mailbox when vsync is off, available and not on a mobile platform;
/// FIFO (always supported) otherwise.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool, mobile: bool) -> vk::PresentModeKHR {
    if !vsync && !mobile && available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp the requested size into the surface's supported extent range.
pub fn clamp_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width.max(capabilities.min_image_extent.width),
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height.max(capabilities.min_image_extent.height),
        ),
    }
}

/// One more than the minimum, bounded by the maximum (0 meaning unbounded).
pub fn desired_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(min: (u32, u32), max: (u32, u32), images: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: images.0,
            max_image_count: images.1,
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_preference_picks_first_srgb_format() {
        let available = [
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::B8G8R8A8_SRGB),
        ];
        let chosen = select_surface_format(&available, ColorSpace::Srgb).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn linear_preference_picks_unorm_format() {
        let available = [
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::R8G8B8A8_UNORM),
        ];
        let chosen = select_surface_format(&available, ColorSpace::Linear).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn missing_preference_falls_back_to_first_format() {
        let available = [format(vk::Format::A2B10G10R10_UNORM_PACK32)];
        let chosen = select_surface_format(&available, ColorSpace::Srgb).unwrap();
        assert_eq!(chosen.format, vk::Format::A2B10G10R10_UNORM_PACK32);
    }

    #[test]
    fn no_formats_is_unsupported() {
        assert!(matches!(
            select_surface_format(&[], ColorSpace::Srgb),
            Err(GpuError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn present_mode_selection() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(select_present_mode(&all, false, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(select_present_mode(&all, true, false), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false, true), vk::PresentModeKHR::FIFO);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], false, false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped_to_surface_limits() {
        let caps = caps((64, 64), (1920, 1080), (2, 3));
        assert_eq!(
            clamp_extent(&caps, 4000, 10),
            vk::Extent2D {
                width: 1920,
                height: 64
            }
        );
        assert_eq!(
            clamp_extent(&caps, 800, 600),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(desired_image_count(&caps((1, 1), (8, 8), (2, 3))), 3);
        assert_eq!(desired_image_count(&caps((1, 1), (8, 8), (3, 3))), 3);
        assert_eq!(desired_image_count(&caps((1, 1), (8, 8), (2, 0))), 3);
    }
}
