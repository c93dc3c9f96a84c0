//! [`DeviceBackend`] over ash.
//!
//! Every method forwards to one native call. Handles arriving here were
//! created by this backend and are still alive; the core's ownership types
//! guarantee that, which is what makes the `unsafe` blocks sound.

use std::ptr::NonNull;

use ash::vk;

use super::context::VulkanBackend;
use crate::backend::{
    AcquireOutcome, BufferDescriptor, ClearPass, DeviceBackend, PresentRequest, PresentStatus,
    QueueFamilyInfo, SubmitBatch, SurfaceSource, SurfaceSupport, SwapchainCreateInfo,
};
use crate::error::{GpuError, Result};
use crate::framebuffer::{FramebufferKey, RenderPassKey};

impl DeviceBackend for VulkanBackend {
    fn queue_families(&self) -> Vec<QueueFamilyInfo> {
        self.queue_families.clone()
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, index) }
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch, fence: vk::Fence) -> Result<()> {
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&batch.wait_semaphores)
            .wait_dst_stage_mask(&batch.wait_stages)
            .command_buffers(&batch.command_buffers)
            .signal_semaphores(&batch.signal_semaphores);

        unsafe { self.device.queue_submit(queue, &[submit], fence)? };
        Ok(())
    }

    fn queue_present(&self, queue: vk::Queue, request: &PresentRequest) -> Result<PresentStatus> {
        let loader = self.swapchain_loader()?;
        let swapchains = [request.swapchain];
        let image_indices = [request.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&request.wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        unsafe { self.device.queue_wait_idle(queue)? };
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<vk::Buffer> {
        self.memory.create_buffer(desc)
    }

    fn map_buffer(&self, buffer: vk::Buffer) -> Result<NonNull<u8>> {
        self.memory.mapped_ptr(buffer)
    }

    fn unmap_buffer(&self, _buffer: vk::Buffer) {
        // Host-visible allocations stay persistently mapped
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.memory.free_buffer(buffer);
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("Driver returned no command buffer".to_string()))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    fn cmd_clear_pass(&self, command_buffer: vk::CommandBuffer, pass: &ClearPass) {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: pass.color,
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(pass.render_pass)
            .framebuffer(pass.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: pass.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
            self.device.cmd_end_render_pass(command_buffer);
        }
    }

    fn create_surface(&self, source: &SurfaceSource) -> Result<vk::SurfaceKHR> {
        self.surface_loader()?;
        match *source {
            SurfaceSource::Window { display, window } => unsafe {
                ash_window::create_surface(&self.entry, &self.instance, display, window, None)
                    .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
            },
            SurfaceSource::Headless => Err(GpuError::ExtensionNotSupported(
                "VK_EXT_headless_surface".to_string(),
            )),
        }
    }

    fn surface_supported(&self, queue_family: u32, surface: vk::SurfaceKHR) -> Result<bool> {
        let loader = self.surface_loader()?;
        Ok(unsafe {
            loader.get_physical_device_surface_support(self.physical_device, queue_family, surface)?
        })
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        let loader = self.surface_loader()?;
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader
                    .get_physical_device_surface_capabilities(self.physical_device, surface)?,
                formats: loader.get_physical_device_surface_formats(self.physical_device, surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(self.physical_device, surface)?,
            })
        }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        if let Some(loader) = &self.surface_loader {
            unsafe { loader.destroy_surface(surface, None) };
        }
    }

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<vk::SwapchainKHR> {
        let loader = self.swapchain_loader()?;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(info.surface)
            .min_image_count(info.min_image_count)
            .image_format(info.format.format)
            .image_color_space(info.format.color_space)
            .image_extent(info.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(info.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(info.present_mode)
            .clipped(true);

        Ok(unsafe { loader.create_swapchain(&create_info, None)? })
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let loader = self.swapchain_loader()?;
        Ok(unsafe { loader.get_swapchain_images(swapchain)? })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireOutcome> {
        let loader = self.swapchain_loader()?;
        match unsafe { loader.acquire_next_image(swapchain, timeout_ns, semaphore, fence) } {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            // No image was acquired; the swapchain must be recreated.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = &self.swapchain_loader {
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        Ok(unsafe { self.device.create_image_view(&view_info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_render_pass(&self, key: &RenderPassKey) -> Result<vk::RenderPass> {
        let color_load = if key.clear_color {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };

        let mut attachments: Vec<vk::AttachmentDescription> = key
            .color_formats
            .iter()
            .map(|&format| {
                vk::AttachmentDescription::default()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(color_load)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(key.final_layout)
            })
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..attachments.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();

        let depth_ref = key.depth_format.map(|format| {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
            vk::AttachmentReference {
                attachment: attachments.len() as u32 - 1,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = &depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));

        Ok(unsafe { self.device.create_render_pass(&create_info, None)? })
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(&self, key: &FramebufferKey) -> Result<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(key.render_pass)
            .attachments(&key.attachments)
            .width(key.width)
            .height(key.height)
            .layers(key.layers);
        Ok(unsafe { self.device.create_framebuffer(&create_info, None)? })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }
}
