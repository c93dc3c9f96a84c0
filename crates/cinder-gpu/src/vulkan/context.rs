//! Vulkan backend construction and teardown.

use std::ffi::{c_char, CStr};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use super::adapter::AdapterInfo;
use super::instance::{create_instance, select_physical_device, supports_extension};
use super::memory::BufferAllocator;
use crate::backend::QueueFamilyInfo;
use crate::error::{GpuError, Result};

/// Native backend on top of ash.
pub struct VulkanBackend {
    // Entry must be kept alive for the lifetime of the backend
    pub(super) entry: ash::Entry,
    pub(super) instance: ash::Instance,
    pub(super) physical_device: vk::PhysicalDevice,
    pub(super) device: ash::Device,
    pub(super) adapter: AdapterInfo,
    pub(super) queue_families: Vec<QueueFamilyInfo>,
    pub(super) memory: BufferAllocator,
    /// Present only when built for presentation.
    pub(super) surface_loader: Option<ash::khr::surface::Instance>,
    pub(super) swapchain_loader: Option<ash::khr::swapchain::Device>,
}

impl VulkanBackend {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Selected adapter.
    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub(super) fn surface_loader(&self) -> Result<&ash::khr::surface::Instance> {
        self.surface_loader
            .as_ref()
            .ok_or_else(|| GpuError::ExtensionNotSupported("VK_KHR_surface".to_string()))
    }

    pub(super) fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| GpuError::ExtensionNotSupported("VK_KHR_swapchain".to_string()))
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Allocator must go before the device it allocated from
            self.memory.shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for a [`VulkanBackend`].
pub struct VulkanBackendBuilder {
    app_name: String,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
}

impl Default for VulkanBackendBuilder {
    fn default() -> Self {
        Self {
            app_name: "Cinder".to_string(),
            enable_validation: cfg!(debug_assertions),
            display: None,
        }
    }
}

impl VulkanBackendBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Enable presentation to windows on `display`.
    pub fn presentation(mut self, display: RawDisplayHandle) -> Self {
        self.display = Some(display);
        self
    }

    /// Build the backend.
    pub fn build(self) -> Result<VulkanBackend> {
        let presentation = self.display.is_some();

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe {
            create_instance(&entry, &self.app_name, self.enable_validation, self.display)
        }?;

        match unsafe { Self::create_device(&entry, &instance, presentation) } {
            Ok(backend) => Ok(backend),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    /// Everything after the instance. On error the caller destroys the
    /// instance.
    ///
    /// # Safety
    /// The instance must be valid.
    unsafe fn create_device(
        entry: &ash::Entry,
        instance: &ash::Instance,
        presentation: bool,
    ) -> Result<VulkanBackend> {
        let physical_device = select_physical_device(instance, presentation)?;
        let adapter = AdapterInfo::query(instance, physical_device);
        tracing::info!("Selected GPU: {}", adapter.summary());

        let queue_families: Vec<QueueFamilyInfo> = instance
            .get_physical_device_queue_family_properties(physical_device)
            .iter()
            .enumerate()
            .filter(|(_, props)| props.queue_count > 0)
            .map(|(index, props)| QueueFamilyInfo {
                index: index as u32,
                flags: props.queue_flags,
                queue_count: 1,
            })
            .collect();

        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.index)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extensions = device_extensions(instance, physical_device, presentation);
        let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names);

        let device = instance.create_device(physical_device, &device_create_info, None)?;

        let memory = match BufferAllocator::new(instance, &device, physical_device) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_device(None);
                return Err(e);
            }
        };

        let (surface_loader, swapchain_loader) = if presentation {
            (
                Some(ash::khr::surface::Instance::new(entry, instance)),
                Some(ash::khr::swapchain::Device::new(instance, &device)),
            )
        } else {
            (None, None)
        };

        tracing::debug!(
            "Logical device created with {} queue families, presentation {}",
            queue_families.len(),
            presentation
        );

        Ok(VulkanBackend {
            entry: entry.clone(),
            instance: instance.clone(),
            physical_device,
            device,
            adapter,
            queue_families,
            memory,
            surface_loader,
            swapchain_loader,
        })
    }
}

/// Device extensions to enable.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn device_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    presentation: bool,
) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if presentation {
        extensions.push(ash::khr::swapchain::NAME);
    }
    // Required on MoltenVK whenever the driver exposes it
    if supports_extension(instance, physical_device, ash::khr::portability_subset::NAME) {
        extensions.push(ash::khr::portability_subset::NAME);
    }
    extensions
}
