//! Vulkan instance creation and physical device selection.

use std::ffi::{c_char, CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::error::{GpuError, Result};

/// Lowest API version a physical device must report.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_1;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions needed to create surfaces for `display`.
pub fn required_instance_extensions(display: Option<RawDisplayHandle>) -> Result<Vec<*const c_char>> {
    #[cfg_attr(not(target_os = "macos"), allow(unused_mut))]
    let mut extensions = match display {
        Some(display) => ash_window::enumerate_required_extensions(display)?.to_vec(),
        None => Vec::new(),
    };

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
    }

    Ok(extensions)
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Cinder")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(MIN_API_VERSION);

    let extension_names = required_instance_extensions(display)?;

    let mut layer_names = Vec::new();
    if enable_validation {
        let available_layers = entry.enumerate_instance_layer_properties()?;
        let found = available_layers.iter().any(|props| {
            CStr::from_ptr(props.layer_name.as_ptr()) == VALIDATION_LAYER
        });
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("Validation layer {:?} not available", VALIDATION_LAYER);
        }
    }

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(entry.create_instance(&create_info, None)?)
}

/// Select the best physical device.
///
/// With `presentation` set, only devices exposing `VK_KHR_swapchain` qualify.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    presentation: bool,
) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    let mut best_device = None;
    let mut best_score = -1i64;

    for device in devices {
        if presentation && !supports_extension(instance, device, ash::khr::swapchain::NAME) {
            continue;
        }
        let score = score_physical_device(instance, device);
        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device.ok_or(GpuError::NoSuitableDevice)
}

/// Whether `device` exposes the extension `name`.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn supports_extension(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    name: &CStr,
) -> bool {
    instance
        .enumerate_device_extension_properties(device)
        .unwrap_or_default()
        .iter()
        .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == name)
}

/// Score a physical device for selection. Negative means unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = instance.get_physical_device_properties(device);
    if properties.api_version < MIN_API_VERSION {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // +1 per GB of device-local memory
    let memory = instance.get_physical_device_memory_properties(device);
    score += super::adapter::device_local_memory_mb(&memory) as i64 / 1024;

    score
}
