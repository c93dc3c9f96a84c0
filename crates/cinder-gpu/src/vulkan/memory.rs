//! Buffer memory management via gpu-allocator.

use std::ptr::NonNull;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::backend::{BufferDescriptor, BufferUsage, MemoryUsage};
use crate::error::{GpuError, Result};

/// Translate portable usage flags.
pub fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    const TABLE: [(BufferUsage, vk::BufferUsageFlags); 7] = [
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    ];

    TABLE
        .iter()
        .filter(|(portable, _)| usage.contains(*portable))
        .fold(vk::BufferUsageFlags::empty(), |flags, (_, native)| flags | *native)
}

/// Translate memory affinity. There is no host-only location, so `CpuOnly`
/// lands in upload memory.
pub fn memory_location(memory: MemoryUsage) -> MemoryLocation {
    match memory {
        MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
        MemoryUsage::CpuOnly | MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
        MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
    }
}

struct AllocatorState {
    allocator: Option<Allocator>,
    allocations: HashMap<vk::Buffer, Allocation>,
}

/// Buffers and the allocations bound to them.
pub(crate) struct BufferAllocator {
    device: ash::Device,
    state: Mutex<AllocatorState>,
}

impl BufferAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            device: device.clone(),
            state: Mutex::new(AllocatorState {
                allocator: Some(allocator),
                allocations: HashMap::new(),
            }),
        })
    }

    /// Create a buffer and bind fresh memory to it.
    pub fn create_buffer(&self, desc: &BufferDescriptor) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(buffer_usage_flags(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let mut state = self.state.lock();
        let allocated = state
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
            .and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name: desc.label,
                        requirements,
                        location: memory_location(desc.memory),
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| GpuError::AllocationFailed(e.to_string()))
            });
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            if let Some(allocator) = state.allocator.as_mut() {
                let _ = allocator.free(allocation);
            }
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        state.allocations.insert(buffer, allocation);
        Ok(buffer)
    }

    /// Persistent host mapping of a buffer's memory.
    pub fn mapped_ptr(&self, buffer: vk::Buffer) -> Result<NonNull<u8>> {
        self.state
            .lock()
            .allocations
            .get(&buffer)
            .and_then(Allocation::mapped_ptr)
            .map(NonNull::cast)
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))
    }

    /// Destroy a buffer and free its memory.
    pub fn free_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        let AllocatorState {
            allocator,
            allocations,
        } = &mut *state;

        if let (Some(allocation), Some(allocator)) = (allocations.remove(&buffer), allocator.as_mut()) {
            if let Err(e) = allocator.free(allocation) {
                tracing::warn!("Failed to free buffer memory: {e}");
            }
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    /// Free every outstanding buffer and drop the allocator.
    ///
    /// Must run before the device is destroyed.
    pub fn shutdown(&self) {
        let buffers: Vec<_> = self.state.lock().allocations.keys().copied().collect();
        if !buffers.is_empty() {
            tracing::warn!("{} buffers still alive at shutdown", buffers.len());
        }
        for buffer in buffers {
            self.free_buffer(buffer);
        }
        // Dropping the allocator frees its memory blocks
        self.state.lock().allocator.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_translation() {
        let flags = buffer_usage_flags(BufferUsage::VERTEX | BufferUsage::TRANSFER_DST);
        assert_eq!(
            flags,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(buffer_usage_flags(BufferUsage::empty()), vk::BufferUsageFlags::empty());
    }

    #[test]
    fn cpu_only_maps_to_upload_memory() {
        assert_eq!(memory_location(MemoryUsage::CpuOnly), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(MemoryUsage::GpuOnly), MemoryLocation::GpuOnly);
        assert_eq!(memory_location(MemoryUsage::GpuToCpu), MemoryLocation::GpuToCpu);
    }
}
