//! Device buffers and the host-to-device upload protocol.
//!
//! [`Buffer::sub_data`] writes through a host mapping whenever the buffer's
//! memory is host-visible. Otherwise it goes through a transient staging
//! buffer and a one-shot copy submitted on the device's work queue, gated by
//! a fence the buffer keeps for reuse across uploads.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::backend::{BufferDescriptor, BufferUsage, MemoryUsage};
use crate::command::RecordedCommands;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::sync::Fence;
use crate::task::Pending;

/// A device buffer that exclusively owns its memory allocation.
pub struct Buffer {
    device: Arc<Device>,
    raw: vk::Buffer,
    size: u64,
    usage: BufferUsage,
    memory: MemoryUsage,
    /// Reused by staged uploads; empty while an upload has it checked out.
    upload_fence: Mutex<Option<Fence>>,
}

/// A staged copy that has been submitted but may not have completed.
struct StagedUpload {
    fence: Fence,
    // Both must outlive the submission.
    _commands: RecordedCommands,
    _staging: Buffer,
}

impl Buffer {
    /// Allocate a buffer.
    pub fn new(device: &Arc<Device>, desc: &BufferDescriptor) -> Result<Self> {
        let raw = device.backend().create_buffer(desc)?;
        Ok(Self {
            device: Arc::clone(device),
            raw,
            size: desc.size,
            usage: desc.usage,
            memory: desc.memory,
            upload_fence: Mutex::new(None),
        })
    }

    /// Native handle.
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Declared usage.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory affinity; decides whether host mapping is legal.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory
    }

    /// Copy `data` into the buffer at `offset`, blocking until the bytes are
    /// in place.
    pub fn sub_data(&self, data: &[u8], offset: u64) -> Result<()> {
        self.check_range(data.len() as u64, offset)?;
        if data.is_empty() || self.write_direct(data, offset)? {
            return Ok(());
        }

        let upload = self.submit_staged(data, offset)?;
        self.finish_staged(upload)
    }

    /// Typed convenience over [`Self::sub_data`].
    pub fn sub_data_typed<T: bytemuck::Pod>(&self, data: &[T], offset: u64) -> Result<()> {
        self.sub_data(bytemuck::cast_slice(data), offset)
    }

    /// Copy `data` into the buffer at `offset` without waiting for the device.
    ///
    /// Validation, the direct path and the staged submission all happen on
    /// the calling thread; only the wait for completion, and the release of
    /// the staging buffer after it, move to a background thread.
    pub fn sub_data_async(self: &Arc<Self>, data: &[u8], offset: u64) -> Result<Pending<()>> {
        self.check_range(data.len() as u64, offset)?;
        if data.is_empty() || self.write_direct(data, offset)? {
            return Ok(Pending::ready(Ok(())));
        }

        let upload = self.submit_staged(data, offset)?;
        let buffer = Arc::clone(self);
        Ok(Pending::spawn("cinder-upload", move || {
            buffer.finish_staged(upload)
        }))
    }

    fn check_range(&self, len: u64, offset: u64) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "Data range {offset}..{end} exceeds buffer size {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Map, copy, unmap. `Ok(false)` when the memory is not host-visible.
    fn write_direct(&self, data: &[u8], offset: u64) -> Result<bool> {
        if !self.memory.is_host_visible() {
            return Ok(false);
        }

        let backend = self.device.backend();
        let ptr = backend.map_buffer(self.raw)?;
        // SAFETY: the mapping covers the whole buffer and check_range
        // guaranteed offset + len <= size.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        backend.unmap_buffer(self.raw);
        Ok(true)
    }

    fn submit_staged(&self, data: &[u8], offset: u64) -> Result<StagedUpload> {
        if !self.usage.contains(BufferUsage::TRANSFER_DST) {
            return Err(GpuError::UsageMismatch(format!(
                "Staged upload needs TRANSFER_DST, buffer usage is {:?}",
                self.usage
            )));
        }

        let size = data.len() as u64;
        tracing::debug!("Staging {size} bytes into buffer {:?} at offset {offset}", self.raw);

        let staging = Self::new(&self.device, &BufferDescriptor::staging(size))?;
        if !staging.write_direct(data, 0)? {
            return Err(GpuError::InvalidState(
                "Staging buffer is not host-visible".to_string(),
            ));
        }

        let mut recorder = self.device.transfer_pool().begin_one_shot()?;
        recorder.copy_buffer(
            staging.raw,
            self.raw,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size,
            }],
        );
        let commands = recorder.finish()?;

        let fence = self.checkout_fence()?;
        let submitted = self
            .device
            .work_queue()
            .submit(&[&commands], &[], &[], Some(&fence));
        if let Err(e) = submitted {
            self.return_fence(fence);
            return Err(e);
        }

        Ok(StagedUpload {
            fence,
            _commands: commands,
            _staging: staging,
        })
    }

    fn finish_staged(&self, upload: StagedUpload) -> Result<()> {
        if let Err(e) = upload.fence.wait(Fence::WAIT_INFINITE) {
            // The copy may still be running; idle before the staging buffer goes.
            tracing::error!("Upload fence wait failed on buffer {:?}: {e}", self.raw);
            if let Err(idle) = self.device.wait_idle() {
                tracing::error!("Device idle after failed upload wait also failed: {idle}");
            }
            return Err(e);
        }
        let StagedUpload {
            fence,
            _commands,
            _staging,
        } = upload;
        self.return_fence(fence);
        Ok(())
    }

    /// Take the buffer's upload fence, unsignaled, creating it on first use.
    fn checkout_fence(&self) -> Result<Fence> {
        let cached = self.upload_fence.lock().take();
        match cached {
            Some(fence) => {
                fence.reset()?;
                Ok(fence)
            }
            None => Fence::new(&self.device, false),
        }
    }

    fn return_fence(&self, fence: Fence) {
        let mut slot = self.upload_fence.lock();
        if slot.is_none() {
            *slot = Some(fence);
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.backend().destroy_buffer(self.raw);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}
