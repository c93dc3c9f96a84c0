//! Command buffer management.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use crate::backend::{ClearPass, DeviceBackend};
use crate::device::Device;
use crate::error::Result;
use crate::queue::RecordedWork;

struct PoolShared {
    backend: Arc<dyn DeviceBackend>,
    pool: Mutex<vk::CommandPool>,
    queue_family: u32,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.backend.destroy_command_pool(*self.pool.get_mut());
    }
}

/// Command pool for one-shot command buffers.
///
/// Native pools are externally synchronized; the pool handle is only reachable
/// through its lock, which a [`CommandRecorder`] holds for its whole lifetime.
#[derive(Clone)]
pub struct CommandPool {
    shared: Arc<PoolShared>,
}

impl CommandPool {
    /// Create a pool for `queue_family`.
    pub fn new(device: &Device, queue_family: u32) -> Result<Self> {
        Self::from_backend(device.backend(), queue_family)
    }

    pub(crate) fn from_backend(backend: &Arc<dyn DeviceBackend>, queue_family: u32) -> Result<Self> {
        let pool = backend.create_command_pool(queue_family)?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                backend: Arc::clone(backend),
                pool: Mutex::new(pool),
                queue_family,
            }),
        })
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.shared.queue_family
    }

    /// Allocate a primary command buffer and begin one-time recording.
    pub fn begin_one_shot(&self) -> Result<CommandRecorder<'_>> {
        let pool = self.shared.pool.lock();
        let backend = &self.shared.backend;

        let command_buffer = backend.allocate_command_buffer(*pool)?;
        if let Err(e) = backend.begin_command_buffer(command_buffer) {
            backend.free_command_buffer(*pool, command_buffer);
            return Err(e);
        }

        Ok(CommandRecorder {
            shared: &self.shared,
            pool,
            command_buffer: Some(command_buffer),
        })
    }
}

impl fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPool")
            .field("queue_family", &self.shared.queue_family)
            .finish_non_exhaustive()
    }
}

/// A command buffer in the recording state.
///
/// Holds the pool lock, and since the guard is not `Send` the recorder never
/// leaves the thread that began recording. Dropping it without calling
/// [`CommandRecorder::finish`] frees the command buffer.
pub struct CommandRecorder<'a> {
    shared: &'a Arc<PoolShared>,
    pool: MutexGuard<'a, vk::CommandPool>,
    command_buffer: Option<vk::CommandBuffer>,
}

impl CommandRecorder<'_> {
    /// Native handle of the buffer being recorded.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.command_buffer.unwrap_or_default()
    }

    /// Record a buffer-to-buffer copy.
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.shared
            .backend
            .cmd_copy_buffer(self.raw(), src, dst, regions);
    }

    /// Record a render pass that only clears its color attachment.
    pub fn clear_pass(&mut self, pass: &ClearPass) {
        self.shared.backend.cmd_clear_pass(self.raw(), pass);
    }

    /// End recording.
    ///
    /// The result may be sent to any thread for submission.
    pub fn finish(mut self) -> Result<RecordedCommands> {
        let command_buffer = self.raw();
        self.shared.backend.end_command_buffer(command_buffer)?;
        self.command_buffer = None;

        Ok(RecordedCommands {
            shared: Arc::clone(self.shared),
            raw: command_buffer,
        })
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        if let Some(command_buffer) = self.command_buffer.take() {
            self.shared
                .backend
                .free_command_buffer(*self.pool, command_buffer);
        }
    }
}

/// A fully recorded one-shot command buffer.
///
/// Freed back to its pool on drop; keep it alive until the submission that
/// uses it has completed. Dropping takes the pool lock, so never drop one
/// while a recorder from the same pool is open on this thread.
pub struct RecordedCommands {
    shared: Arc<PoolShared>,
    raw: vk::CommandBuffer,
}

impl RecordedCommands {
    /// Native handle.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }
}

impl RecordedWork for RecordedCommands {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.raw
    }
}

impl Drop for RecordedCommands {
    fn drop(&mut self) {
        let pool = self.shared.pool.lock();
        self.shared.backend.free_command_buffer(*pool, self.raw);
    }
}

impl fmt::Debug for RecordedCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordedCommands").field(&self.raw).finish()
    }
}
