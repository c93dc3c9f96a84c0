//! Queue families and serialized queue submission.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::backend::{DeviceBackend, PresentRequest, PresentStatus, QueueFamilyInfo, SubmitBatch};
use crate::error::Result;
use crate::sync::{Fence, Semaphore};

/// A recorded command stream that can be handed to [`Queue::submit`].
pub trait RecordedWork {
    /// Native command buffer handle, fully recorded.
    fn raw_command_buffer(&self) -> vk::CommandBuffer;
}

impl RecordedWork for vk::CommandBuffer {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        *self
    }
}

/// A semaphore to wait on before work at `stage` starts.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreWait<'a> {
    pub semaphore: &'a Semaphore,
    pub stage: vk::PipelineStageFlags,
}

impl<'a> SemaphoreWait<'a> {
    /// Wait on `semaphore` before any work starts.
    pub fn all_commands(semaphore: &'a Semaphore) -> Self {
        Self {
            semaphore,
            stage: vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }
}

/// Handle to one hardware queue.
///
/// Native submission to a queue is not thread-safe, so every `submit`,
/// `present` and `wait_idle` goes through a lock owned by the underlying
/// queue. Queues are only built by the [`Device`](crate::Device) registry,
/// once per hardware queue, and handed out as clones sharing that lock; two
/// `Queue`s wrapping the same hardware queue compare equal.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn DeviceBackend>,
    family: u32,
    raw: vk::Queue,
    submission: Arc<Mutex<()>>,
}

impl Queue {
    fn new(backend: Arc<dyn DeviceBackend>, family: u32, raw: vk::Queue) -> Self {
        Self {
            backend,
            family,
            raw,
            submission: Arc::new(Mutex::new(())),
        }
    }

    /// Native handle.
    pub fn raw(&self) -> vk::Queue {
        self.raw
    }

    /// Index of the family this queue belongs to.
    pub fn family_index(&self) -> u32 {
        self.family
    }

    /// Submit one batch of recorded work.
    ///
    /// Work starts after every wait semaphore is signaled; the signal
    /// semaphores and `fence` are signaled once the whole batch completes.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(
        &self,
        work: &[&dyn RecordedWork],
        waits: &[SemaphoreWait<'_>],
        signals: &[&Semaphore],
        fence: Option<&Fence>,
    ) -> Result<()> {
        let batch = SubmitBatch {
            command_buffers: work.iter().map(|w| w.raw_command_buffer()).collect(),
            wait_semaphores: waits.iter().map(|w| w.semaphore.raw()).collect(),
            wait_stages: waits.iter().map(|w| w.stage).collect(),
            signal_semaphores: signals.iter().map(|s| s.raw()).collect(),
        };
        self.submit_batch(&batch, fence.map_or(vk::Fence::null(), Fence::raw))
    }

    /// Submit a pre-built native batch.
    pub fn submit_batch(&self, batch: &SubmitBatch, fence: vk::Fence) -> Result<()> {
        let _submission = self.submission.lock();
        self.backend.queue_submit(self.raw, batch, fence)
    }

    /// Queue a presentation.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&self, request: &PresentRequest) -> Result<PresentStatus> {
        let _submission = self.submission.lock();
        self.backend.queue_present(self.raw, request)
    }

    /// Block until everything submitted to this queue has completed.
    pub fn wait_idle(&self) -> Result<()> {
        let _submission = self.submission.lock();
        self.backend.queue_wait_idle(self.raw)
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Queue {}

impl Hash for Queue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("family", &self.family)
            .field("raw", &self.raw)
            .finish()
    }
}

/// A queue family and the queues created in it.
#[derive(Debug, Clone)]
pub struct QueueFamily {
    pub index: u32,
    pub flags: vk::QueueFlags,
    queue_count: u32,
    queues: Vec<Queue>,
}

impl QueueFamily {
    /// Enumerate the families of a logical device. Queues are not yet populated.
    pub(crate) fn enumerate(backend: &dyn DeviceBackend) -> Vec<Self> {
        backend
            .queue_families()
            .into_iter()
            .map(|QueueFamilyInfo { index, flags, queue_count }| Self {
                index,
                flags,
                queue_count,
                queues: Vec::new(),
            })
            .collect()
    }

    /// Populate every queue of this family. Only the first call has an effect.
    pub(crate) fn initialize_queues(&mut self, backend: &Arc<dyn DeviceBackend>) {
        if !self.queues.is_empty() {
            return;
        }
        self.queues = (0..self.queue_count)
            .map(|i| Queue::new(Arc::clone(backend), self.index, backend.queue(self.index, i)))
            .collect();
    }

    /// Queues of this family.
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Whether the family supports all of `flags`.
    pub fn supports(&self, flags: vk::QueueFlags) -> bool {
        self.flags.contains(flags)
    }
}
