//! Synchronization primitives.

use std::fmt;
use std::sync::Arc;

use ash::vk;

use crate::backend::DeviceBackend;
use crate::device::Device;
use crate::error::Result;

/// Host-waitable completion signal.
///
/// Unsignaled → signaled is driven by the device; signaled → unsignaled only
/// by [`Fence::reset`]. The native object is destroyed on drop.
pub struct Fence {
    backend: Arc<dyn DeviceBackend>,
    raw: vk::Fence,
}

impl Fence {
    /// Timeout meaning "block until signaled".
    pub const WAIT_INFINITE: u64 = u64::MAX;

    /// Create a fence, optionally already signaled.
    pub fn new(device: &Device, signaled: bool) -> Result<Self> {
        Self::from_backend(device.backend(), signaled)
    }

    pub(crate) fn from_backend(backend: &Arc<dyn DeviceBackend>, signaled: bool) -> Result<Self> {
        let raw = backend.create_fence(signaled)?;
        Ok(Self {
            backend: Arc::clone(backend),
            raw,
        })
    }

    /// Native handle.
    pub fn raw(&self) -> vk::Fence {
        self.raw
    }

    /// Non-blocking poll of device completion.
    pub fn signaled(&self) -> Result<bool> {
        self.backend.fence_status(self.raw)
    }

    /// Block until the fence signals or `timeout_ns` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Pass [`Fence::WAIT_INFINITE`] to block
    /// indefinitely.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        self.backend.wait_for_fence(self.raw, timeout_ns)
    }

    /// Return the fence to unsignaled.
    ///
    /// No outstanding submission may still signal this fence.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn reset(&self) -> Result<()> {
        self.backend.reset_fence(self.raw)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.backend.destroy_fence(self.raw);
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fence").field(&self.raw).finish()
    }
}

/// Device-side ordering signal. Only ever passed to submits and presents.
pub struct Semaphore {
    backend: Arc<dyn DeviceBackend>,
    raw: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore.
    pub fn new(device: &Device) -> Result<Self> {
        Self::from_backend(device.backend())
    }

    pub(crate) fn from_backend(backend: &Arc<dyn DeviceBackend>) -> Result<Self> {
        let raw = backend.create_semaphore()?;
        Ok(Self {
            backend: Arc::clone(backend),
            raw,
        })
    }

    /// Native handle.
    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.backend.destroy_semaphore(self.raw);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.raw).finish()
    }
}

/// A fence and its companion semaphore, signaled by the same work.
///
/// The host observes completion through the fence; other device work orders
/// itself after it through the semaphore.
#[derive(Debug)]
pub struct CompletionSignal {
    pub fence: Fence,
    pub semaphore: Semaphore,
}

impl CompletionSignal {
    /// Create an unsignaled pair.
    pub fn new(device: &Device) -> Result<Self> {
        Self::from_backend(device.backend())
    }

    pub(crate) fn from_backend(backend: &Arc<dyn DeviceBackend>) -> Result<Self> {
        Ok(Self {
            fence: Fence::from_backend(backend, false)?,
            semaphore: Semaphore::from_backend(backend)?,
        })
    }
}
