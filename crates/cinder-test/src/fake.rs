//! In-memory native backend.
//!
//! [`FakeBackend`] implements [`DeviceBackend`] without a GPU. It records every
//! native call, keeps real bytes for every buffer, executes recorded copies
//! when a submission completes and tracks which objects are still alive.
//!
//! Submissions complete immediately by default. With
//! [`FakeBackend::set_auto_complete`] off they stay pending until
//! [`FakeBackend::complete_all`] (or an idle wait) runs them, which lets tests
//! observe work in flight.
//!
//! Binary semaphores and acquire fences are tracked on a collapsed timeline:
//! a semaphore is signaled when the submit or acquire that signals it is
//! made, and unsignaled by the submit or present that waits on it. Signaling
//! an already-signaled semaphore, waiting on an unsignaled one, or acquiring
//! with a signaled fence counts as a sync violation.

use std::ptr::NonNull;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use cinder_gpu::backend::{
    AcquireOutcome, BufferDescriptor, BufferUsage, ClearPass, DeviceBackend, MemoryUsage,
    PresentRequest, PresentStatus, QueueFamilyInfo, SubmitBatch, SurfaceSource, SurfaceSupport,
    SwapchainCreateInfo,
};
use cinder_gpu::framebuffer::{FramebufferKey, RenderPassKey};
use cinder_gpu::{GpuError, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, MutexGuard};

/// One native call as seen by the fake.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    QueueSubmit {
        queue: vk::Queue,
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    QueuePresent {
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: Vec<vk::Semaphore>,
    },
    QueueWaitIdle(vk::Queue),
    DeviceWaitIdle,
    CreateFence { fence: vk::Fence, signaled: bool },
    WaitForFence(vk::Fence),
    ResetFence(vk::Fence),
    DestroyFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateBuffer {
        buffer: vk::Buffer,
        size: u64,
        usage: BufferUsage,
        memory: MemoryUsage,
    },
    MapBuffer(vk::Buffer),
    UnmapBuffer(vk::Buffer),
    DestroyBuffer(vk::Buffer),
    CreateCommandPool { pool: vk::CommandPool, queue_family: u32 },
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandBuffer),
    FreeCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<CopyRegion>,
    },
    ClearPass {
        framebuffer: vk::Framebuffer,
        color: [f32; 4],
    },
    CreateSurface(vk::SurfaceKHR),
    DestroySurface(vk::SurfaceKHR),
    CreateSwapchain {
        swapchain: vk::SwapchainKHR,
        info: SwapchainCreateInfo,
    },
    DestroySwapchain(vk::SwapchainKHR),
    AcquireNextImage {
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    },
    CreateImageView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    CreateRenderPass(vk::RenderPass),
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer {
        framebuffer: vk::Framebuffer,
        width: u32,
        height: u32,
    },
    DestroyFramebuffer(vk::Framebuffer),
}

/// Comparable copy of a `vk::BufferCopy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

impl From<vk::BufferCopy> for CopyRegion {
    fn from(region: vk::BufferCopy) -> Self {
        Self {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        }
    }
}

/// Native calls that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateBuffer,
    QueueSubmit,
    CreateSwapchain,
    CreateFramebuffer,
    CreateRenderPass,
    WaitForFence,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Copy {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    Clear,
}

struct FakeBuffer {
    data: Box<[u8]>,
    memory: MemoryUsage,
}

struct Submission {
    commands: Vec<Command>,
    fence: vk::Fence,
}

struct FakeSwapchain {
    images: Vec<vk::Image>,
    next_image: u32,
}

struct FakeState {
    next_handle: u64,
    calls: Vec<NativeCall>,
    live: HashSet<u64>,
    fences: HashMap<vk::Fence, bool>,
    buffers: HashMap<vk::Buffer, FakeBuffer>,
    recordings: HashMap<vk::CommandBuffer, Vec<Command>>,
    pending: Vec<Submission>,
    swapchains: HashMap<vk::SwapchainKHR, FakeSwapchain>,
    auto_complete: bool,
    queue_delay: Option<Duration>,
    create_delay: Option<Duration>,
    in_flight: HashSet<vk::Queue>,
    queue_violations: usize,
    signaled_semaphores: HashSet<vk::Semaphore>,
    sync_violations: usize,
    surface_support: SurfaceSupport,
    present_families: Option<Vec<u32>>,
    out_of_date_acquires: u32,
    out_of_date_presents: u32,
    suboptimal: bool,
    failures: HashSet<FailPoint>,
}

impl FakeState {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn create<H: Handle>(&mut self) -> H {
        let raw = self.next_raw();
        self.live.insert(raw);
        H::from_raw(raw)
    }

    fn destroy<H: Handle>(&mut self, handle: H) {
        self.live.remove(&handle.as_raw());
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore) {
        if semaphore != vk::Semaphore::null() && !self.signaled_semaphores.insert(semaphore) {
            self.sync_violations += 1;
        }
    }

    fn wait_semaphore(&mut self, semaphore: vk::Semaphore) {
        if !self.signaled_semaphores.remove(&semaphore) {
            self.sync_violations += 1;
        }
    }

    fn take_failure(&mut self, point: FailPoint) -> bool {
        self.failures.remove(&point)
    }

    fn execute(&mut self, submission: Submission) {
        for command in submission.commands {
            if let Command::Copy { src, dst, region } = command {
                let range = |r: vk::BufferCopy, offset: u64| {
                    offset as usize..(offset + r.size) as usize
                };
                let bytes = self
                    .buffers
                    .get(&src)
                    .map(|b| b.data[range(region, region.src_offset)].to_vec());
                if let (Some(bytes), Some(target)) = (bytes, self.buffers.get_mut(&dst)) {
                    target.data[range(region, region.dst_offset)].copy_from_slice(&bytes);
                }
            }
        }
        if submission.fence != vk::Fence::null() {
            self.fences.insert(submission.fence, true);
        }
    }
}

/// Recording, thread-safe stand-in for a GPU.
pub struct FakeBackend {
    queue_families: Vec<QueueFamilyInfo>,
    state: Mutex<FakeState>,
    completed: Condvar,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    /// One universal family with one queue and a dedicated transfer family.
    pub fn new() -> Self {
        Self::with_queue_families(vec![
            QueueFamilyInfo {
                index: 0,
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                queue_count: 1,
            },
            QueueFamilyInfo {
                index: 1,
                flags: vk::QueueFlags::TRANSFER,
                queue_count: 1,
            },
        ])
    }

    /// A device exposing exactly `queue_families`.
    pub fn with_queue_families(queue_families: Vec<QueueFamilyInfo>) -> Self {
        Self {
            queue_families,
            state: Mutex::new(FakeState {
                next_handle: 0x1_0000,
                calls: Vec::new(),
                live: HashSet::new(),
                fences: HashMap::new(),
                buffers: HashMap::new(),
                recordings: HashMap::new(),
                pending: Vec::new(),
                swapchains: HashMap::new(),
                auto_complete: true,
                queue_delay: None,
                create_delay: None,
                in_flight: HashSet::new(),
                queue_violations: 0,
                signaled_semaphores: HashSet::new(),
                sync_violations: 0,
                surface_support: default_surface_support(),
                present_families: None,
                out_of_date_acquires: 0,
                out_of_date_presents: 0,
                suboptimal: false,
                failures: HashSet::new(),
            }),
            completed: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    // Configuration

    /// Complete submissions as soon as they are made (the default).
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state().auto_complete = auto_complete;
    }

    /// Hold every queue operation open for `delay`, widening race windows.
    pub fn set_queue_delay(&self, delay: Option<Duration>) {
        self.state().queue_delay = delay;
    }

    /// Slow down render pass and framebuffer creation.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.state().create_delay = delay;
    }

    /// Surface properties reported for every surface.
    pub fn set_surface_support(&self, support: SurfaceSupport) {
        self.state().surface_support = support;
    }

    /// Restrict presentation to these queue families. `None` means all.
    pub fn set_present_families(&self, families: Option<Vec<u32>>) {
        self.state().present_families = families;
    }

    /// Make the next `count` acquires report an out-of-date surface.
    pub fn inject_out_of_date_acquires(&self, count: u32) {
        self.state().out_of_date_acquires = count;
    }

    /// Make the next `count` presents report an out-of-date surface.
    pub fn inject_out_of_date_presents(&self, count: u32) {
        self.state().out_of_date_presents = count;
    }

    /// Report every acquire and present as suboptimal.
    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.state().suboptimal = suboptimal;
    }

    /// Make the next call at `point` fail with `ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn fail_next(&self, point: FailPoint) {
        self.state().failures.insert(point);
    }

    // Inspection

    /// Every native call so far, in order.
    pub fn calls(&self) -> Vec<NativeCall> {
        self.state().calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of created objects not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state().live.len()
    }

    /// Times two queue operations overlapped on the same native queue.
    pub fn queue_violations(&self) -> usize {
        self.state().queue_violations
    }

    /// Semaphore or acquire-fence misuses seen so far.
    pub fn sync_violations(&self) -> usize {
        self.state().sync_violations
    }

    /// Whether a semaphore is currently signaled.
    pub fn semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state().signaled_semaphores.contains(&semaphore)
    }

    /// Submissions waiting for [`Self::complete_all`].
    pub fn pending_submissions(&self) -> usize {
        self.state().pending.len()
    }

    /// Current contents of a buffer.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state().buffers.get(&buffer).map(|b| b.data.to_vec())
    }

    /// Signal state of a fence, `None` once destroyed.
    pub fn fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.state().fences.get(&fence).copied()
    }

    /// Run every pending submission and signal its fence.
    pub fn complete_all(&self) {
        let mut state = self.state();
        for submission in std::mem::take(&mut state.pending) {
            state.execute(submission);
        }
        self.completed.notify_all();
    }

    /// Mark a queue busy; overlapping entries count as violations.
    fn enter_queue(&self, queue: vk::Queue) {
        let delay = {
            let mut state = self.state();
            if !state.in_flight.insert(queue) {
                state.queue_violations += 1;
            }
            state.queue_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }

    fn leave_queue(&self, queue: vk::Queue) {
        self.state().in_flight.remove(&queue);
    }

    fn create_delay(&self) {
        let delay = self.state().create_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }
}

/// A desktop-like surface: 2..=3 images, 1..=4096 pixels, sRGB and UNORM
/// BGRA formats, FIFO and mailbox.
pub fn default_surface_support() -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        },
        formats: vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

fn out_of_memory() -> GpuError {
    GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
}

impl DeviceBackend for FakeBackend {
    fn queue_families(&self) -> Vec<QueueFamilyInfo> {
        self.queue_families.clone()
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x100 + u64::from(family) * 0x10 + u64::from(index))
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch, fence: vk::Fence) -> Result<()> {
        self.enter_queue(queue);
        let result = {
            let mut state = self.state();
            state.calls.push(NativeCall::QueueSubmit {
                queue,
                command_buffers: batch.command_buffers.clone(),
                wait_semaphores: batch.wait_semaphores.clone(),
                signal_semaphores: batch.signal_semaphores.clone(),
                fence,
            });
            if state.take_failure(FailPoint::QueueSubmit) {
                Err(out_of_memory())
            } else {
                for &semaphore in &batch.wait_semaphores {
                    state.wait_semaphore(semaphore);
                }
                for &semaphore in &batch.signal_semaphores {
                    state.signal_semaphore(semaphore);
                }
                let commands = batch
                    .command_buffers
                    .iter()
                    .filter_map(|cb| state.recordings.get(cb))
                    .flatten()
                    .copied()
                    .collect();
                let submission = Submission { commands, fence };
                if state.auto_complete {
                    state.execute(submission);
                } else {
                    state.pending.push(submission);
                }
                Ok(())
            }
        };
        self.leave_queue(queue);
        self.completed.notify_all();
        result
    }

    fn queue_present(&self, queue: vk::Queue, request: &PresentRequest) -> Result<PresentStatus> {
        self.enter_queue(queue);
        let status = {
            let mut state = self.state();
            state.calls.push(NativeCall::QueuePresent {
                queue,
                swapchain: request.swapchain,
                image_index: request.image_index,
                wait_semaphores: request.wait_semaphores.clone(),
            });
            for &semaphore in &request.wait_semaphores {
                state.wait_semaphore(semaphore);
            }
            if state.out_of_date_presents > 0 {
                state.out_of_date_presents -= 1;
                PresentStatus::OutOfDate
            } else if state.suboptimal {
                PresentStatus::Suboptimal
            } else {
                PresentStatus::Optimal
            }
        };
        self.leave_queue(queue);
        Ok(status)
    }

    /// Drains pending submissions: an idle device has finished everything.
    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        self.enter_queue(queue);
        self.state().calls.push(NativeCall::QueueWaitIdle(queue));
        self.leave_queue(queue);
        self.complete_all();
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.state().calls.push(NativeCall::DeviceWaitIdle);
        self.complete_all();
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state();
        let fence = state.create();
        state.fences.insert(fence, signaled);
        state.calls.push(NativeCall::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        self.state()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown fence {fence:?}")))
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        let deadline = (timeout_ns != u64::MAX)
            .then(|| Instant::now() + Duration::from_nanos(timeout_ns));

        let mut state = self.state();
        state.calls.push(NativeCall::WaitForFence(fence));
        if state.take_failure(FailPoint::WaitForFence) {
            return Err(out_of_memory());
        }
        loop {
            match state.fences.get(&fence) {
                None => return Err(GpuError::InvalidState(format!("Unknown fence {fence:?}"))),
                Some(true) => return Ok(true),
                Some(false) => {}
            }
            match deadline {
                None => self.completed.wait(&mut state),
                Some(deadline) => {
                    if self.completed.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.fences.get(&fence).copied().unwrap_or(false));
                    }
                }
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state();
        state.calls.push(NativeCall::ResetFence(fence));
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GpuError::InvalidState(format!("Unknown fence {fence:?}"))),
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        state.fences.remove(&fence);
        state.destroy(fence);
        state.calls.push(NativeCall::DestroyFence(fence));
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state();
        let semaphore = state.create();
        state.calls.push(NativeCall::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state();
        state.signaled_semaphores.remove(&semaphore);
        state.destroy(semaphore);
        state.calls.push(NativeCall::DestroySemaphore(semaphore));
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<vk::Buffer> {
        let mut state = self.state();
        if state.take_failure(FailPoint::CreateBuffer) {
            return Err(out_of_memory());
        }
        let buffer = state.create();
        state.buffers.insert(
            buffer,
            FakeBuffer {
                data: vec![0; desc.size as usize].into_boxed_slice(),
                memory: desc.memory,
            },
        );
        state.calls.push(NativeCall::CreateBuffer {
            buffer,
            size: desc.size,
            usage: desc.usage,
            memory: desc.memory,
        });
        Ok(buffer)
    }

    fn map_buffer(&self, buffer: vk::Buffer) -> Result<NonNull<u8>> {
        let mut state = self.state();
        state.calls.push(NativeCall::MapBuffer(buffer));
        let fake = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown buffer {buffer:?}")))?;
        if !fake.memory.is_host_visible() {
            return Err(GpuError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        // The boxed slice never moves while the buffer is alive.
        NonNull::new(fake.data.as_mut_ptr())
            .ok_or_else(|| GpuError::InvalidState("Null mapping".to_string()))
    }

    fn unmap_buffer(&self, buffer: vk::Buffer) {
        self.state().calls.push(NativeCall::UnmapBuffer(buffer));
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        state.buffers.remove(&buffer);
        state.destroy(buffer);
        state.calls.push(NativeCall::DestroyBuffer(buffer));
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let mut state = self.state();
        let pool = state.create();
        state.calls.push(NativeCall::CreateCommandPool { pool, queue_family });
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        state.destroy(pool);
        state.calls.push(NativeCall::DestroyCommandPool(pool));
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.state();
        let command_buffer = state.create();
        state.recordings.insert(command_buffer, Vec::new());
        state
            .calls
            .push(NativeCall::AllocateCommandBuffer(command_buffer));
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state();
        state.recordings.remove(&command_buffer);
        state.destroy(command_buffer);
        state.calls.push(NativeCall::FreeCommandBuffer(command_buffer));
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state();
        if let Some(recording) = state.recordings.get_mut(&command_buffer) {
            recording.clear();
        }
        state.calls.push(NativeCall::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state()
            .calls
            .push(NativeCall::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state();
        if let Some(recording) = state.recordings.get_mut(&command_buffer) {
            recording.extend(
                regions
                    .iter()
                    .map(|&region| Command::Copy { src, dst, region }),
            );
        }
        state.calls.push(NativeCall::CopyBuffer {
            src,
            dst,
            regions: regions.iter().copied().map(CopyRegion::from).collect(),
        });
    }

    fn cmd_clear_pass(&self, command_buffer: vk::CommandBuffer, pass: &ClearPass) {
        let mut state = self.state();
        if let Some(recording) = state.recordings.get_mut(&command_buffer) {
            recording.push(Command::Clear);
        }
        state.calls.push(NativeCall::ClearPass {
            framebuffer: pass.framebuffer,
            color: pass.color,
        });
    }

    fn create_surface(&self, _source: &SurfaceSource) -> Result<vk::SurfaceKHR> {
        let mut state = self.state();
        let surface = state.create();
        state.calls.push(NativeCall::CreateSurface(surface));
        Ok(surface)
    }

    fn surface_supported(&self, queue_family: u32, _surface: vk::SurfaceKHR) -> Result<bool> {
        Ok(self
            .state()
            .present_families
            .as_ref()
            .map_or(true, |families| families.contains(&queue_family)))
    }

    fn surface_support(&self, _surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        Ok(self.state().surface_support.clone())
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        let mut state = self.state();
        state.destroy(surface);
        state.calls.push(NativeCall::DestroySurface(surface));
    }

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<vk::SwapchainKHR> {
        let mut state = self.state();
        if state.take_failure(FailPoint::CreateSwapchain) {
            return Err(out_of_memory());
        }
        let swapchain = state.create();
        let images = (0..info.min_image_count)
            .map(|_| vk::Image::from_raw(state.next_raw()))
            .collect();
        state.swapchains.insert(
            swapchain,
            FakeSwapchain {
                images,
                next_image: 0,
            },
        );
        state.calls.push(NativeCall::CreateSwapchain {
            swapchain,
            info: *info,
        });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        self.state()
            .swapchains
            .get(&swapchain)
            .map(|s| s.images.clone())
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown swapchain {swapchain:?}")))
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireOutcome> {
        let mut state = self.state();
        state.calls.push(NativeCall::AcquireNextImage {
            swapchain,
            semaphore,
            fence,
        });
        if state.fences.get(&fence).copied().unwrap_or(false) {
            state.sync_violations += 1;
        }
        if state.out_of_date_acquires > 0 {
            state.out_of_date_acquires -= 1;
            return Ok(AcquireOutcome::OutOfDate);
        }

        let suboptimal = state.suboptimal;
        let chain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown swapchain {swapchain:?}")))?;
        let index = chain.next_image;
        chain.next_image = (index + 1) % chain.images.len().max(1) as u32;

        if fence != vk::Fence::null() {
            state.fences.insert(fence, true);
        }
        state.signal_semaphore(semaphore);
        self.completed.notify_all();
        Ok(AcquireOutcome::Acquired { index, suboptimal })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        state.swapchains.remove(&swapchain);
        state.destroy(swapchain);
        state.calls.push(NativeCall::DestroySwapchain(swapchain));
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let mut state = self.state();
        let view = state.create();
        state.calls.push(NativeCall::CreateImageView(view));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state();
        state.destroy(view);
        state.calls.push(NativeCall::DestroyImageView(view));
    }

    fn create_render_pass(&self, _key: &RenderPassKey) -> Result<vk::RenderPass> {
        self.create_delay();
        let mut state = self.state();
        if state.take_failure(FailPoint::CreateRenderPass) {
            return Err(out_of_memory());
        }
        let render_pass = state.create();
        state.calls.push(NativeCall::CreateRenderPass(render_pass));
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state();
        state.destroy(render_pass);
        state.calls.push(NativeCall::DestroyRenderPass(render_pass));
    }

    fn create_framebuffer(&self, key: &FramebufferKey) -> Result<vk::Framebuffer> {
        self.create_delay();
        let mut state = self.state();
        if state.take_failure(FailPoint::CreateFramebuffer) {
            return Err(out_of_memory());
        }
        let framebuffer = state.create();
        state.calls.push(NativeCall::CreateFramebuffer {
            framebuffer,
            width: key.width,
            height: key.height,
        });
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state();
        state.destroy(framebuffer);
        state.calls.push(NativeCall::DestroyFramebuffer(framebuffer));
    }
}
