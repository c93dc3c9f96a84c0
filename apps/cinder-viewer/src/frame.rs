//! Per-frame clear, submit and present, independent of the window.

use std::sync::Arc;
use std::time::Instant;

use cinder_gpu::{
    ClearPass, Device, Fence, PresentStatus, RecordedCommands, Semaphore, SemaphoreWait,
    Swapchain,
};
use tracing::{debug, error, info};

/// GPU state driving one swapchain.
///
/// Field order is drop order: GPU objects go before the device.
pub struct FrameLoop {
    in_flight_commands: Option<RecordedCommands>,
    in_flight: Fence,
    image_available: Semaphore,
    render_finished: Semaphore,
    /// Whether the last acquire signaled `image_available` and nothing has
    /// waited on it yet.
    image_signaled: bool,
    swapchain: Swapchain,
    device: Arc<Device>,
    started: Instant,
    frame_count: u64,
}

impl FrameLoop {
    pub fn new(device: Arc<Device>, swapchain: Swapchain) -> cinder_gpu::Result<Self> {
        Ok(Self {
            in_flight_commands: None,
            in_flight: Fence::new(&device, true)?,
            image_available: Semaphore::new(&device)?,
            render_finished: Semaphore::new(&device)?,
            image_signaled: false,
            swapchain,
            device,
            started: Instant::now(),
            frame_count: 0,
        })
    }

    /// Clear and present one frame for a surface of `width` x `height`.
    pub fn render(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.in_flight.wait(Fence::WAIT_INFINITE)?;
        self.in_flight.reset()?;
        self.in_flight_commands = None;

        let framebuffer = self.swapchain.current_framebuffer()?;
        let mut recorder = self.device.transfer_pool().begin_one_shot()?;
        recorder.clear_pass(&ClearPass {
            render_pass: framebuffer.render_pass(),
            framebuffer: framebuffer.raw(),
            extent: framebuffer.extent(),
            color: self.clear_color(),
        });
        let commands = recorder.finish()?;

        let waits: Vec<SemaphoreWait<'_>> = if self.image_signaled {
            vec![SemaphoreWait::all_commands(&self.image_available)]
        } else {
            Vec::new()
        };
        self.device.work_queue().submit(
            &[&commands],
            &waits,
            &[&self.render_finished],
            Some(&self.in_flight),
        )?;
        self.in_flight_commands = Some(commands);
        self.image_signaled = false;

        let status = self.swapchain.present(
            &[&self.render_finished],
            Some(&self.image_available),
            None,
        )?;
        // Suboptimal still acquired, and the acquire signaled the semaphore.
        self.image_signaled = status != PresentStatus::OutOfDate;
        self.frame_count += 1;

        if status.needs_recreation() {
            debug!("Swapchain reported {status:?}, recreating");
            self.resize(width, height)?;
        }
        Ok(())
    }

    /// Recreate the swapchain at a new size.
    pub fn resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.swapchain.resize(width, height)?;
        if self.image_signaled {
            // Nothing will wait on the old image's signal; the device is idle.
            self.image_available = Semaphore::new(&self.device)?;
            self.image_signaled = false;
        }
        let extent = self.swapchain.extent()?;
        info!("Swapchain resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn clear_color(&self) -> [f32; 4] {
        let t = self.started.elapsed().as_secs_f32();
        [
            0.5 + 0.5 * t.sin(),
            0.5 + 0.5 * (t * 0.7).sin(),
            0.5 + 0.5 * (t * 1.3).sin(),
            1.0,
        ]
    }

    /// Wait for the device, release the swapchain and log frame statistics.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Device wait failed during shutdown: {e}");
        }
        self.in_flight_commands = None;
        if let Err(e) = self.swapchain.dispose() {
            error!("Swapchain disposal failed: {e}");
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            info!(
                "Presented {} frames ({:.1} fps average)",
                self.frame_count,
                self.frame_count as f64 / elapsed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_gpu::{SurfaceSource, SwapchainDescriptor};
    use cinder_test::{fake_device, FakeBackend, NativeCall};

    fn create_frame_loop() -> (Arc<FakeBackend>, FrameLoop) {
        let (fake, device) = fake_device().unwrap();
        let swapchain = Swapchain::new(
            &device,
            &SurfaceSource::Headless,
            SwapchainDescriptor::new(800, 600),
        )
        .unwrap();
        (fake, FrameLoop::new(device, swapchain).unwrap())
    }

    fn swapchains_created(fake: &FakeBackend) -> usize {
        fake.count_calls(|c| matches!(c, NativeCall::CreateSwapchain { .. }))
    }

    #[test]
    fn steady_frames_wait_on_every_signal() {
        let (fake, mut frames) = create_frame_loop();

        for _ in 0..4 {
            frames.render(800, 600).unwrap();
        }

        assert_eq!(fake.sync_violations(), 0);
        assert_eq!(
            fake.count_calls(|c| matches!(c, NativeCall::QueuePresent { .. })),
            4
        );
        assert_eq!(swapchains_created(&fake), 1);
    }

    #[test]
    fn suboptimal_present_recreates_without_resignaling() {
        let (fake, mut frames) = create_frame_loop();

        fake.set_suboptimal(true);
        frames.render(800, 600).unwrap();
        fake.set_suboptimal(false);
        for _ in 0..3 {
            frames.render(800, 600).unwrap();
        }

        assert_eq!(swapchains_created(&fake), 2);
        assert_eq!(fake.sync_violations(), 0);
    }

    #[test]
    fn out_of_date_present_recreates() {
        let (fake, mut frames) = create_frame_loop();
        frames.render(800, 600).unwrap();

        fake.inject_out_of_date_presents(1);
        for _ in 0..3 {
            frames.render(800, 600).unwrap();
        }

        assert_eq!(swapchains_created(&fake), 2);
        assert_eq!(fake.sync_violations(), 0);
    }

    #[test]
    fn window_resize_between_frames() {
        let (fake, mut frames) = create_frame_loop();
        frames.render(800, 600).unwrap();

        frames.resize(1024, 768).unwrap();
        frames.render(1024, 768).unwrap();

        assert_eq!(swapchains_created(&fake), 2);
        assert_eq!(fake.sync_violations(), 0);
    }

    #[test]
    fn minimized_window_skips_the_frame() {
        let (fake, mut frames) = create_frame_loop();

        frames.render(0, 0).unwrap();
        frames.resize(0, 600).unwrap();

        assert_eq!(
            fake.count_calls(|c| matches!(c, NativeCall::QueueSubmit { .. })),
            0
        );
        assert_eq!(swapchains_created(&fake), 1);
    }

    #[test]
    fn shutdown_releases_the_swapchain() {
        let (fake, mut frames) = create_frame_loop();
        frames.render(800, 600).unwrap();

        frames.shutdown();
        drop(frames);

        assert_eq!(fake.live_objects(), 0);
    }
}
