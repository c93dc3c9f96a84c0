//! Window creation and event handling.

use std::sync::Arc;

use cinder_gpu::{Device, SurfaceSource, Swapchain, SwapchainDescriptor, VulkanBackendBuilder};
use raw_window_handle::HasDisplayHandle;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

use crate::frame::FrameLoop;
use crate::ViewerConfig;

/// winit application driving the viewer.
pub struct Viewer {
    config: ViewerConfig,
    state: Option<ViewerState>,
}

impl Viewer {
    pub fn new(config: ViewerConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<ViewerState> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let backend = VulkanBackendBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .presentation(event_loop.display_handle()?.as_raw())
            .build()?;
        info!("GPU: {}", backend.adapter().summary());

        let device = Device::new(Arc::new(backend))?;
        let size = window.inner_size();
        let swapchain = Swapchain::new(
            &device,
            &SurfaceSource::from_window(window.as_ref())?,
            SwapchainDescriptor::new(size.width, size.height).with_vsync(self.config.vsync),
        )?;

        Ok(ViewerState {
            frames: FrameLoop::new(device, swapchain)?,
            window,
        })
    }
}

/// Field order is drop order: the frame loop goes before the window.
struct ViewerState {
    frames: FrameLoop,
    window: Arc<Window>,
}

impl ApplicationHandler for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Viewer ready!");
            }
            Err(e) => {
                error!("Failed to initialize viewer: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.frames.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    let size = state.window.inner_size();
                    if let Err(e) = state.frames.render(size.width, size.height) {
                        error!("Render error: {e}");
                    }
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.frames.resize(size.width, size.height) {
                        error!("Resize error: {e}");
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}
