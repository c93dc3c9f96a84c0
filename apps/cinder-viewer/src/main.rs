//! Cinder Viewer
//!
//! Opens a window and presents a cleared color every frame, exercising the
//! swapchain, submission and recreation paths end to end.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p cinder-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--no-vsync`: Prefer mailbox presentation
//! - `--validation`: Enable Vulkan validation layers
//! - `--no-validation`: Disable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod frame;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Viewer configuration.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            title: "Cinder Viewer".to_string(),
            width: WIDTH,
            height: HEIGHT,
            vsync: true,
            validation: cfg!(debug_assertions),
        }
    }
}

impl ViewerConfig {
    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    fn from_args() -> Self {
        let mut config = Self::default().with_size(WIDTH, HEIGHT);
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--no-vsync" => config = config.with_vsync(false),
                "--validation" => config = config.with_validation(true),
                "--no-validation" => config = config.with_validation(false),
                other => eprintln!("Ignoring unknown argument: {other}"),
            }
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ViewerConfig::from_args();
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut viewer = Viewer::new(config);
    if let Err(e) = event_loop.run_app(&mut viewer) {
        error!("Event loop error: {e}");
    }

    Ok(())
}

fn print_help() {
    eprintln!(
        "Cinder Viewer

USAGE:
    cargo run -p cinder-viewer -- [OPTIONS]

OPTIONS:
    --no-vsync              Prefer mailbox presentation when available
    --validation            Enable Vulkan validation layers
    --no-validation         Disable Vulkan validation layers
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
