//! Test harness for the Cinder graphics layer.
//!
//! Provides an in-memory native backend and helpers to stand up a device on
//! top of it, so the core can be exercised without a GPU.

pub mod fake;

pub use fake::{default_surface_support, CopyRegion, FailPoint, FakeBackend, NativeCall};

use std::sync::Arc;

use cinder_gpu::{Device, Result};

/// Route `tracing` output through the test writer. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A device on a fresh [`FakeBackend`].
pub fn fake_device() -> Result<(Arc<FakeBackend>, Arc<Device>)> {
    fake_device_with(FakeBackend::new())
}

/// A device on a pre-configured [`FakeBackend`].
pub fn fake_device_with(backend: FakeBackend) -> Result<(Arc<FakeBackend>, Arc<Device>)> {
    init_test_logging();
    let backend = Arc::new(backend);
    let device = Device::new(backend.clone())?;
    Ok((backend, device))
}
