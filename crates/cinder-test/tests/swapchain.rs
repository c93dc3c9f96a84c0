//! Swapchain creation, presentation, recreation and disposal.

use std::sync::Arc;

use ash::vk;
use cinder_gpu::{
    ColorSpace, Device, Fence, GpuError, PresentStatus, Semaphore, SurfaceSource, Swapchain,
    SwapchainDescriptor,
};
use cinder_test::{default_surface_support, fake_device, FailPoint, FakeBackend, NativeCall};

fn create_test_swapchain(width: u32, height: u32) -> (Arc<FakeBackend>, Arc<Device>, Swapchain) {
    let (fake, device) = fake_device().unwrap();
    let swapchain = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(width, height),
    )
    .unwrap();
    (fake, device, swapchain)
}

fn assert_framebuffers_match(swapchain: &Swapchain, extent: vk::Extent2D) {
    let framebuffers = swapchain.framebuffers().unwrap();
    assert_eq!(framebuffers.len(), swapchain.image_count().unwrap());
    for framebuffer in framebuffers {
        assert_eq!(framebuffer.extent(), extent);
        assert_eq!(framebuffer.render_pass(), swapchain.render_pass().unwrap());
    }
}

#[test]
fn creation_acquires_first_image() {
    let (_fake, _device, swapchain) = create_test_swapchain(800, 600);

    assert_eq!(swapchain.current_index().unwrap(), 0);
    // min 2 + 1, capped at max 3
    assert_eq!(swapchain.image_count().unwrap(), 3);
    assert_eq!(
        swapchain.extent().unwrap(),
        vk::Extent2D {
            width: 800,
            height: 600
        }
    );
    assert_framebuffers_match(&swapchain, swapchain.extent().unwrap());
}

#[test]
fn creation_picks_format_and_present_mode_from_preferences() {
    let (_fake, device) = fake_device().unwrap();

    let srgb = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(64, 64),
    )
    .unwrap();
    assert_eq!(
        srgb.surface_format().unwrap().format,
        vk::Format::B8G8R8A8_SRGB
    );
    assert_eq!(srgb.present_mode().unwrap(), vk::PresentModeKHR::FIFO);

    let linear = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(64, 64)
            .with_color_space(ColorSpace::Linear)
            .with_vsync(false),
    )
    .unwrap();
    assert_eq!(
        linear.surface_format().unwrap().format,
        vk::Format::B8G8R8A8_UNORM
    );
    assert_eq!(linear.present_mode().unwrap(), vk::PresentModeKHR::MAILBOX);
}

#[test]
fn requested_size_is_clamped() {
    let (_fake, _device, swapchain) = create_test_swapchain(10_000, 0);

    let expected = vk::Extent2D {
        width: 4096,
        height: 1,
    };
    assert_eq!(swapchain.extent().unwrap(), expected);
    assert_framebuffers_match(&swapchain, expected);
}

#[test]
fn present_advances_current_index() {
    let (fake, device, mut swapchain) = create_test_swapchain(800, 600);
    let render_finished = Semaphore::new(&device).unwrap();

    let status = swapchain.present(&[&render_finished], None, None).unwrap();

    assert_eq!(status, PresentStatus::Optimal);
    assert_eq!(swapchain.current_index().unwrap(), 1);
    assert!(fake.calls().contains(&NativeCall::QueuePresent {
        queue: swapchain.present_queue().raw(),
        swapchain: swapchain.handle().unwrap(),
        image_index: 0,
        wait_semaphores: vec![render_finished.raw()],
    }));

    for _ in 0..3 {
        swapchain.present(&[], None, None).unwrap();
    }
    assert_eq!(swapchain.current_index().unwrap(), 1);
}

#[test]
fn present_uses_caller_semaphore_and_fence_for_next_acquire() {
    let (fake, device, mut swapchain) = create_test_swapchain(800, 600);
    let image_available = Semaphore::new(&device).unwrap();
    let acquired = Fence::new(&device, false).unwrap();

    swapchain
        .present(&[], Some(&image_available), Some(&acquired))
        .unwrap();

    assert!(fake.calls().contains(&NativeCall::AcquireNextImage {
        swapchain: swapchain.handle().unwrap(),
        semaphore: image_available.raw(),
        fence: acquired.raw(),
    }));
    // Left signaled for the caller
    assert!(acquired.signaled().unwrap());
    assert!(fake.semaphore_signaled(image_available.raw()));
}

#[test]
fn caller_fence_is_reset_before_every_acquire() {
    let (fake, device, mut swapchain) = create_test_swapchain(800, 600);
    let acquired = Fence::new(&device, false).unwrap();

    for _ in 0..2 {
        swapchain.present(&[], None, Some(&acquired)).unwrap();
        assert!(acquired.signaled().unwrap());
    }

    assert_eq!(fake.sync_violations(), 0);
    let calls = fake.calls();
    let acquires: Vec<_> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            matches!(c, NativeCall::AcquireNextImage { fence, .. } if *fence == acquired.raw())
        })
        .map(|(i, _)| i)
        .collect();
    assert_eq!(acquires.len(), 2);
    assert!(calls[acquires[0]..acquires[1]].contains(&NativeCall::ResetFence(acquired.raw())));
}

#[test]
fn resize_round_trip() {
    let (fake, _device, mut swapchain) = create_test_swapchain(800, 600);
    let old_handle = swapchain.handle().unwrap();
    let old_framebuffers: Vec<_> = swapchain
        .framebuffers()
        .unwrap()
        .iter()
        .map(|f| f.raw())
        .collect();

    swapchain.resize(1280, 720).unwrap();

    let extent = vk::Extent2D {
        width: 1280,
        height: 720,
    };
    assert_eq!(swapchain.extent().unwrap(), extent);
    assert_framebuffers_match(&swapchain, extent);
    assert!(swapchain.current_index().unwrap() < swapchain.image_count().unwrap() as u32);

    let calls = fake.calls();
    assert!(calls.contains(&NativeCall::DestroySwapchain(old_handle)));
    for framebuffer in old_framebuffers {
        assert!(calls.contains(&NativeCall::DestroyFramebuffer(framebuffer)));
    }

    swapchain.present(&[], None, None).unwrap();
    assert!(swapchain.current_index().unwrap() < swapchain.image_count().unwrap() as u32);
}

#[test]
fn resize_clamps_new_size() {
    let (_fake, _device, mut swapchain) = create_test_swapchain(800, 600);

    swapchain.resize(5000, 300).unwrap();

    let expected = vk::Extent2D {
        width: 4096,
        height: 300,
    };
    assert_eq!(swapchain.extent().unwrap(), expected);
    assert_framebuffers_match(&swapchain, expected);
}

#[test]
fn out_of_date_present_requires_resize() {
    let (fake, _device, mut swapchain) = create_test_swapchain(800, 600);
    fake.inject_out_of_date_presents(1);

    let status = swapchain.present(&[], None, None).unwrap();

    assert_eq!(status, PresentStatus::OutOfDate);
    assert!(status.needs_recreation());
    assert!(matches!(
        swapchain.current_index(),
        Err(GpuError::InvalidState(_))
    ));
    assert!(swapchain.present(&[], None, None).is_err());

    swapchain.resize(800, 600).unwrap();
    assert_eq!(swapchain.current_index().unwrap(), 0);
    assert_eq!(
        swapchain.present(&[], None, None).unwrap(),
        PresentStatus::Optimal
    );
}

#[test]
fn out_of_date_acquire_after_present_is_reported() {
    let (fake, _device, mut swapchain) = create_test_swapchain(800, 600);
    fake.inject_out_of_date_acquires(1);

    let status = swapchain.present(&[], None, None).unwrap();

    assert_eq!(status, PresentStatus::OutOfDate);
    assert!(swapchain.current_index().is_err());
}

#[test]
fn suboptimal_surface_still_acquires() {
    let (fake, _device, mut swapchain) = create_test_swapchain(800, 600);
    fake.set_suboptimal(true);

    let status = swapchain.present(&[], None, None).unwrap();

    assert_eq!(status, PresentStatus::Suboptimal);
    assert_eq!(swapchain.current_index().unwrap(), 1);
}

#[test]
fn swapchains_share_the_cached_render_pass() {
    let (fake, device) = fake_device().unwrap();

    let first = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(64, 64),
    )
    .unwrap();
    let second = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(128, 128),
    )
    .unwrap();

    assert_eq!(first.render_pass().unwrap(), second.render_pass().unwrap());
    assert_eq!(
        fake.count_calls(|c| matches!(c, NativeCall::CreateRenderPass(_))),
        1
    );
}

#[test]
fn dispose_is_terminal() {
    let (fake, device, mut swapchain) = create_test_swapchain(800, 600);
    let surface = swapchain.surface().unwrap();

    swapchain.dispose().unwrap();

    assert!(swapchain.is_disposed());
    assert!(fake.calls().contains(&NativeCall::DestroySurface(surface)));
    assert_eq!(swapchain.dispose(), Err(GpuError::Disposed("swapchain")));
    assert_eq!(
        swapchain.present(&[], None, None),
        Err(GpuError::Disposed("swapchain"))
    );
    assert_eq!(swapchain.resize(10, 10), Err(GpuError::Disposed("swapchain")));
    assert_eq!(swapchain.current_index(), Err(GpuError::Disposed("swapchain")));

    drop(swapchain);
    drop(device);
    assert_eq!(fake.live_objects(), 0);
}

#[test]
fn dropping_releases_everything() {
    let (fake, device, swapchain) = create_test_swapchain(800, 600);

    drop(swapchain);

    assert!(device.framebuffers().is_empty());
    assert!(device.render_passes().is_empty());
    drop(device);
    assert_eq!(fake.live_objects(), 0);
}

#[test]
fn native_creation_failure_releases_the_surface() {
    let (fake, device) = fake_device().unwrap();
    fake.fail_next(FailPoint::CreateSwapchain);

    let err = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(64, 64),
    )
    .unwrap_err();

    assert!(matches!(err, GpuError::SwapchainCreation(_)));
    assert_eq!(
        fake.count_calls(|c| matches!(c, NativeCall::DestroySurface(_))),
        1
    );
}

#[test]
fn out_of_date_during_creation_fails() {
    let (fake, device) = fake_device().unwrap();
    fake.inject_out_of_date_acquires(1);

    let err = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(64, 64),
    )
    .unwrap_err();

    assert!(matches!(err, GpuError::SwapchainCreation(_)));
    assert!(device.framebuffers().is_empty());
    drop(device);
    assert_eq!(fake.live_objects(), 0);
}

#[test]
fn surface_without_formats_is_unsupported() {
    let (fake, device) = fake_device().unwrap();
    let mut support = default_surface_support();
    support.formats.clear();
    fake.set_surface_support(support);

    let err = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(64, 64),
    )
    .unwrap_err();

    assert!(matches!(err, GpuError::UnsupportedFormat(_)));
}

#[test]
fn present_queue_is_first_capable_family() {
    let (fake, device) = fake_device().unwrap();
    fake.set_present_families(Some(vec![1]));

    let swapchain = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(64, 64),
    )
    .unwrap();
    assert_eq!(swapchain.present_queue().family_index(), 1);

    fake.set_present_families(Some(Vec::new()));
    let err = Swapchain::new(
        &device,
        &SurfaceSource::Headless,
        SwapchainDescriptor::new(64, 64),
    )
    .unwrap_err();
    assert!(matches!(err, GpuError::SurfaceCreation(_)));
}
