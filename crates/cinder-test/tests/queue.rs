//! Queue identity and submission serialization.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use ash::vk;
use cinder_gpu::backend::{PresentRequest, SubmitBatch};
use cinder_gpu::{DeviceBackend, Fence, Semaphore, SemaphoreWait};
use cinder_test::{fake_device, NativeCall};

const THREADS: usize = 8;

#[test]
fn queues_wrapping_the_same_native_queue_are_equal() {
    let (_fake, device) = fake_device().unwrap();

    let graphics = device.find_queue(vk::QueueFlags::GRAPHICS).unwrap();
    let transfer_only = device.queue_families()[1].queues()[0].clone();

    assert_eq!(&graphics, device.work_queue());
    assert_eq!(graphics.clone(), graphics);
    assert_ne!(graphics, transfer_only);
}

#[test]
fn work_queue_prefers_graphics_family() {
    let (_fake, device) = fake_device().unwrap();

    assert_eq!(device.work_queue().family_index(), 0);
    assert_eq!(device.transfer_pool().queue_family(), 0);
}

#[test]
fn concurrent_submits_never_overlap() {
    let (fake, device) = fake_device().unwrap();
    fake.set_queue_delay(Some(Duration::from_millis(5)));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let device = Arc::clone(&device);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let wait = Semaphore::new(&device).unwrap();
                let signal = Semaphore::new(&device).unwrap();
                let fence = Fence::new(&device, false).unwrap();
                barrier.wait();
                for _ in 0..4 {
                    fence.reset().unwrap();
                    device
                        .work_queue()
                        .submit(
                            &[],
                            &[SemaphoreWait::all_commands(&wait)],
                            &[&signal],
                            Some(&fence),
                        )
                        .unwrap();
                    fence.wait(Fence::WAIT_INFINITE).unwrap();
                }
                (wait.raw(), signal.raw(), fence.raw())
            })
        })
        .collect();
    let owners: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(fake.queue_violations(), 0);

    // Every native call carries one thread's complete argument set.
    let submits: Vec<_> = fake
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::QueueSubmit {
                wait_semaphores,
                signal_semaphores,
                fence,
                ..
            } => Some((wait_semaphores, signal_semaphores, fence)),
            _ => None,
        })
        .collect();
    assert_eq!(submits.len(), THREADS * 4);
    for (waits, signals, fence) in submits {
        assert!(owners
            .iter()
            .any(|&(w, s, f)| waits == [w] && signals == [s] && fence == f));
    }
}

#[test]
fn present_and_idle_share_the_submit_lock() {
    let (fake, device) = fake_device().unwrap();
    fake.set_queue_delay(Some(Duration::from_millis(5)));
    let barrier = Arc::new(Barrier::new(3));

    let submitter = {
        let device = Arc::clone(&device);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..5 {
                device.work_queue().submit(&[], &[], &[], None).unwrap();
            }
        })
    };
    let presenter = {
        let device = Arc::clone(&device);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..5 {
                device
                    .work_queue()
                    .present(&PresentRequest {
                        wait_semaphores: Vec::new(),
                        swapchain: vk::SwapchainKHR::null(),
                        image_index: 0,
                    })
                    .unwrap();
            }
        })
    };
    barrier.wait();
    for _ in 0..5 {
        device.work_queue().wait_idle().unwrap();
    }
    submitter.join().unwrap();
    presenter.join().unwrap();

    assert_eq!(fake.queue_violations(), 0);
}

/// Control: bypassing the queue lock does get caught by the fake.
#[test]
fn unserialized_native_submits_are_detected() {
    let (fake, device) = fake_device().unwrap();
    fake.set_queue_delay(Some(Duration::from_millis(50)));
    let raw_queue = device.work_queue().raw();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let fake = fake.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                fake.queue_submit(raw_queue, &SubmitBatch::default(), vk::Fence::null())
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(fake.queue_violations() > 0);
}

#[test]
fn equal_queues_from_every_lookup_share_one_lock() {
    let (fake, device) = fake_device().unwrap();
    fake.set_queue_delay(Some(Duration::from_millis(20)));

    let looked_up = device.find_queue(vk::QueueFlags::GRAPHICS).unwrap();
    let from_family = device.queue_families()[0].queues()[0].clone();
    assert_eq!(&looked_up, device.work_queue());
    assert_eq!(&from_family, device.work_queue());

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = [device.work_queue().clone(), looked_up, from_family]
        .into_iter()
        .map(|queue| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..5 {
                    queue.submit(&[], &[], &[], None).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fake.queue_violations(), 0);
    assert_eq!(
        fake.count_calls(|c| matches!(c, NativeCall::QueueSubmit { .. })),
        15
    );
}
