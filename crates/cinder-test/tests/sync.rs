//! Fences, semaphores and command recording.

use std::thread;
use std::time::Duration;

use cinder_gpu::{CompletionSignal, Fence, RecordedCommands, SemaphoreWait, Semaphore};
use cinder_test::{fake_device, NativeCall};

#[test]
fn signaled_fence_wait_returns_immediately() {
    let (_fake, device) = fake_device().unwrap();
    let fence = Fence::new(&device, true).unwrap();

    assert!(fence.signaled().unwrap());
    assert!(fence.wait(Fence::WAIT_INFINITE).unwrap());
}

#[test]
fn reset_then_zero_wait_times_out() {
    let (_fake, device) = fake_device().unwrap();
    let fence = Fence::new(&device, true).unwrap();

    fence.reset().unwrap();

    assert!(!fence.signaled().unwrap());
    assert!(!fence.wait(0).unwrap());
}

#[test]
fn fence_signals_when_submission_completes() {
    let (fake, device) = fake_device().unwrap();
    fake.set_auto_complete(false);
    let fence = Fence::new(&device, false).unwrap();

    device
        .work_queue()
        .submit(&[], &[], &[], Some(&fence))
        .unwrap();
    assert!(!fence.wait(Duration::from_millis(5).as_nanos() as u64).unwrap());

    fake.complete_all();
    assert!(fence.wait(Fence::WAIT_INFINITE).unwrap());
}

#[test]
fn infinite_wait_wakes_on_completion_from_another_thread() {
    let (fake, device) = fake_device().unwrap();
    fake.set_auto_complete(false);
    let fence = Fence::new(&device, false).unwrap();
    device
        .work_queue()
        .submit(&[], &[], &[], Some(&fence))
        .unwrap();

    let completer = {
        let fake = fake.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            fake.complete_all();
        })
    };

    assert!(fence.wait(Fence::WAIT_INFINITE).unwrap());
    completer.join().unwrap();
}

#[test]
fn dropping_primitives_destroys_native_objects() {
    let (fake, device) = fake_device().unwrap();
    let fence = Fence::new(&device, false).unwrap();
    let semaphore = Semaphore::new(&device).unwrap();
    let (raw_fence, raw_semaphore) = (fence.raw(), semaphore.raw());

    drop(fence);
    drop(semaphore);

    let calls = fake.calls();
    assert!(calls.contains(&NativeCall::DestroyFence(raw_fence)));
    assert!(calls.contains(&NativeCall::DestroySemaphore(raw_semaphore)));
    assert_eq!(fake.fence_signaled(raw_fence), None);
}

#[test]
fn completion_signal_pairs_fence_and_semaphore() {
    let (fake, device) = fake_device().unwrap();
    let signal = CompletionSignal::new(&device).unwrap();
    let next = Fence::new(&device, false).unwrap();

    let queue = device.work_queue();
    queue
        .submit(&[], &[], &[&signal.semaphore], Some(&signal.fence))
        .unwrap();
    queue
        .submit(
            &[],
            &[SemaphoreWait::all_commands(&signal.semaphore)],
            &[],
            Some(&next),
        )
        .unwrap();

    assert!(signal.fence.wait(Fence::WAIT_INFINITE).unwrap());
    let submits: Vec<_> = fake
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::QueueSubmit {
                wait_semaphores,
                signal_semaphores,
                ..
            } => Some((wait_semaphores, signal_semaphores)),
            _ => None,
        })
        .collect();
    assert_eq!(submits[0], (vec![], vec![signal.semaphore.raw()]));
    assert_eq!(submits[1], (vec![signal.semaphore.raw()], vec![]));
}

#[test]
fn recorded_commands_are_send() {
    fn assert_send<T: Send>() {}
    assert_send::<RecordedCommands>();
}

#[test]
fn abandoned_recording_frees_its_command_buffer() {
    let (fake, device) = fake_device().unwrap();

    let raw = {
        let recorder = device.transfer_pool().begin_one_shot().unwrap();
        recorder.raw()
    };

    assert!(fake.calls().contains(&NativeCall::FreeCommandBuffer(raw)));
    assert!(!fake.calls().contains(&NativeCall::EndCommandBuffer(raw)));
}

#[test]
fn finished_recording_is_submitted_and_freed_on_drop() {
    let (fake, device) = fake_device().unwrap();

    let commands = device.transfer_pool().begin_one_shot().unwrap().finish().unwrap();
    let raw = commands.raw();
    device
        .work_queue()
        .submit(&[&commands], &[], &[], None)
        .unwrap();
    assert!(!fake.calls().contains(&NativeCall::FreeCommandBuffer(raw)));

    drop(commands);
    assert!(fake.calls().contains(&NativeCall::FreeCommandBuffer(raw)));
}
