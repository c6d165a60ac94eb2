mod common;

use std::sync::Arc;

use common::MockDriver;
use gpuav::driver::{CommandBufferHandle, DescriptorPoolHandle, DescriptorSetLayoutHandle, Driver};
use gpuav::protocol::output_buffer_words;
use gpuav::{
    rules, CollectingSink, GpuAvError, GpuAvStats, RetireReason, SubmissionState,
    SubmissionTracker, TrackerError,
};

const CAPACITY: u32 = 8;

fn tracker() -> (SubmissionTracker, MockDriver, CollectingSink) {
    (
        SubmissionTracker::new(CAPACITY, 256, Arc::new(GpuAvStats::new())),
        MockDriver::new(),
        CollectingSink::new(),
    )
}

#[test]
fn diagnostic_buffer_is_lazy_and_initialized() {
    let (tracker, driver, sink) = tracker();
    let cmd = CommandBufferHandle(1);
    tracker.begin(&driver, &sink, cmd);
    assert_eq!(tracker.output_buffer(cmd), None);

    let output = tracker.diagnostic_buffer(&driver, cmd).unwrap();
    assert_eq!(tracker.diagnostic_buffer(&driver, cmd).unwrap(), output);
    let words = driver.buffer_words(output);
    assert_eq!(words.len(), output_buffer_words(CAPACITY));
    assert_eq!(&words[..4], &[0, CAPACITY, 0, 0]);
}

#[test]
fn input_regions_respect_offset_alignment() {
    let (tracker, driver, sink) = tracker();
    let cmd = CommandBufferHandle(1);
    tracker.begin(&driver, &sink, cmd);
    let (a, a_offset, a_size) = tracker.input_region(&driver, cmd, &[1, 2, 3]).unwrap();
    let (b, b_offset, _) = tracker.input_region(&driver, cmd, &[4, 5]).unwrap();
    assert_eq!(a, b);
    assert_eq!((a_offset, a_size, b_offset), (0, 12, 256));
    assert_eq!(&driver.buffer_words(b)[64..66], &[4, 5]);
}

#[test]
fn only_recording_contexts_accept_commands() {
    let (tracker, driver, sink) = tracker();
    let cmd = CommandBufferHandle(1);
    tracker.begin(&driver, &sink, cmd);
    tracker.mark_submitted(&driver, &[cmd]);
    // Already pending: a second submit in the same batch changes nothing.
    tracker.mark_submitted(&driver, &[cmd]);
    assert_eq!(tracker.state(cmd), Some(SubmissionState::Submitted));
    assert!(matches!(
        tracker.diagnostic_buffer(&driver, cmd),
        Err(GpuAvError::Tracker(TrackerError::InvalidState { state: "submitted", .. }))
    ));
    assert!(matches!(
        tracker.diagnostic_buffer(&driver, CommandBufferHandle(2)),
        Err(GpuAvError::Tracker(TrackerError::UnknownCommandBuffer(2)))
    ));

    tracker.submit_failed(&[cmd]);
    assert_eq!(tracker.state(cmd), Some(SubmissionState::Recording));
    assert!(tracker.diagnostic_buffer(&driver, cmd).is_ok());
}

#[test]
fn buffers_stay_with_the_recording_until_it_is_recorded_again() {
    let (tracker, driver, sink) = tracker();
    let cmd = CommandBufferHandle(1);
    tracker.begin(&driver, &sink, cmd);
    let output = tracker.diagnostic_buffer(&driver, cmd).unwrap();
    tracker.input_region(&driver, cmd, &[0; 4]).unwrap();
    let set = driver
        .allocate_descriptor_set(DescriptorPoolHandle(1), DescriptorSetLayoutHandle(1))
        .unwrap();
    tracker.add_reserved_set(cmd, DescriptorPoolHandle(1), set).unwrap();

    tracker.mark_submitted(&driver, &[cmd]);
    let token = driver.queue_submit(&[cmd]).unwrap();
    tracker.await_completion(&[cmd], token);
    assert_eq!(tracker.harvest(&driver, &sink), 0);

    driver.complete(token);
    assert_eq!(tracker.harvest(&driver, &sink), 1);
    assert_eq!(tracker.state(cmd), Some(SubmissionState::Harvested));
    // The command buffer can still be submitted, so it keeps what it references.
    assert_eq!(tracker.pooled_buffers(), 0);
    assert_eq!(driver.state().live_sets, 1);
    assert_eq!(tracker.output_buffer(cmd), Some(output));
    assert!(sink.take().is_empty());

    tracker.harvest(&driver, &sink);
    assert_eq!(tracker.state(cmd), Some(SubmissionState::Harvested));

    tracker.begin(&driver, &sink, cmd);
    assert_eq!(tracker.state(cmd), Some(SubmissionState::Recording));
    assert_eq!(tracker.pooled_buffers(), 2);
    assert_eq!(driver.state().live_sets, 0);
}

#[test]
fn resubmission_resets_the_output_header() {
    let (tracker, driver, sink) = tracker();
    let cmd = CommandBufferHandle(1);
    tracker.begin(&driver, &sink, cmd);
    let output = tracker.diagnostic_buffer(&driver, cmd).unwrap();
    tracker.mark_submitted(&driver, &[cmd]);
    let token = driver.queue_submit(&[cmd]).unwrap();
    tracker.await_completion(&[cmd], token);
    driver.complete(token);
    tracker.harvest(&driver, &sink);

    // Counter left behind by a submission that overflowed.
    driver.set_buffer_words(output, &[CAPACITY + 3, CAPACITY, 0, 0]);
    tracker.mark_submitted(&driver, &[cmd]);
    assert_eq!(&driver.buffer_words(output)[..4], &[0, CAPACITY, 0, 0]);
    assert_eq!(tracker.decode_again(cmd), None);

    let token = driver.queue_submit(&[cmd]).unwrap();
    tracker.await_completion(&[cmd], token);
    driver.complete(token);
    assert_eq!(tracker.harvest(&driver, &sink), 1);
    assert!(sink.take().is_empty(), "nothing dropped by the new submission");
}

#[test]
fn retired_contexts_are_dropped() {
    let (tracker, driver, sink) = tracker();
    let (a, b) = (CommandBufferHandle(1), CommandBufferHandle(2));
    for cmd in [a, b] {
        tracker.begin(&driver, &sink, cmd);
        tracker.diagnostic_buffer(&driver, cmd).unwrap();
    }
    tracker.abandon(&driver, &sink, a);
    assert_eq!(
        tracker.state(a),
        Some(SubmissionState::Retired(RetireReason::Abandoned))
    );
    tracker.free(&driver, &sink, b);
    assert_eq!(tracker.state(b), None);
    assert_eq!(tracker.tracked(), 1);

    tracker.harvest(&driver, &sink);
    assert_eq!(tracker.state(a), None);
    assert_eq!(tracker.tracked(), 0);
    assert_eq!(tracker.pooled_buffers(), 2);
    assert!(sink.take().is_empty());
}

#[test]
fn abandoned_in_flight_work_waits_for_its_token() {
    let (tracker, driver, sink) = tracker();
    let cmd = CommandBufferHandle(1);
    tracker.begin(&driver, &sink, cmd);
    tracker.diagnostic_buffer(&driver, cmd).unwrap();
    tracker.mark_submitted(&driver, &[cmd]);
    let token = driver.queue_submit(&[cmd]).unwrap();
    tracker.await_completion(&[cmd], token);

    tracker.abandon(&driver, &sink, cmd);
    assert_eq!(sink.count(rules::RESULTS_ABANDONED), 1);
    assert_eq!(
        tracker.state(cmd),
        Some(SubmissionState::Retired(RetireReason::Abandoned))
    );
    tracker.harvest(&driver, &sink);
    assert_eq!(tracker.pooled_buffers(), 0, "GPU may still write to it");

    driver.complete(token);
    tracker.harvest(&driver, &sink);
    assert_eq!(tracker.pooled_buffers(), 1);
    assert_eq!(sink.snapshot().len(), 1);
}

#[test]
fn device_loss_reports_each_unharvested_context() {
    let (tracker, driver, sink) = tracker();
    let (a, b, c) = (CommandBufferHandle(1), CommandBufferHandle(2), CommandBufferHandle(3));
    for cmd in [a, b, c] {
        tracker.begin(&driver, &sink, cmd);
        tracker.diagnostic_buffer(&driver, cmd).unwrap();
    }
    tracker.mark_submitted(&driver, &[a, b]);
    let token = driver.queue_submit(&[a, b]).unwrap();
    tracker.await_completion(&[a, b], token);
    driver.complete(token);
    tracker.harvest(&driver, &sink);
    assert_eq!(tracker.state(a), Some(SubmissionState::Harvested));

    // `a` and `b` shared a token and were harvested; `c` was still recording.
    assert_eq!(tracker.device_lost(&driver, &sink), 1);
    assert_eq!(sink.count(rules::RESULTS_DEVICE_LOST), 1);
    assert_eq!(
        tracker.state(c),
        Some(SubmissionState::Retired(RetireReason::DeviceLost))
    );
    assert_eq!(tracker.state(b), Some(SubmissionState::Harvested));
}

#[test]
fn shutdown_destroys_every_pooled_buffer() {
    let (tracker, driver, sink) = tracker();
    let cmd = CommandBufferHandle(1);
    tracker.begin(&driver, &sink, cmd);
    tracker.diagnostic_buffer(&driver, cmd).unwrap();
    tracker.input_region(&driver, cmd, &[7]).unwrap();
    assert_eq!(tracker.live_buffers(), 2);
    tracker.begin(&driver, &sink, cmd);
    assert_eq!(tracker.pooled_buffers(), 2);
    tracker.shutdown(&driver, &sink);
    assert_eq!(tracker.live_buffers(), 0);
    assert_eq!(driver.live_buffers(), 0);
    assert!(sink.take().is_empty());
}
