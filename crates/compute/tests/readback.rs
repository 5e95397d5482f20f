//! Append-count and buffer-content readback: blocking, callback and handle
//! forms, transfer failures, and transient count-buffer cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use compute::{
    ComputeContext, ComputeDevice, ComputeError, CountReadback, CountSentinel, CpuDevice,
    GpuBuffer, KernelCall, PollMode, TransferError, COUNT_ERROR_SENTINEL,
};

const GROUP: i32 = 64;

fn context_with(device: CpuDevice) -> ComputeContext<CpuDevice> {
    let mut device = device;
    device.register_kernel("append_index", [GROUP as u32, 1, 1], |inv| {
        let limit = inv.params::<u32>().unwrap_or(0);
        if inv.index() < limit {
            inv.append(0, inv.index());
        }
    });
    ComputeContext::new(device)
}

fn cpu_context() -> ComputeContext<CpuDevice> {
    context_with(CpuDevice::new())
}

/// Appends `n` items to `buffer`.
fn fill(ctx: &mut ComputeContext<CpuDevice>, buffer: &GpuBuffer, n: u32) {
    let call = KernelCall::new("append_index").bind(buffer).params(&n);
    ctx.dispatch(&call, n as i32, GROUP).unwrap();
}

/// Callback sink recording every value it receives.
fn recorder() -> (Arc<Mutex<Vec<CountReadback>>>, impl FnOnce(CountReadback) + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |count| sink.lock().unwrap().push(count))
}

#[test]
fn blocking_count_is_exact_below_capacity() {
    let capacity = 256;
    for n in [0, 1, 37, 255, 256] {
        let mut ctx = cpu_context();
        let append = ctx.create_append::<u32>(capacity).unwrap();
        fill(&mut ctx, &append, n);
        assert_eq!(ctx.append_count(&append, None).unwrap(), n, "n = {n}");
        // The temporary count buffer is gone again.
        assert_eq!(ctx.device().live_allocations(), 1);
    }
}

#[test]
fn count_saturates_at_capacity() {
    let mut ctx = cpu_context();
    let append = ctx.create_append::<u32>(100).unwrap();
    fill(&mut ctx, &append, 340);
    assert_eq!(ctx.append_count(&append, None).unwrap(), 100);

    let (seen, sink) = recorder();
    ctx.append_count_async(&append, None, sink).unwrap();
    ctx.poll(PollMode::Wait).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![Ok(100)]);
}

#[test]
fn supplied_count_buffer_is_reused_and_kept() {
    let mut ctx = cpu_context();
    let append = ctx.create_append::<u32>(64).unwrap();
    let count = ctx.create_count().unwrap();
    fill(&mut ctx, &append, 12);

    assert_eq!(ctx.append_count(&append, Some(&count)).unwrap(), 12);
    assert!(count.is_live());
    assert_eq!(ctx.device().live_allocations(), 2);
    assert_eq!(ctx.buffer_contents::<u32>(&count).unwrap(), vec![12]);

    let (seen, sink) = recorder();
    ctx.append_count_async(&append, Some(&count), sink).unwrap();
    ctx.poll(PollMode::Wait).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![Ok(12)]);
    assert!(count.is_live());
    assert_eq!(ctx.device().live_allocations(), 2);
}

#[test]
fn blocking_transfer_failure_is_an_error_and_cleans_up() {
    let mut ctx = cpu_context();
    let append = ctx.create_append::<u32>(16).unwrap();
    ctx.device_mut().fail_next_transfers(1);

    let err = ctx.append_count(&append, None).unwrap_err();
    assert!(matches!(err, ComputeError::Transfer(TransferError::Failed(_))));
    assert_eq!(ctx.device().live_allocations(), 1);

    // The failure was one-shot.
    assert_eq!(ctx.append_count(&append, None).unwrap(), 0);
}

#[test]
fn async_callback_runs_exactly_once() {
    let mut ctx = cpu_context();
    let append = ctx.create_append::<u32>(1000).unwrap();
    fill(&mut ctx, &append, 500);

    let calls = Arc::new(AtomicUsize::new(0));
    let value = Arc::new(Mutex::new(None));
    let (c, v) = (Arc::clone(&calls), Arc::clone(&value));
    ctx.append_count_async(&append, None, move |count| {
        c.fetch_add(1, Ordering::SeqCst);
        *v.lock().unwrap() = Some(count);
    })
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0, "callback must not run inline");
    assert_eq!(ctx.in_flight(), 1);

    assert_eq!(ctx.poll(PollMode::Wait).unwrap(), 1);
    assert_eq!(ctx.poll(PollMode::Wait).unwrap(), 0);
    assert_eq!(ctx.poll(PollMode::Poll).unwrap(), 0);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*value.lock().unwrap(), Some(Ok(500)));
    assert_eq!(ctx.in_flight(), 0);
    assert_eq!(ctx.device().live_allocations(), 1);
}

#[test]
fn async_completion_waits_for_the_transfer() {
    let mut ctx = context_with(CpuDevice::new().with_transfer_latency(3));
    let append = ctx.create_append::<u32>(32).unwrap();
    fill(&mut ctx, &append, 9);

    let (seen, sink) = recorder();
    ctx.append_count_async(&append, None, sink).unwrap();
    // Transient count buffer stays alive while the transfer is in flight.
    assert_eq!(ctx.device().live_allocations(), 2);

    for _ in 0..3 {
        assert_eq!(ctx.poll(PollMode::Poll).unwrap(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }
    assert_eq!(ctx.poll(PollMode::Poll).unwrap(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![Ok(9)]);
    assert_eq!(ctx.device().live_allocations(), 1);
}

#[test]
fn async_failure_reports_sentinel_once_and_releases_transient() {
    let mut ctx = cpu_context();
    let append = ctx.create_append::<u32>(32).unwrap();
    fill(&mut ctx, &append, 5);
    ctx.device_mut().fail_next_transfers(1);

    let (seen, sink) = recorder();
    ctx.append_count_async(&append, None, sink).unwrap();
    ctx.poll(PollMode::Wait).unwrap();
    ctx.poll(PollMode::Wait).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], Err(TransferError::Failed(_))));
    assert_eq!(seen[0].sentinel(), COUNT_ERROR_SENTINEL);
    assert_eq!(ctx.device().live_allocations(), 1);
}

#[test]
fn concurrent_requests_on_separate_buffers_are_independent() {
    let mut ctx = context_with(CpuDevice::new().with_transfer_latency(1));
    let a = ctx.create_append::<u32>(200).unwrap();
    let b = ctx.create_append::<u32>(200).unwrap();
    fill(&mut ctx, &a, 100);
    fill(&mut ctx, &b, 37);

    let (seen_a, sink_a) = recorder();
    let (seen_b, sink_b) = recorder();
    ctx.append_count_async(&a, None, sink_a).unwrap();
    ctx.append_count_async(&b, None, sink_b).unwrap();
    assert_eq!(ctx.in_flight(), 2);

    ctx.poll(PollMode::Wait).unwrap();
    assert_eq!(*seen_a.lock().unwrap(), vec![Ok(100)]);
    assert_eq!(*seen_b.lock().unwrap(), vec![Ok(37)]);
    assert_eq!(ctx.device().live_allocations(), 2);
}

#[test]
fn content_failure_still_invokes_callback() {
    let mut ctx = cpu_context();
    let buffer = ctx.create_structured_from(&[1u32, 2, 3]).unwrap();
    ctx.device_mut().fail_next_transfers(1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ctx.buffer_contents_async::<u32, _>(&buffer, move |contents| {
        sink.lock().unwrap().push(contents);
    })
    .unwrap();
    ctx.poll(PollMode::Wait).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].is_err());
}

#[test]
fn content_readback_matches_upload() {
    let mut ctx = cpu_context();
    let data: Vec<[f32; 4]> = (0..10).map(|i| [i as f32, 0.5, -1.0, 2.0]).collect();
    let buffer = ctx.create_structured_from(&data).unwrap();

    assert_eq!(ctx.buffer_contents::<[f32; 4]>(&buffer).unwrap(), data);

    let handle = ctx.request_buffer_contents::<[f32; 4]>(&buffer).unwrap();
    assert_eq!(ctx.wait(handle).unwrap(), data);

    let err = ctx.buffer_contents::<f32>(&buffer).unwrap_err();
    assert!(matches!(err, ComputeError::StrideMismatch { .. }));
}

#[test]
fn handles_resolve_through_polling() {
    let mut ctx = context_with(CpuDevice::new().with_transfer_latency(2));
    let append = ctx.create_append::<u32>(128).unwrap();
    fill(&mut ctx, &append, 77);

    let mut handle = ctx.request_append_count(&append, None).unwrap();
    assert!(handle.try_take().is_none());
    ctx.poll(PollMode::Poll).unwrap();
    assert!(handle.try_take().is_none());
    ctx.poll(PollMode::Wait).unwrap();
    assert_eq!(handle.try_take(), Some(Ok(77)));

    let handle = ctx.request_append_count(&append, None).unwrap();
    assert_eq!(ctx.wait(handle).unwrap(), 77);

    let handle = ctx.request_append_count(&append, None).unwrap();
    ctx.poll(PollMode::Wait).unwrap();
    assert_eq!(pollster::block_on(handle), Ok(77));
}

#[test]
fn dropping_the_context_completes_in_flight_reads() {
    let mut ctx = context_with(CpuDevice::new().with_transfer_latency(5));
    let append = ctx.create_append::<u32>(8).unwrap();
    fill(&mut ctx, &append, 3);

    let (seen, sink) = recorder();
    ctx.append_count_async(&append, None, sink).unwrap();
    let mut handle = ctx.request_append_count(&append, None).unwrap();
    assert_eq!(ctx.in_flight(), 2);

    drop(ctx);
    assert_eq!(*seen.lock().unwrap(), vec![Ok(3)]);
    assert_eq!(handle.try_take(), Some(Ok(3)));
}

#[test]
fn counter_reset_between_frames() {
    let mut ctx = cpu_context();
    let append = ctx.create_append::<u32>(64).unwrap();
    let count = ctx.create_count().unwrap();

    let mut observed = Vec::new();
    for n in [10u32, 3, 0, 64] {
        ctx.reset_counter(&append, 0).unwrap();
        fill(&mut ctx, &append, n);
        let handle = ctx.request_append_count(&append, Some(&count)).unwrap();
        observed.push(ctx.wait(handle).unwrap());
    }
    assert_eq!(observed, vec![10, 3, 0, 64]);
}
