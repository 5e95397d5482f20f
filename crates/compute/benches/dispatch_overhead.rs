//! Host-side overhead of dispatch, blocking counts and async counts on the
//! CPU device.
//!
//! Run with: cargo bench -p compute --bench dispatch_overhead

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use compute::{ComputeContext, CpuDevice, KernelCall, PollMode};

const GROUP: i32 = 64;

fn main() {
    println!("=== Dispatch / readback overhead (CPU device) ===\n");

    let mut device = CpuDevice::new();
    device.register_kernel("append_even", [GROUP as u32, 1, 1], |inv| {
        let limit = inv.params::<u32>().unwrap_or(0);
        let i = inv.index();
        if i < limit && i % 2 == 0 {
            inv.append(0, i);
        }
    });
    let mut ctx = ComputeContext::new(device);

    println!(
        "{:>10} {:>8} {:>14} {:>14} {:>14}",
        "Items", "Frames", "dispatch us", "blocking us", "async us"
    );

    for &(n, frames) in &[(1_000u32, 200), (10_000, 100), (100_000, 20), (1_000_000, 5)] {
        let mut append = ctx.create_append::<u32>(n as usize).expect("allocation");
        let mut count = ctx.create_count().expect("allocation");
        let call = KernelCall::new("append_even").bind(&append).params(&n);

        let mut dispatch_us = 0u128;
        let mut blocking_us = 0u128;
        let mut async_us = 0u128;
        let total = Arc::new(AtomicU64::new(0));

        for _ in 0..frames {
            ctx.reset_counter(&append, 0).expect("reset");

            let t = Instant::now();
            ctx.dispatch(&call, n as i32, GROUP).expect("dispatch");
            dispatch_us += t.elapsed().as_micros();

            let t = Instant::now();
            let blocking = ctx.append_count(&append, Some(&count)).expect("count");
            blocking_us += t.elapsed().as_micros();

            let t = Instant::now();
            let sink = Arc::clone(&total);
            ctx.append_count_async(&append, None, move |c| {
                sink.fetch_add(c.unwrap_or(0) as u64, Ordering::Relaxed);
            })
            .expect("async count");
            ctx.poll(PollMode::Wait).expect("poll");
            async_us += t.elapsed().as_micros();

            assert_eq!(blocking, n.div_ceil(2));
        }
        assert_eq!(total.load(Ordering::Relaxed), n.div_ceil(2) as u64 * frames as u64);

        let per = |us: u128| us as f64 / frames as f64;
        println!(
            "{:>10} {:>8} {:>14.1} {:>14.1} {:>14.1}",
            n,
            frames,
            per(dispatch_us),
            per(blocking_us),
            per(async_us)
        );

        drop(call);
        ctx.release_all([&mut append, &mut count]);
    }
}
