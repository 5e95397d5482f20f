//! Backend conformance suite for the compute layer
//!
//! Every [`ComputeDevice`] must give the same observable behaviour for
//! dispatch planning, append counts, readback delivery and buffer release.
//! The cases here run against any device that has the `append_each` kernel
//! registered (see [`cpu_context`] and, with the `gpu` feature,
//! [`gpu_context`]).


#[cfg(test)]
mod gpu_tests;

use compute::{
    ComputeContext, ComputeDevice, ComputeError, ComputeResult, CountReadback, CpuDevice,
    ExecutionGrid, GpuBuffer, KernelCall, PollMode,
};
use std::sync::{Arc, Mutex};

/// Name of the kernel every conformance context must provide.
pub const APPEND_EACH: &str = "append_each";

/// Threads per group the suite dispatches with.
pub const GROUP_SIZE: i32 = 64;

/// Outcome of a single case: a note on success, the reason on failure.
pub type CaseOutcome = Result<String, String>;

/// A conformance case
pub struct ConformanceCase<D: ComputeDevice> {
    /// Case name
    pub name: &'static str,
    /// Case body; must release everything it allocates
    pub run: fn(&mut ComputeContext<D>) -> CaseOutcome,
}

/// Result of an individual case
#[derive(Debug)]
pub struct CheckResult {
    /// Case name
    pub name: String,
    /// Whether case passed
    pub passed: bool,
    /// Note or failure reason
    pub message: Option<String>,
}

/// Result of running the suite on one backend
#[derive(Debug)]
pub struct SuiteResult {
    /// Backend name as reported by the device
    pub backend: String,
    /// Whether every case passed
    pub passed: bool,
    /// Per-case results
    pub checks: Vec<CheckResult>,
}

/// CPU context with [`APPEND_EACH`] registered.
pub fn cpu_context() -> ComputeContext<CpuDevice> {
    let mut device = CpuDevice::new().with_transfer_latency(1);
    device.register_kernel(APPEND_EACH, [GROUP_SIZE as u32, 1, 1], |inv| {
        let limit = inv.params::<u32>().unwrap_or(0);
        if inv.index() < limit {
            inv.append(0, inv.index());
        }
    });
    ComputeContext::new(device)
}

/// wgpu context with [`APPEND_EACH`] registered, or `None` when no adapter
/// can be initialized.
#[cfg(feature = "gpu")]
pub fn gpu_context() -> Option<ComputeContext<compute::WgpuDevice>> {
    use compute::{KernelSource, WgpuDevice};

    if !compute::gpu_available() {
        return None;
    }
    let mut device = match WgpuDevice::new() {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!("GPU init failed: {}", e);
            return None;
        }
    };
    let source = KernelSource::new(include_str!("shaders/append_each.wgsl"), APPEND_EACH).read_write();
    if let Err(e) = device.register_kernel(APPEND_EACH, &source) {
        tracing::warn!("Failed to compile {}: {}", APPEND_EACH, e);
        return None;
    }
    Some(ComputeContext::new(device))
}

/// Every conformance case, in run order.
pub fn all_cases<D: ComputeDevice>() -> Vec<ConformanceCase<D>> {
    vec![
        ConformanceCase { name: "Dispatch Coverage", run: dispatch_coverage },
        ConformanceCase { name: "Empty Domain", run: empty_domain },
        ConformanceCase { name: "Invalid Group Size", run: invalid_group_size },
        ConformanceCase { name: "Count Saturation", run: count_saturation },
        ConformanceCase { name: "Supplied Count Buffer", run: supplied_count_buffer },
        ConformanceCase { name: "Async Exactly Once", run: async_exactly_once },
        ConformanceCase { name: "Concurrent Async Counts", run: concurrent_async_counts },
        ConformanceCase { name: "Counter Reset", run: counter_reset },
        ConformanceCase { name: "Content Round Trip", run: content_round_trip },
        ConformanceCase { name: "Release", run: release },
    ]
}

/// Runs `cases` in order and checks that none of them leaks allocations.
pub fn run_cases<D: ComputeDevice>(
    ctx: &mut ComputeContext<D>,
    cases: &[ConformanceCase<D>],
) -> SuiteResult {
    let backend = ctx.device().name().to_string();
    tracing::info!("Running {} conformance cases on {}", cases.len(), backend);

    let mut checks = Vec::with_capacity(cases.len());
    for case in cases {
        let before = ctx.device().live_allocations();
        let outcome = (case.run)(ctx);
        // Anything the case left in flight must not outlive it.
        let drained = ctx.poll(PollMode::Wait).map_err(|e| e.to_string());
        let leaked = ctx.device().live_allocations().saturating_sub(before);

        let check = match (outcome, drained) {
            (Err(reason), _) => CheckResult {
                name: case.name.to_string(),
                passed: false,
                message: Some(reason),
            },
            (Ok(_), Err(reason)) => CheckResult {
                name: case.name.to_string(),
                passed: false,
                message: Some(format!("draining readbacks failed: {}", reason)),
            },
            (Ok(_), Ok(_)) if leaked > 0 => CheckResult {
                name: case.name.to_string(),
                passed: false,
                message: Some(format!("{} allocations leaked", leaked)),
            },
            (Ok(note), Ok(_)) => CheckResult {
                name: case.name.to_string(),
                passed: true,
                message: (!note.is_empty()).then_some(note),
            },
        };
        if !check.passed {
            tracing::warn!("{} failed on {}", check.name, backend);
        }
        checks.push(check);
    }

    SuiteResult {
        passed: checks.iter().all(|c| c.passed),
        backend,
        checks,
    }
}

/// Runs [`all_cases`] against `ctx`.
pub fn run_suite<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> SuiteResult {
    run_cases(ctx, &all_cases())
}

impl SuiteResult {
    /// Number of passing cases
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// Print a summary of the suite result
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(80));
        println!("Backend: {}", self.backend);
        println!("{}", "=".repeat(80));
        println!("Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        println!("Cases: {}/{} passed", self.passed_count(), self.checks.len());
        println!("\nChecks:");
        for check in &self.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            print!("  [{}] {}", status, check.name);
            if let Some(ref msg) = check.message {
                print!(" - {}", msg);
            }
            println!();
        }
        println!("{}", "=".repeat(80));
    }
}

// ---------------------------------------------------------------------------
// Cases
// ---------------------------------------------------------------------------

fn op<T>(what: &str, result: ComputeResult<T>) -> Result<T, String> {
    result.map_err(|e| format!("{}: {}", what, e))
}

fn expect_eq<T: PartialEq + std::fmt::Debug>(what: &str, got: T, want: T) -> Result<(), String> {
    if got == want {
        Ok(())
    } else {
        Err(format!("{}: expected {:?}, got {:?}", what, want, got))
    }
}

/// Appends `n` indices to `append`.
fn fill<D: ComputeDevice>(
    ctx: &mut ComputeContext<D>,
    append: &GpuBuffer,
    n: u32,
) -> Result<Option<ExecutionGrid>, String> {
    let call = KernelCall::new(APPEND_EACH).bind(append).params(&n);
    op("dispatch", ctx.dispatch(&call, n as i32, GROUP_SIZE))
}

/// Runs `body` with freshly created buffers and releases them afterwards,
/// whatever the outcome.
fn with_buffers<D, F>(ctx: &mut ComputeContext<D>, mut buffers: Vec<GpuBuffer>, body: F) -> CaseOutcome
where
    D: ComputeDevice,
    F: FnOnce(&mut ComputeContext<D>, &[GpuBuffer]) -> CaseOutcome,
{
    let outcome = body(ctx, &buffers);
    ctx.release_all(buffers.iter_mut());
    outcome
}

fn recorder() -> (Arc<Mutex<Vec<CountReadback>>>, impl FnOnce(CountReadback) + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |count| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(count);
        }
    })
}

fn recorded(seen: &Mutex<Vec<CountReadback>>) -> Vec<CountReadback> {
    seen.lock().map(|s| s.clone()).unwrap_or_default()
}

fn dispatch_coverage<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let append = op("create", ctx.create_append::<u32>(1000))?;
    with_buffers(ctx, vec![append], |ctx, b| {
        let grid = fill(ctx, &b[0], 500)?;
        expect_eq("grid", grid, Some(ExecutionGrid::new(8, 1, 1)))?;
        expect_eq("count", op("count", ctx.append_count(&b[0], None))?, 500)?;

        let mut items: Vec<u32> = op("contents", ctx.buffer_contents(&b[0]))?;
        items.truncate(500);
        items.sort_unstable();
        if !items.iter().copied().eq(0..500) {
            return Err("appended indices are not exactly 0..500".to_string());
        }
        Ok("500 items in 8 groups".to_string())
    })
}

fn empty_domain<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let append = op("create", ctx.create_append::<u32>(16))?;
    with_buffers(ctx, vec![append], |ctx, b| {
        expect_eq("zero extent", fill(ctx, &b[0], 0)?, None)?;
        let call = KernelCall::new(APPEND_EACH).bind(&b[0]).params(&16u32);
        expect_eq("flat planar extent", op("dispatch", ctx.dispatch(&call, (16, 0), 8))?, None)?;
        expect_eq("count", op("count", ctx.append_count(&b[0], None))?, 0)?;
        Ok(String::new())
    })
}

fn invalid_group_size<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let append = op("create", ctx.create_append::<u32>(16))?;
    with_buffers(ctx, vec![append], |ctx, b| {
        let call = KernelCall::new(APPEND_EACH).bind(&b[0]).params(&16u32);
        for group_size in [0, -64] {
            match ctx.dispatch(&call, 0, group_size) {
                Err(ComputeError::InvalidGroupSize(g)) if g == group_size => {}
                other => return Err(format!("group size {}: got {:?}", group_size, other.map(|_| ()))),
            }
        }
        expect_eq("count", op("count", ctx.append_count(&b[0], None))?, 0)?;
        Ok(String::new())
    })
}

fn count_saturation<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let append = op("create", ctx.create_append::<u32>(100))?;
    with_buffers(ctx, vec![append], |ctx, b| {
        fill(ctx, &b[0], 340)?;
        expect_eq("blocking count", op("count", ctx.append_count(&b[0], None))?, 100)?;

        let (seen, sink) = recorder();
        op("async count", ctx.append_count_async(&b[0], None, sink))?;
        op("poll", ctx.poll(PollMode::Wait))?;
        expect_eq("async count", recorded(&seen), vec![Ok(100)])?;
        Ok("340 appends clamp to 100".to_string())
    })
}

fn supplied_count_buffer<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let append = op("create", ctx.create_append::<u32>(64))?;
    let count = op("create", ctx.create_count())?;
    with_buffers(ctx, vec![append, count], |ctx, b| {
        fill(ctx, &b[0], 12)?;
        let live = ctx.device().live_allocations();
        expect_eq("count", op("count", ctx.append_count(&b[0], Some(&b[1])))?, 12)?;
        expect_eq("count buffer", op("contents", ctx.buffer_contents::<u32>(&b[1]))?, vec![12])?;
        expect_eq("live allocations", ctx.device().live_allocations(), live)?;
        Ok(String::new())
    })
}

fn async_exactly_once<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let append = op("create", ctx.create_append::<u32>(1000))?;
    with_buffers(ctx, vec![append], |ctx, b| {
        fill(ctx, &b[0], 500)?;
        let (seen, sink) = recorder();
        op("async count", ctx.append_count_async(&b[0], None, sink))?;
        if !recorded(&seen).is_empty() {
            return Err("callback ran before poll".to_string());
        }

        op("poll", ctx.poll(PollMode::Wait))?;
        op("poll", ctx.poll(PollMode::Wait))?;
        op("poll", ctx.poll(PollMode::Poll))?;
        expect_eq("deliveries", recorded(&seen), vec![Ok(500)])?;
        expect_eq("in flight", ctx.in_flight(), 0)?;
        Ok(String::new())
    })
}

fn concurrent_async_counts<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let a = op("create", ctx.create_append::<u32>(200))?;
    let b = op("create", ctx.create_append::<u32>(200))?;
    with_buffers(ctx, vec![a, b], |ctx, b| {
        fill(ctx, &b[0], 100)?;
        fill(ctx, &b[1], 37)?;

        let (seen_a, sink_a) = recorder();
        let (seen_b, sink_b) = recorder();
        op("async count", ctx.append_count_async(&b[0], None, sink_a))?;
        op("async count", ctx.append_count_async(&b[1], None, sink_b))?;
        op("poll", ctx.poll(PollMode::Wait))?;

        expect_eq("first", recorded(&seen_a), vec![Ok(100)])?;
        expect_eq("second", recorded(&seen_b), vec![Ok(37)])?;
        Ok(String::new())
    })
}

fn counter_reset<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let append = op("create", ctx.create_append::<u32>(64))?;
    with_buffers(ctx, vec![append], |ctx, b| {
        let mut observed = Vec::new();
        for n in [10u32, 3, 0, 64] {
            op("reset", ctx.reset_counter(&b[0], 0))?;
            fill(ctx, &b[0], n)?;
            let handle = op("request", ctx.request_append_count(&b[0], None))?;
            observed.push(op("wait", ctx.wait(handle))?);
        }
        expect_eq("per-frame counts", observed, vec![10, 3, 0, 64])?;

        op("reset", ctx.reset_counter(&b[0], 6))?;
        expect_eq("preset counter", op("count", ctx.append_count(&b[0], None))?, 6)?;
        Ok(String::new())
    })
}

fn content_round_trip<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let data: Vec<[f32; 4]> = (0..33).map(|i| [i as f32, 0.5, -1.0, 2.0]).collect();
    let buffer = op("create", ctx.create_structured_from(&data))?;
    with_buffers(ctx, vec![buffer], |ctx, b| {
        expect_eq("blocking", op("contents", ctx.buffer_contents::<[f32; 4]>(&b[0]))?, data.clone())?;
        let handle = op("request", ctx.request_buffer_contents::<[f32; 4]>(&b[0]))?;
        expect_eq("async", op("wait", ctx.wait(handle))?, data)?;
        Ok(String::new())
    })
}

fn release<D: ComputeDevice>(ctx: &mut ComputeContext<D>) -> CaseOutcome {
    let before = ctx.device().live_allocations();
    let mut a = op("create", ctx.create_structured::<u32>(8))?;
    let b = op("create", ctx.create_append::<u32>(8))?;
    let c = op("create", ctx.create_count())?;

    if !ctx.release(&mut a) || ctx.release(&mut a) {
        return Err("release is not idempotent".to_string());
    }
    let mut slots = [Some(b), None, Some(c)];
    let report = ctx.release_slots(slots.iter_mut());
    expect_eq("released", report.released, 2)?;
    expect_eq("skipped", report.skipped, 1)?;
    expect_eq("live allocations", ctx.device().live_allocations(), before)?;
    Ok(String::new())
}
