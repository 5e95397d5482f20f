//! Conformance binary entry point
//!
//! Runs the conformance suite on the CPU device and, when built with the
//! `gpu` feature and an adapter is present, on the wgpu device.

use reference_tests::{cpu_context, run_suite, SuiteResult};

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    tracing::info!("Compute Conformance Suite");
    tracing::info!("=========================");

    let mut results: Vec<SuiteResult> = Vec::new();

    let mut cpu = cpu_context();
    results.push(run_suite(&mut cpu));

    #[cfg(feature = "gpu")]
    match reference_tests::gpu_context() {
        Some(mut gpu) => results.push(run_suite(&mut gpu)),
        None => tracing::warn!("No usable GPU adapter, skipping GPU backend"),
    }

    for result in &results {
        result.print_summary();
    }

    let failed_count = results.iter().filter(|r| !r.passed).count();

    // Print overall summary
    println!("\n{}", "=".repeat(80));
    println!("OVERALL SUMMARY");
    println!("{}", "=".repeat(80));
    println!("Backends: {}", results.len());
    println!("Passed: {}", results.len() - failed_count);
    println!("Failed: {}", failed_count);
    println!("{}", "=".repeat(80));

    // Exit with error code if any backend failed
    if failed_count > 0 {
        std::process::exit(1);
    }
}
