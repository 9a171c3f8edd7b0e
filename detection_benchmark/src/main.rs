#![deny(unsafe_op_in_unsafe_fn)]

//! Flush+Reload detection demo: calibrates against the local cache
//! subsystem, lets a simulated victim walk over a line pattern, probes
//! every line and reports how much of the pattern was recovered.
//!
//! All human-readable formatting lives here; the library crates only
//! produce numbers.

use cache_timing::calibration::{calibrate, counter_overhead, CalibrationResult};
use cache_timing::{CacheTimer, CycleCounter};
use clap::Parser;
use detection::{
    run_session, sample_distribution, AccessPattern, AccuracyReport, DetectionResult,
    SessionConfig, TargetBuffer,
};
use flush_reload::FlushReloadProber;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::time::Instant;

/// Default victim walk: which of the 16 lines the simulated victim
/// touches when no seed is given.
const REFERENCE_PATTERN: [bool; 16] = [
    true, false, true, true, false, false, true, false, true, false, false, true, true, false,
    true, false,
];

#[derive(Parser, Debug)]
#[command(about = "Flush+Reload cache line access detection demo")]
struct Args {
    /// Number of cache lines to probe.
    #[arg(long, default_value_t = detection::DEFAULT_NUM_LINES)]
    lines: usize,

    /// Cache line size in bytes (must be a power of two).
    #[arg(long, default_value_t = detection::DEFAULT_LINE_SIZE)]
    line_size: usize,

    /// Hit/miss sample pairs used to establish the threshold.
    #[arg(long, default_value_t = cache_timing::calibration::DEFAULT_CALIBRATION_SAMPLES)]
    calibration_samples: u32,

    /// Samples per timing distribution shown at the end.
    #[arg(long, default_value_t = detection::DEFAULT_DISTRIBUTION_SAMPLES)]
    distribution_samples: u32,

    /// Pin the run to this core before measuring.
    #[arg(long)]
    pin_core: Option<usize>,

    /// Use a seeded random victim pattern instead of the reference one.
    #[arg(long)]
    seed: Option<u64>,

    /// Dump the raw results as JSON instead of the formatted report.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    config: SessionConfig,
    barrier_overhead_cycles: u64,
    calibration: CalibrationResult,
    pattern: &'a [bool],
    detection: &'a DetectionResult,
    accuracy: AccuracyReport,
    accessed_distribution: &'a [u64],
    silent_distribution: &'a [u64],
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) -> Result<(), nix::errno::Errno> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) -> Result<(), std::io::Error> {
    log::warn!("core pinning is not supported on this platform");
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn make_timer(buffer: &TargetBuffer, line_size: usize) -> cache_timing::x86_64::TscTimer {
    let mut timer = cache_timing::x86_64::TscTimer::new(line_size);
    timer.set_span(buffer.as_slice());
    timer
}

#[cfg(target_arch = "arm")]
fn make_timer(_buffer: &TargetBuffer, _line_size: usize) -> cache_timing::armv7::PmuTimer {
    cache_timing::armv7::PmuTimer::new()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "arm")))]
fn make_timer(_buffer: &TargetBuffer, line_size: usize) -> cache_timing::stub::StubTimer {
    log::warn!("no hardware backend for this architecture, running the deterministic stub");
    cache_timing::stub::StubTimer::new(10, 200, line_size)
}

fn run<T: CacheTimer + CycleCounter>(
    timer: &mut T,
    buffer: &TargetBuffer,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SessionConfig {
        num_lines: args.lines,
        line_size: args.line_size,
        calibration_samples: args.calibration_samples,
        distribution_samples: args.distribution_samples,
    };

    // Counter sanity check: a barrier bracketed by counter reads, with a
    // coarse wall-clock reference next to it.
    let overhead = counter_overhead(&*timer, &*timer);
    let coarse = Instant::now();
    timer.barrier();
    let coarse_ns = coarse.elapsed().as_nanos();

    let calibration =
        unsafe { calibrate(timer, buffer.line(0), config.calibration_samples) };

    let pattern = match args.seed {
        Some(seed) => AccessPattern::random(&mut StdRng::seed_from_u64(seed), config.num_lines),
        None if config.num_lines == REFERENCE_PATTERN.len() => {
            AccessPattern::from(REFERENCE_PATTERN)
        }
        None => AccessPattern::random(&mut rand::rng(), config.num_lines),
    };

    let prober = FlushReloadProber::new(calibration);
    let result = run_session(timer, buffer, &pattern, &prober)?;

    let accessed =
        sample_distribution(timer, buffer, 0, true, config.distribution_samples);
    let silent = sample_distribution(
        timer,
        buffer,
        1usize.min(buffer.num_lines() - 1),
        false,
        config.distribution_samples,
    );

    if args.json {
        let report = Report {
            config,
            barrier_overhead_cycles: overhead,
            calibration,
            pattern: pattern.as_slice(),
            detection: &result.detection,
            accuracy: result.accuracy,
            accessed_distribution: &accessed,
            silent_distribution: &silent,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== Flush+Reload cache line access detection ===");
    println!();
    println!("Barrier overhead: {} cycles ({} ns coarse reference)", overhead, coarse_ns);
    println!();
    println!("Calibration ({} sample pairs):", config.calibration_samples);
    println!("  average hit:  {:8.2} cycles", calibration.average_hit);
    println!("  average miss: {:8.2} cycles", calibration.average_miss);
    println!("  threshold:    {:8.2} cycles (midpoint)", calibration.threshold);
    println!(
        "  separation:   {:8.2} cycles, {} samples discarded",
        calibration.separation(),
        calibration.discarded
    );
    if !calibration.separated() {
        println!("  WARNING: miss is not slower than hit, detection will be noise");
    }
    println!();
    println!("Victim pattern: {:?}", pattern.as_slice());
    println!();
    for (i, (&hit, &cycles)) in result
        .detection
        .detected
        .iter()
        .zip(result.detection.latencies.iter())
        .enumerate()
    {
        let actual = pattern.get(i);
        println!(
            "  line {:2}: {} ({:4} cycles) detected={:5} actual={:5} {}",
            i,
            if hit { "HIT " } else { "MISS" },
            cycles,
            hit,
            actual,
            if hit == actual { "ok" } else { "WRONG" }
        );
    }
    println!();
    println!(
        "Accuracy: {}/{} ({:.1}%)",
        result.accuracy.correct, result.accuracy.total, result.accuracy.percentage
    );
    println!();
    println!("Reload distribution, victim accessed (should be fast):");
    for (i, cycles) in accessed.iter().enumerate() {
        println!("  sample {:2}: {} cycles", i + 1, cycles);
    }
    println!("Reload distribution, victim silent (should be slow):");
    for (i, cycles) in silent.iter().enumerate() {
        println!("  sample {:2}: {} cycles", i + 1, cycles);
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    if let Some(core) = args.pin_core {
        pin_to_core(core)?;
    }

    let buffer = TargetBuffer::new(args.lines, args.line_size)?;
    let mut timer = make_timer(&buffer, args.line_size);
    run(&mut timer, &buffer, &args)
}
