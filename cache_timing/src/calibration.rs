//! Hit/miss latency calibration.
//!
//! Repeated matched pairs of a warmed and a flushed timed access on one
//! reference line, averaged into a decision threshold. Averaging soaks up
//! per-sample jitter without needing a distribution model; the midpoint is
//! the decision boundary between two roughly symmetric populations.

use crate::{CacheTimer, CycleCounter};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CALIBRATION_SAMPLES: u32 = 100;

/// Durations at or above this are treated as counter wraparound (or a
/// preemption of similar magnitude) and excluded from the averages. Far
/// beyond any plausible miss latency.
pub const SPURIOUS_CUTOFF: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub average_hit: f64,
    pub average_miss: f64,
    pub threshold: f64,
    /// Requested sample pairs.
    pub samples: u32,
    /// Measurements excluded as wraparound outliers.
    pub discarded: u32,
}

impl CalibrationResult {
    /// False when the platform's cache/counter resolution cannot support
    /// line-granularity detection at this sample count. Diagnostic, the
    /// caller decides whether to retry with more samples or give up.
    pub fn separated(&self) -> bool {
        self.average_miss > self.average_hit
    }

    pub fn separation(&self) -> f64 {
        self.average_miss - self.average_hit
    }
}

/// Measures `samples` hit/miss pairs on `reference` and returns the
/// averages and their midpoint.
///
/// # Safety
///
/// `reference` must be a valid pointer to read.
pub unsafe fn calibrate<T: CacheTimer>(
    timer: &mut T,
    reference: *const u8,
    samples: u32,
) -> CalibrationResult {
    let mut hit_sum: u64 = 0;
    let mut miss_sum: u64 = 0;
    let mut hits_kept: u32 = 0;
    let mut misses_kept: u32 = 0;
    let mut discarded: u32 = 0;

    for _ in 0..samples {
        // Hit: prime the line, then time a read of it.
        unsafe { timer.touch(reference) };
        timer.barrier();
        let hit = unsafe { timer.timed_access(reference) };

        // Miss: evict everything, then time the same read.
        timer.flush_all();
        timer.barrier();
        let miss = unsafe { timer.timed_access(reference) };

        if hit < SPURIOUS_CUTOFF {
            hit_sum += hit;
            hits_kept += 1;
        } else {
            discarded += 1;
        }
        if miss < SPURIOUS_CUTOFF {
            miss_sum += miss;
            misses_kept += 1;
        } else {
            discarded += 1;
        }
    }

    let average_hit = hit_sum as f64 / hits_kept.max(1) as f64;
    let average_miss = miss_sum as f64 / misses_kept.max(1) as f64;
    let result = CalibrationResult {
        average_hit,
        average_miss,
        threshold: (average_hit + average_miss) / 2.0,
        samples,
        discarded,
    };

    debug!(
        "calibration: hit {:.2}, miss {:.2}, threshold {:.2}, discarded {}",
        result.average_hit, result.average_miss, result.threshold, result.discarded
    );
    if !result.separated() {
        warn!(
            "calibration failed to separate hit ({:.2}) from miss ({:.2})",
            result.average_hit, result.average_miss
        );
    }

    result
}

/// Cost of a barrier bracketed by two counter reads. Diagnostic only, the
/// protocol never subtracts it.
pub fn counter_overhead<C: CycleCounter, T: CacheTimer>(counter: &C, timer: &T) -> u64 {
    let start = counter.read();
    timer.barrier();
    counter.read().wrapping_sub(start)
}

#[cfg(test)]
mod tests {
    use super::{calibrate, counter_overhead, SPURIOUS_CUTOFF};
    use crate::stub::StubTimer;

    const LINE: usize = 32;
    const REF: *const u8 = 0x8000 as *const u8;

    #[test]
    fn averages_and_midpoint() {
        let mut t = StubTimer::new(10, 200, LINE);
        let r = unsafe { calibrate(&mut t, REF, 100) };
        assert_eq!(r.average_hit, 10.0);
        assert_eq!(r.average_miss, 200.0);
        assert_eq!(r.threshold, (r.average_hit + r.average_miss) / 2.0);
        assert_eq!(r.threshold, 105.0);
        assert_eq!(r.samples, 100);
        assert_eq!(r.discarded, 0);
        assert!(r.separated());
    }

    #[test]
    fn single_sample_is_enough() {
        let mut t = StubTimer::new(7, 40, LINE);
        let r = unsafe { calibrate(&mut t, REF, 1) };
        assert!(r.average_hit >= 0.0);
        assert!(r.average_miss >= 0.0);
        assert_eq!(r.threshold, (7.0 + 40.0) / 2.0);
    }

    #[test]
    fn deterministic_under_fixed_inputs() {
        let mut a = StubTimer::new(12, 180, LINE);
        let mut b = StubTimer::new(12, 180, LINE);
        let ra = unsafe { calibrate(&mut a, REF, 50) };
        let rb = unsafe { calibrate(&mut b, REF, 50) };
        assert_eq!(ra, rb);
    }

    #[test]
    fn unseparated_platform_is_reported_not_fatal() {
        let mut t = StubTimer::new(50, 50, LINE);
        let r = unsafe { calibrate(&mut t, REF, 20) };
        assert!(!r.separated());
        assert_eq!(r.separation(), 0.0);
    }

    #[test]
    fn wrapped_reading_is_discarded() {
        let mut t = StubTimer::new(10, 200, LINE);
        t.inject_wrapped_reading(SPURIOUS_CUTOFF + 12345);
        let r = unsafe { calibrate(&mut t, REF, 100) };
        // the wrapped sample hits the first timed access (a hit slot)
        assert_eq!(r.discarded, 1);
        assert_eq!(r.average_hit, 10.0);
        assert_eq!(r.average_miss, 200.0);
    }

    #[test]
    fn overhead_of_stub_barrier_is_zero() {
        let t = StubTimer::new(10, 200, LINE);
        assert_eq!(counter_overhead(&t, &t), 0);
    }
}
