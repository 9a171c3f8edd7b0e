#![deny(unsafe_op_in_unsafe_fn)]

//! Detection sessions: drive the Flush+Reload prober across a buffer of
//! cache lines against a known ground-truth access pattern and score the
//! result.
//!
//! Control flow is strictly sequential and single-threaded. A preempting
//! task would pollute the cache mid-window, so callers on multi-tasking
//! systems must pin the run to one core (the benchmark binary does).

use cache_timing::CacheTimer;
use flush_reload::{probe, simulate_victim_access, FlushReloadProber};
use log::{info, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::slice::from_raw_parts;
use thiserror::Error;

pub const PAGE_LEN: usize = 1 << 12;

// Cortex-A7 L1D geometry of the reference platform.
pub const DEFAULT_LINE_SIZE: usize = 32;
pub const DEFAULT_NUM_LINES: usize = 16;
pub const DEFAULT_DISTRIBUTION_SAMPLES: u32 = 10;

const_assert!(DEFAULT_LINE_SIZE.is_power_of_two());
const_assert!(DEFAULT_NUM_LINES * DEFAULT_LINE_SIZE <= PAGE_LEN);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("access pattern has {pattern} entries but the target buffer has {lines} lines")]
    PatternLengthMismatch { pattern: usize, lines: usize },
    #[error("access pattern is empty")]
    EmptyPattern,
    #[error("detection result has {detected} entries but the ground truth has {expected}")]
    LengthMismatch { detected: usize, expected: usize },
    #[error("invalid buffer geometry: {lines} lines of {line_size} bytes")]
    InvalidGeometry { lines: usize, line_size: usize },
}

/// Session parameters, with the reference platform's values as defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub num_lines: usize,
    pub line_size: usize,
    pub calibration_samples: u32,
    pub distribution_samples: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            num_lines: DEFAULT_NUM_LINES,
            line_size: DEFAULT_LINE_SIZE,
            calibration_samples: cache_timing::calibration::DEFAULT_CALIBRATION_SAMPLES,
            distribution_samples: DEFAULT_DISTRIBUTION_SAMPLES,
        }
    }
}

/// A page-aligned run of cache lines used purely as an addressable timing
/// target. Allocated once, never resized, contents never read for their
/// values.
#[derive(Debug)]
pub struct TargetBuffer {
    base: NonNull<u8>,
    layout: Layout,
    num_lines: usize,
    line_size: usize,
}

impl TargetBuffer {
    pub fn new(num_lines: usize, line_size: usize) -> Result<Self, SessionError> {
        if num_lines == 0 || !line_size.is_power_of_two() {
            return Err(SessionError::InvalidGeometry {
                lines: num_lines,
                line_size,
            });
        }
        let size = num_lines * line_size;
        let layout = Layout::from_size_align(size, PAGE_LEN)
            .map_err(|_| SessionError::InvalidGeometry {
                lines: num_lines,
                line_size,
            })?;
        let raw = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        // Touch every byte so the pages are actually backed before any
        // timing starts.
        for i in 0..size {
            unsafe { base.as_ptr().add(i).write(i as u8) };
        }
        Ok(TargetBuffer {
            base,
            layout,
            num_lines,
            line_size,
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, SessionError> {
        Self::new(config.num_lines, config.line_size)
    }

    pub fn num_lines(&self) -> usize {
        self.num_lines
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Start address of line `i`. Panics if `i` is out of bounds.
    pub fn line(&self, i: usize) -> *const u8 {
        assert!(i < self.num_lines);
        unsafe { self.base.as_ptr().add(i * self.line_size) as *const u8 }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.base.as_ptr(), self.num_lines * self.line_size) }
    }
}

impl Drop for TargetBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Ground truth: did the victim touch line `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPattern(Vec<bool>);

impl AccessPattern {
    pub fn new(pattern: Vec<bool>) -> Self {
        AccessPattern(pattern)
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Self {
        AccessPattern((0..len).map(|_| rng.random()).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, i: usize) -> bool {
        self.0[i]
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }
}

impl From<&[bool]> for AccessPattern {
    fn from(pattern: &[bool]) -> Self {
        AccessPattern(pattern.to_vec())
    }
}

impl<const N: usize> From<[bool; N]> for AccessPattern {
    fn from(pattern: [bool; N]) -> Self {
        AccessPattern(pattern.to_vec())
    }
}

/// Per-line verdicts, paired 1:1 by index with the access pattern, plus
/// the raw reload latencies they were derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detected: Vec<bool>,
    pub latencies: Vec<u64>,
}

impl DetectionResult {
    pub fn len(&self) -> usize {
        self.detected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detected.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub correct: usize,
    pub total: usize,
    pub percentage: f64,
}

impl AccuracyReport {
    /// Index-wise agreement between verdicts and ground truth.
    pub fn from_comparison(detected: &[bool], truth: &[bool]) -> Result<Self, SessionError> {
        if detected.len() != truth.len() {
            return Err(SessionError::LengthMismatch {
                detected: detected.len(),
                expected: truth.len(),
            });
        }
        let total = truth.len();
        let correct = detected
            .iter()
            .zip(truth.iter())
            .filter(|(d, t)| d == t)
            .count();
        let percentage = if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64 * 100.0
        };
        Ok(AccuracyReport {
            correct,
            total,
            percentage,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub detection: DetectionResult,
    pub accuracy: AccuracyReport,
}

/// Probes every line of `buffer` in order, with the simulated victim
/// taking its turn inside each probe window, and scores the verdicts
/// against `pattern`.
///
/// Lines are processed independently: the whole-cache flush at the start
/// of each probe erases whatever the previous line left behind. Inputs are
/// read-only from the session's perspective.
pub fn run_session<T: CacheTimer>(
    timer: &mut T,
    buffer: &TargetBuffer,
    pattern: &AccessPattern,
    prober: &FlushReloadProber,
) -> Result<SessionResult, SessionError> {
    if pattern.is_empty() {
        return Err(SessionError::EmptyPattern);
    }
    if pattern.len() != buffer.num_lines() {
        return Err(SessionError::PatternLengthMismatch {
            pattern: pattern.len(),
            lines: buffer.num_lines(),
        });
    }

    let mut detected = Vec::with_capacity(pattern.len());
    let mut latencies = Vec::with_capacity(pattern.len());
    for (i, &truth) in pattern.as_slice().iter().enumerate() {
        let addr = buffer.line(i);
        let (cycles, hit) = unsafe {
            prober.probe_and_classify(timer, addr, |t| simulate_victim_access(t, addr, truth))
        };
        trace!("line {:2}: {} cycles, detected={}", i, cycles, hit);
        detected.push(hit);
        latencies.push(cycles);
    }

    let accuracy = AccuracyReport::from_comparison(&detected, pattern.as_slice())?;
    info!(
        "session: {}/{} lines correct ({:.1}%)",
        accuracy.correct, accuracy.total, accuracy.percentage
    );
    Ok(SessionResult {
        detection: DetectionResult {
            detected,
            latencies,
        },
        accuracy,
    })
}

/// Raw reload latencies for repeated probes of one line, with the victim
/// either always touching it or never. Shows the variance behind the
/// averages; presentation of the samples is the caller's business.
pub fn sample_distribution<T: CacheTimer>(
    timer: &mut T,
    buffer: &TargetBuffer,
    line: usize,
    accessed: bool,
    samples: u32,
) -> Vec<u64> {
    let addr = buffer.line(line);
    (0..samples)
        .map(|_| unsafe { probe(timer, addr, |t| simulate_victim_access(t, addr, accessed)) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        run_session, sample_distribution, AccessPattern, AccuracyReport, SessionConfig,
        SessionError, TargetBuffer,
    };
    use cache_timing::calibration::calibrate;
    use cache_timing::stub::StubTimer;
    use flush_reload::FlushReloadProber;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const REFERENCE_PATTERN: [bool; 16] = [
        true, false, true, true, false, false, true, false, true, false, false, true, true, false,
        true, false,
    ];

    fn calibrated_prober(timer: &mut StubTimer, buffer: &TargetBuffer) -> FlushReloadProber {
        let calibration = unsafe { calibrate(timer, buffer.line(0), 100) };
        FlushReloadProber::new(calibration)
    }

    #[test]
    fn reference_scenario_is_detected_exactly() {
        let config = SessionConfig::default();
        let buffer = TargetBuffer::from_config(&config).unwrap();
        let mut timer = StubTimer::new(10, 200, config.line_size);
        let prober = calibrated_prober(&mut timer, &buffer);
        assert_eq!(prober.threshold(), 105.0);

        let pattern = AccessPattern::from(REFERENCE_PATTERN);
        let result = run_session(&mut timer, &buffer, &pattern, &prober).unwrap();

        assert_eq!(result.detection.detected, pattern.as_slice());
        assert_eq!(result.accuracy.correct, 16);
        assert_eq!(result.accuracy.total, 16);
        assert_eq!(result.accuracy.percentage, 100.0);
    }

    #[test]
    fn any_pattern_is_perfect_when_latencies_separate() {
        let buffer = TargetBuffer::new(32, 32).unwrap();
        let mut timer = StubTimer::new(30, 400, 32);
        let prober = calibrated_prober(&mut timer, &buffer);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..8 {
            let pattern = AccessPattern::random(&mut rng, 32);
            let result = run_session(&mut timer, &buffer, &pattern, &prober).unwrap();
            assert_eq!(result.accuracy.percentage, 100.0);
            assert_eq!(result.detection.detected, pattern.as_slice());
        }
    }

    #[test]
    fn indistinguishable_latencies_score_about_half() {
        // hit == miss: every reload takes 50 cycles against a threshold of
        // 50.0, so nothing is ever classified as a hit and accuracy is the
        // share of false entries in the pattern, ~50% for a balanced one.
        let buffer = TargetBuffer::new(512, 32).unwrap();
        let mut timer = StubTimer::new(50, 50, 32);
        let prober = calibrated_prober(&mut timer, &buffer);
        assert!(!prober.calibration().separated());

        let mut rng = StdRng::seed_from_u64(42);
        let pattern = AccessPattern::random(&mut rng, 512);
        let result = run_session(&mut timer, &buffer, &pattern, &prober).unwrap();
        assert!(
            result.accuracy.percentage > 35.0 && result.accuracy.percentage < 65.0,
            "accuracy {} not near 50%",
            result.accuracy.percentage
        );
    }

    #[test]
    fn session_does_not_mutate_its_inputs() {
        let buffer = TargetBuffer::new(16, 32).unwrap();
        let mut timer = StubTimer::new(10, 200, 32);
        let prober = calibrated_prober(&mut timer, &buffer);

        let pattern = AccessPattern::from(REFERENCE_PATTERN);
        let pattern_before = pattern.clone();
        let buffer_before = buffer.as_slice().to_vec();

        run_session(&mut timer, &buffer, &pattern, &prober).unwrap();

        assert_eq!(pattern, pattern_before);
        assert_eq!(buffer.as_slice(), &buffer_before[..]);
    }

    #[test]
    fn mismatched_pattern_is_rejected() {
        let buffer = TargetBuffer::new(16, 32).unwrap();
        let mut timer = StubTimer::new(10, 200, 32);
        let prober = calibrated_prober(&mut timer, &buffer);

        let pattern = AccessPattern::new(vec![true; 8]);
        let err = run_session(&mut timer, &buffer, &pattern, &prober).unwrap_err();
        assert_eq!(
            err,
            SessionError::PatternLengthMismatch {
                pattern: 8,
                lines: 16
            }
        );

        let empty = AccessPattern::new(Vec::new());
        let err = run_session(&mut timer, &buffer, &empty, &prober).unwrap_err();
        assert_eq!(err, SessionError::EmptyPattern);
    }

    #[test]
    fn accuracy_counts_agreements() {
        let report =
            AccuracyReport::from_comparison(&[true, true, false, false], &[true, false, false, true])
                .unwrap();
        assert_eq!(report.correct, 2);
        assert_eq!(report.total, 4);
        assert!((report.percentage - 50.0).abs() < f64::EPSILON);

        let err = AccuracyReport::from_comparison(&[true], &[true, false]).unwrap_err();
        assert_eq!(
            err,
            SessionError::LengthMismatch {
                detected: 1,
                expected: 2
            }
        );
    }

    #[test]
    fn buffer_geometry_is_validated() {
        assert!(TargetBuffer::new(0, 32).is_err());
        assert!(TargetBuffer::new(16, 33).is_err());
        let buffer = TargetBuffer::new(16, 32).unwrap();
        assert_eq!(buffer.as_slice().len(), 512);
        assert_eq!(buffer.line(0) as usize % super::PAGE_LEN, 0);
        assert_eq!(buffer.line(1) as usize - buffer.line(0) as usize, 32);
    }

    #[test]
    fn random_pattern_is_seed_deterministic() {
        let a = AccessPattern::random(&mut StdRng::seed_from_u64(1), 64);
        let b = AccessPattern::random(&mut StdRng::seed_from_u64(1), 64);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn distribution_samples_reflect_victim_behavior() {
        let buffer = TargetBuffer::new(16, 32).unwrap();
        let mut timer = StubTimer::new(10, 200, 32);

        let accessed = sample_distribution(&mut timer, &buffer, 0, true, 10);
        assert_eq!(accessed, vec![10; 10]);

        let silent = sample_distribution(&mut timer, &buffer, 1, false, 10);
        assert_eq!(silent, vec![200; 10]);
    }
}
