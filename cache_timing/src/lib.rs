#![deny(unsafe_op_in_unsafe_fn)]

//! Cycle-accurate cache timing primitives.
//!
//! Hardware access goes through the [`CycleCounter`] and [`CacheTimer`]
//! capability traits so that the calibration and probing layers can be run
//! against the deterministic [`stub`] backend as well as the real machine.

use core::ptr;

pub mod calibration;
pub mod stub;

#[cfg(target_arch = "arm")]
pub mod armv7;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// A free-running hardware cycle counter.
///
/// `read` must be monotonic for the duration of a measurement session and
/// cheap relative to a cache miss. Wraparound between two reads of the same
/// measurement is not handled here, the calibration layer discards the
/// resulting outliers.
pub trait CycleCounter {
    fn enable(&mut self);
    fn reset(&mut self);
    fn read(&self) -> u64;
}

/// The operations a Flush+Reload measurement needs from the platform.
///
/// Implementations are stateful on purpose: the stub backend tracks which
/// lines are cached, the x86 backend remembers the span it has to sweep on
/// `flush_all`.
pub trait CacheTimer {
    /// Performs exactly one observed read at `addr` and returns the elapsed
    /// cycles. Side effect: promotes `addr`'s line to cached.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid pointer to read.
    unsafe fn timed_access(&mut self, addr: *const u8) -> u64;

    /// Performs exactly one observed, untimed read at `addr` (prime /
    /// victim read).
    ///
    /// # Safety
    ///
    /// `addr` must be a valid pointer to read.
    unsafe fn touch(&mut self, addr: *const u8);

    /// Evicts the entire data cache. Idempotent in effect.
    ///
    /// Whole-cache eviction is deliberate: the reference platform has no
    /// unprivileged evict-by-address, and switching to line-granular
    /// eviction would change the timing characteristics the calibration
    /// was established under.
    fn flush_all(&mut self);

    /// Full data synchronization barrier. Prior memory effects are
    /// committed before anything that follows is timed.
    fn barrier(&self);
}

/// Observed read. `read_volatile` keeps the compiler from eliding the
/// access or folding it into a previous one.
///
/// # Safety
///
/// `p` must be a valid pointer to read.
pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}
