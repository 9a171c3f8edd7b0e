//! x86_64 backend, for developing and exercising the protocol on a desktop
//! machine. rdtsc stands in for the cycle counter; x86 has no unprivileged
//! whole-cache eviction, so `flush_all` sweeps clflush over the registered
//! target span instead.

use crate::{maccess, CacheTimer, CycleCounter};
use core::arch::x86_64 as arch_x86;

// rdtsc no fence
pub unsafe fn rdtsc_nofence() -> u64 {
    unsafe { arch_x86::_rdtsc() }
}

// rdtsc (has mfence before and after)
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe {
        arch_x86::_mm_mfence();
        let tsc: u64 = arch_x86::_rdtsc();
        arch_x86::_mm_mfence();
        tsc
    }
}

/// # Safety
///
/// `p` must be a valid pointer.
pub unsafe fn flush(p: *const u8) {
    unsafe { arch_x86::_mm_clflush(p) };
}

/// TSC-backed timer. The span registered with [`TscTimer::set_span`] is
/// what `flush_all` evicts, line by line.
#[derive(Debug)]
pub struct TscTimer {
    base: usize,
    len: usize,
    line_size: usize,
}

impl TscTimer {
    pub fn new(line_size: usize) -> Self {
        assert!(line_size.is_power_of_two());
        TscTimer {
            base: 0,
            len: 0,
            line_size,
        }
    }

    /// Registers the memory the timing protocol targets. Without a span,
    /// `flush_all` has nothing to evict.
    pub fn set_span(&mut self, span: &[u8]) {
        self.base = span.as_ptr() as usize;
        self.len = span.len();
    }
}

impl CycleCounter for TscTimer {
    fn enable(&mut self) {}

    fn reset(&mut self) {}

    fn read(&self) -> u64 {
        unsafe { rdtsc_nofence() }
    }
}

impl CacheTimer for TscTimer {
    unsafe fn timed_access(&mut self, addr: *const u8) -> u64 {
        unsafe {
            let t = rdtsc_fence();
            maccess(addr);
            rdtsc_fence() - t
        }
    }

    unsafe fn touch(&mut self, addr: *const u8) {
        unsafe { maccess(addr) };
    }

    fn flush_all(&mut self) {
        for offset in (0..self.len).step_by(self.line_size) {
            unsafe { flush((self.base + offset) as *const u8) };
        }
        self.barrier();
    }

    fn barrier(&self) {
        unsafe { arch_x86::_mm_mfence() };
    }
}
