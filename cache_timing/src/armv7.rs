//! ARMv7-A backend for the Cortex-A7 reference platform (i.MX6 ULZ,
//! secure world). Cycle counts come from the PMU cycle counter, eviction is
//! a whole-L1D clean and invalidate by set/way.
//!
//! Everything here touches cp15 and therefore needs a privileged (PL1+)
//! execution context.

use crate::{maccess, CacheTimer, CycleCounter};
use core::arch::asm;

/// Cortex-A7 L1D geometry.
pub const CACHE_LINE_SIZE: usize = 32;
pub const L1D_SETS: u32 = 256;
pub const L1D_WAYS: u32 = 4;

const PMCR_E: u32 = 1 << 0; // enable all counters
const PMCR_P: u32 = 1 << 1; // reset event counters
const PMCR_C: u32 = 1 << 2; // reset cycle counter
const PMCNTENSET_C: u32 = 1 << 31; // cycle counter enable bit

// DCCISW set/way encoding: way in [31:30], set in [12:5] for a
// 4-way 256-set 32-byte-line cache.
const WAY_SHIFT: u32 = 30;
const SET_SHIFT: u32 = 5;

/// Data synchronization barrier.
#[inline(always)]
pub fn dsb() {
    unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
}

#[inline(always)]
fn write_pmcr(value: u32) {
    unsafe {
        asm!("mcr p15, 0, {0}, c9, c12, 0", in(reg) value, options(nostack, preserves_flags))
    };
}

#[inline(always)]
fn write_pmcntenset(value: u32) {
    unsafe {
        asm!("mcr p15, 0, {0}, c9, c12, 1", in(reg) value, options(nostack, preserves_flags))
    };
}

/// Reads PMCCNTR, the PMU cycle counter.
#[inline(always)]
pub fn read_cycle_counter() -> u32 {
    let value: u32;
    unsafe {
        asm!("mrc p15, 0, {0}, c9, c13, 0", out(reg) value, options(nostack, preserves_flags))
    };
    value
}

/// Clean and invalidate the whole L1 data cache by set/way, then drain.
pub fn flush_dcache() {
    dsb();
    for set in 0..L1D_SETS {
        for way in 0..L1D_WAYS {
            let sw = (way << WAY_SHIFT) | (set << SET_SHIFT);
            unsafe {
                asm!("mcr p15, 0, {0}, c7, c14, 2", in(reg) sw, options(nostack, preserves_flags))
            };
        }
    }
    dsb();
}

/// PMU-backed timer. Construction enables and resets the cycle counter.
#[derive(Debug, Default)]
pub struct PmuTimer;

impl PmuTimer {
    pub fn new() -> Self {
        let mut t = PmuTimer;
        t.enable();
        t.reset();
        t
    }
}

impl CycleCounter for PmuTimer {
    fn enable(&mut self) {
        write_pmcr(PMCR_E | PMCR_P | PMCR_C);
        write_pmcntenset(PMCNTENSET_C);
    }

    fn reset(&mut self) {
        write_pmcr(PMCR_E | PMCR_C);
    }

    fn read(&self) -> u64 {
        read_cycle_counter() as u64
    }
}

impl CacheTimer for PmuTimer {
    unsafe fn timed_access(&mut self, addr: *const u8) -> u64 {
        let start = read_cycle_counter();
        unsafe { maccess(addr) };
        dsb();
        let end = read_cycle_counter();
        end.wrapping_sub(start) as u64
    }

    unsafe fn touch(&mut self, addr: *const u8) {
        unsafe { maccess(addr) };
    }

    fn flush_all(&mut self) {
        flush_dcache();
    }

    fn barrier(&self) {
        dsb();
    }
}
