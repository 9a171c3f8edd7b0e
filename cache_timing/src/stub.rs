//! Deterministic software model of the counter and cache, for tests and
//! dry runs. A line is either cached or not; a timed access takes a fixed
//! hit or miss latency and promotes the line, `flush_all` evicts
//! everything. No jitter, no wraparound unless injected.

use crate::{CacheTimer, CycleCounter};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct StubTimer {
    hit_cycles: u64,
    miss_cycles: u64,
    line_mask: usize,
    cached: HashSet<usize>,
    clock: u64,
    // raw duration returned by the next timed_access, models a counter wrap
    injected: Option<u64>,
}

impl StubTimer {
    pub fn new(hit_cycles: u64, miss_cycles: u64, line_size: usize) -> Self {
        assert!(line_size.is_power_of_two());
        StubTimer {
            hit_cycles,
            miss_cycles,
            line_mask: !(line_size - 1),
            cached: HashSet::new(),
            clock: 0,
            injected: None,
        }
    }

    fn line_of(&self, addr: *const u8) -> usize {
        addr as usize & self.line_mask
    }

    pub fn is_cached(&self, addr: *const u8) -> bool {
        self.cached.contains(&self.line_of(addr))
    }

    /// The next `timed_access` returns `raw` regardless of cache state, as
    /// a counter overflowing between the two reads would.
    pub fn inject_wrapped_reading(&mut self, raw: u64) {
        self.injected = Some(raw);
    }
}

impl CycleCounter for StubTimer {
    fn enable(&mut self) {}

    fn reset(&mut self) {
        self.clock = 0;
    }

    fn read(&self) -> u64 {
        self.clock
    }
}

impl CacheTimer for StubTimer {
    unsafe fn timed_access(&mut self, addr: *const u8) -> u64 {
        let line = self.line_of(addr);
        let duration = match self.injected.take() {
            Some(raw) => raw,
            None if self.cached.contains(&line) => self.hit_cycles,
            None => self.miss_cycles,
        };
        self.cached.insert(line);
        self.clock += duration;
        duration
    }

    unsafe fn touch(&mut self, addr: *const u8) {
        let line = self.line_of(addr);
        self.cached.insert(line);
        self.clock += 1;
    }

    fn flush_all(&mut self) {
        self.cached.clear();
    }

    fn barrier(&self) {}
}

#[cfg(test)]
mod tests {
    use super::StubTimer;
    use crate::CacheTimer;

    const LINE: usize = 32;

    #[test]
    fn miss_then_hit() {
        let mut t = StubTimer::new(10, 200, LINE);
        let addr = 0x1000 as *const u8;
        assert_eq!(unsafe { t.timed_access(addr) }, 200);
        assert_eq!(unsafe { t.timed_access(addr) }, 10);
        t.flush_all();
        assert_eq!(unsafe { t.timed_access(addr) }, 200);
    }

    #[test]
    fn touch_promotes_whole_line() {
        let mut t = StubTimer::new(10, 200, LINE);
        unsafe { t.touch(0x2000 as *const u8) };
        // same line, different byte
        assert_eq!(unsafe { t.timed_access(0x201f as *const u8) }, 10);
        // next line is still cold
        assert_eq!(unsafe { t.timed_access(0x2020 as *const u8) }, 200);
    }

    #[test]
    fn injected_wrap_fires_once() {
        let mut t = StubTimer::new(10, 200, LINE);
        let addr = 0x3000 as *const u8;
        t.inject_wrapped_reading(u32::MAX as u64);
        assert_eq!(unsafe { t.timed_access(addr) }, u32::MAX as u64);
        assert_eq!(unsafe { t.timed_access(addr) }, 10);
    }
}
