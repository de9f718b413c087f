//! The platform timebase.
//!
//! A manually advanced nanosecond counter shared by every timed device.
//! The embedding decides how it moves: tests advance it explicitly, a host
//! loop feeds it wall-clock deltas. Devices only ever read it, which keeps
//! timer behaviour deterministic under test.

use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug, Clone, Default)]
pub struct Clock {
    now_ns: Rc<Cell<u64>>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns.get()
    }

    pub fn advance_ns(&self, delta: u64) {
        self.now_ns.set(self.now_ns.get().wrapping_add(delta));
    }

    pub fn set_ns(&self, now: u64) {
        self.now_ns.set(now);
    }
}
