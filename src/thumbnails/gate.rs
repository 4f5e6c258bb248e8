use std::sync::{Arc, Condvar, Mutex};
use tracing::trace;

/// Counting gate bounding how many video decodes run at once. Image decodes
/// never pass through it.
#[derive(Debug)]
pub struct DecodeGate {
    capacity: usize,
    active: Mutex<usize>,
    cv: Condvar,
}

/// Held for the duration of one decode; releases its slot on drop, on every
/// exit path including panics.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<DecodeGate>,
}

impl DecodeGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            active: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        match self.active.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Blocks until a slot is free.
    pub fn acquire(self: &Arc<Self>) -> GatePermit {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *active >= self.capacity {
            active = match self.cv.wait(active) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *active += 1;
        trace!(active = *active, capacity = self.capacity, "video gate acquired");
        GatePermit {
            gate: Arc::clone(self),
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let mut active = match self.gate.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active = active.saturating_sub(1);
        drop(active);
        self.gate.cv.notify_one();
    }
}
