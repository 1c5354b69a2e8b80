//! Admission control: a bounded counter of accepted connections.
//!
//! The reactor disarms its listeners while the counter is full, so excess
//! connections wait in the kernel backlog instead of being accepted and
//! dropped. Releasing a slot re-arms them on the next loop iteration.

#[derive(Debug)]
pub struct Admission {
    limit: usize,
    active: usize,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        Self { limit, active: 0 }
    }

    /// Take a slot. Returns `false` when the limit is reached.
    pub fn try_acquire(&mut self) -> bool {
        if self.active >= self.limit {
            return false;
        }
        self.active += 1;
        true
    }

    pub fn release(&mut self) {
        debug_assert!(self.active > 0, "admission slot released twice");
        self.active = self.active.saturating_sub(1);
    }

    pub fn has_room(&self) -> bool {
        self.active < self.limit
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
