use std::sync::atomic::{AtomicUsize, Ordering};

/// Global counter for tracking established CONNECT tunnels
pub static ACTIVE_TUNNELS: AtomicUsize = AtomicUsize::new(0);

/// RAII guard that keeps a tunnel counted while it is alive
#[derive(Debug)]
pub struct TunnelGuard {
    released: bool,
}

impl TunnelGuard {
    /// Count a new tunnel. Returns the guard and the id-like count after increment.
    pub fn acquire() -> (Self, usize) {
        let current = ACTIVE_TUNNELS.fetch_add(1, Ordering::AcqRel) + 1;
        (Self { released: false }, current)
    }

    /// Stop counting this tunnel; later calls and the drop are no-ops
    pub fn release(&mut self) {
        if !self.released {
            ACTIVE_TUNNELS.fetch_sub(1, Ordering::AcqRel);
            self.released = true;
        }
    }

    /// Get the current number of live tunnels
    pub fn active_count() -> usize {
        ACTIVE_TUNNELS.load(Ordering::Relaxed)
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.release();
    }
}
