//! Global-find window
//!
//! While a bucket rename propagates through the cluster, in-flight GETs may
//! still reference the old name. The window is activated for the duration:
//! the GET path registers each lookup with [`Gfn::enter`], and the rename
//! commit drains them with [`Gfn::quiesce`] before declaring the move done.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct State {
    active: bool,
    inflight: u64,
}

/// Activation flag plus in-flight lookup counter
#[derive(Default)]
pub struct Gfn {
    state: Mutex<State>,
    cond: Condvar,
}

/// Registration of one in-flight lookup; de-registers on drop
pub struct GfnGuard<'a> {
    gfn: &'a Gfn,
}

impl Gfn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the window
    pub fn activate(&self) {
        self.state.lock().active = true;
    }

    /// Close the window
    pub fn deactivate(&self) {
        self.state.lock().active = false;
    }

    /// Whether the window is open
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Register an in-flight lookup
    #[must_use]
    pub fn enter(&self) -> GfnGuard<'_> {
        self.state.lock().inflight += 1;
        GfnGuard { gfn: self }
    }

    fn exit(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.inflight > 0);
        st.inflight = st.inflight.saturating_sub(1);
        if st.inflight == 0 {
            drop(st);
            self.cond.notify_all();
        }
    }

    /// Block until no lookups are in flight or the timeout elapses.
    /// Returns whether the window actually drained.
    #[must_use]
    pub fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while st.inflight > 0 {
            if self.cond.wait_until(&mut st, deadline).timed_out() {
                return st.inflight == 0;
            }
        }
        true
    }
}

impl Drop for GfnGuard<'_> {
    fn drop(&mut self) {
        self.gfn.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_activate_deactivate() {
        let gfn = Gfn::new();
        assert!(!gfn.is_active());
        gfn.activate();
        assert!(gfn.is_active());
        gfn.deactivate();
        assert!(!gfn.is_active());
    }

    #[test]
    fn test_quiesce_empty_is_immediate() {
        let gfn = Gfn::new();
        assert!(gfn.quiesce(Duration::from_millis(1)));
    }

    #[test]
    fn test_quiesce_times_out_while_held() {
        let gfn = Gfn::new();
        let _guard = gfn.enter();
        assert!(!gfn.quiesce(Duration::from_millis(20)));
    }

    #[test]
    fn test_quiesce_drains() {
        let gfn = Arc::new(Gfn::new());
        let holder = {
            let gfn = Arc::clone(&gfn);
            thread::spawn(move || {
                let guard = gfn.enter();
                thread::sleep(Duration::from_millis(30));
                drop(guard);
            })
        };
        thread::sleep(Duration::from_millis(5));
        assert!(gfn.quiesce(Duration::from_secs(5)));
        holder.join().unwrap();
    }
}
