//! Interrupt gate: wakes the scheduler loop when the earliest deadline may
//! have moved.
//!
//! The gate holds one live [`CancellationToken`]. The loop arms (clones) it
//! in the same critical section where it pops the index; a kick cancels the
//! live token and installs a fresh one. A kick therefore either lands before
//! the pop (and the new entry is already in the index) or cancels exactly the
//! token the loop is about to wait on.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct InterruptGate {
    current: CancellationToken,
}

impl InterruptGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for the next wait. Must be taken under the schedule lock.
    pub fn arm(&self) -> CancellationToken {
        self.current.clone()
    }

    /// Wake whoever waits on the current token and install a fresh one.
    pub fn kick(&mut self) {
        let fired = std::mem::take(&mut self.current);
        fired.cancel();
    }
}
