/// Scheduler hooks consulted at checkpoints of long-running loops.
pub trait Resched {
    /// Whether the current task should give up the processor.
    fn need_resched(&self) -> bool {
        false
    }

    /// Yield the processor if a reschedule is pending.
    fn cond_resched(&self) {
        if self.need_resched() {
            core::hint::spin_loop();
        }
    }
}

/// A scheduler that never asks the caller to yield.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverResched;

impl Resched for NeverResched {}
