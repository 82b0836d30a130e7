use std::sync::{atomic::AtomicBool, Arc};

/// Cloneable cancellation flag
///
/// The engine keeps one instance for shutdown and one per manual
/// compaction for pausing; workers poll both between emitted keys.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Raises the signal; it cannot be lowered again.
    pub fn send(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Returns `true` if the signal was raised.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}
