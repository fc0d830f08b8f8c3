use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cumulative restore progress for one disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_done: u64,
    pub total_bytes: u64,
}

impl Progress {
    pub fn percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_done as f64 * 100.0 / self.total_bytes as f64) as f32
    }
}

/// Shared cancellation flag. Clones observe the same flag; the engine checks
/// it at every block boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
