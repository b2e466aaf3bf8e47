use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Cooperative cancellation flag shared between a clip and every loop working on it.
///
/// Cloning the token shares the underlying flag, so a cancel from any clone is observed by
/// all parallel workers of the same run.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns [Error::Canceled] once the token has been canceled.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Progress counter for the current stage of a clip.
///
/// The maximum changes between stages: while hashing it is the number of windows, while
/// matching it is the number of candidate offsets.
#[derive(Debug, Default)]
pub struct Progress {
    current: AtomicU64,
    max: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new stage with the given maximum and resets the counter.
    pub fn start(&self, max: u64) {
        self.max.store(max, Ordering::SeqCst);
        self.current.store(0, Ordering::SeqCst);
    }

    pub fn set(&self, current: u64) {
        self.current.store(current, Ordering::SeqCst);
    }

    /// Marks the current stage as done.
    pub fn finish(&self) {
        self.current.store(self.max.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    #[inline]
    pub fn increment(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `(current, max)`.
    pub fn get(&self) -> (u64, u64) {
        (
            self.current.load(Ordering::SeqCst),
            self.max.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cancellation_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel();
        assert!(token.is_canceled());
        assert!(matches!(token.check(), Err(Error::Canceled)));
    }

    #[test]
    fn test_progress() {
        let progress = Progress::new();
        progress.start(10);
        progress.increment();
        progress.increment();
        assert_eq!(progress.get(), (2, 10));

        progress.finish();
        assert_eq!(progress.get(), (10, 10));

        progress.start(3);
        assert_eq!(progress.get(), (0, 3));
    }
}
