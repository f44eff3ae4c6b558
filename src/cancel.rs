//! External cancellation for a monitored run.
//!
//! A `CancelToken` is cheap to clone and may be triggered from any thread.
//! On POSIX it also owns a wake pipe so a read blocked in `poll(2)` returns
//! immediately instead of waiting out its deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    #[cfg(unix)]
    wake: Option<(std::io::PipeReader, std::io::PipeWriter)>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        #[cfg(unix)]
        let wake = match std::io::pipe() {
            Ok(pair) => Some(pair),
            Err(e) => {
                tracing::warn!(error = %e, "failed to create cancel wake pipe, falling back to sliced reads");
                None
            }
        };
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                #[cfg(unix)]
                wake,
            }),
        }
    }

    /// Request termination. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("cancellation requested");
        #[cfg(unix)]
        if let Some((_, writer)) = &self.inner.wake {
            use std::io::Write;
            // The byte is never drained, so the read end stays readable.
            let _ = (&*writer).write(&[1]);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Read end of the wake pipe, readable once `cancel` has been called.
    #[cfg(unix)]
    pub(crate) fn wake_fd(&self) -> Option<std::os::fd::BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        self.inner.wake.as_ref().map(|(reader, _)| reader.as_fd())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_is_not_cancelled() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn test_cancel_is_visible_through_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_twice_is_harmless() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(token.is_cancelled());
    }
}
