// src/io/control.rs
//
// Cancellation and progress for long-running work (CSV import, framing).
// The work itself runs on a blocking thread; the handle lets the caller
// cancel it, poll progress and await the result.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::{BufferError, Result};

/// Shared control flags for one unit of work. Cloning shares the flags.
#[derive(Clone, Debug, Default)]
pub struct TaskControl {
    /// Set to true to cancel the work
    pub cancel_flag: Arc<AtomicBool>,
    /// Items processed so far (rows or bytes)
    pub progress: Arc<AtomicU64>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BufferError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn set_progress(&self, done: u64) {
        self.progress.store(done, Ordering::Relaxed);
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}

/// Handle to work running on the blocking pool.
pub struct TaskHandle<T> {
    control: TaskControl,
    join: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Run `work` on tokio's blocking pool with a fresh control.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(work: F) -> Self
    where
        F: FnOnce(&TaskControl) -> Result<T> + Send + 'static,
    {
        let control = TaskControl::new();
        let worker_control = control.clone();
        let join = tokio::task::spawn_blocking(move || work(&worker_control));
        Self { control, join }
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn progress(&self) -> u64 {
        self.control.progress()
    }

    pub fn control(&self) -> &TaskControl {
        &self.control
    }

    /// Wait for the work to finish.
    pub async fn join(self) -> Result<T> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(BufferError::Cancelled),
            Err(e) => Err(BufferError::Io(std::io::Error::other(format!("worker task failed: {}", e)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_cancel_flag() {
        let control = TaskControl::new();
        let other = control.clone();
        assert!(control.check().is_ok());
        other.cancel();
        assert!(control.is_cancelled());
        assert!(matches!(control.check(), Err(BufferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_handle_returns_result_and_progress() {
        let handle = TaskHandle::spawn(|control| {
            control.set_progress(42);
            Ok(7u32)
        });
        assert_eq!(handle.join().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_cancelled() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = TaskHandle::spawn(move |control| {
            // Wait until the test has requested cancellation
            let _ = rx.recv();
            control.check()?;
            Ok(())
        });
        handle.cancel();
        tx.send(()).unwrap();
        assert!(matches!(handle.join().await, Err(BufferError::Cancelled)));
    }
}
