//! Background execution of analysis jobs with stale-result rejection.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::error::{AnalysisError, Result};

/// Busy indicator shown while a job runs.
pub trait ProgressIndicator: Send + Sync {
    fn show(&self, label: &str);
    fn hide(&self);
}

/// Indicator that only logs.
pub struct LogProgress;

impl ProgressIndicator for LogProgress {
    fn show(&self, label: &str) {
        log::info!("{}...", label);
    }

    fn hide(&self) {
        log::debug!("Background job finished");
    }
}

struct Pending<T> {
    generation: u64,
    receiver: Receiver<Result<T>>,
}

/// Runs one job at a time on a background thread.
///
/// Every submission gets a new generation number. Submitting again or
/// cancelling makes earlier jobs stale; their results are never delivered.
/// Jobs are not interrupted, they just finish into the void.
pub struct AnalysisWorker<T: Send + 'static> {
    generation: Arc<AtomicU64>,
    progress: Arc<dyn ProgressIndicator>,
    pending: Mutex<Option<Pending<T>>>,
}

impl<T: Send + 'static> AnalysisWorker<T> {
    pub fn new(progress: Arc<dyn ProgressIndicator>) -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            progress,
            pending: Mutex::new(None),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start `job` in the background and return its generation number.
    ///
    /// Inputs the job needs (the mask in particular) are moved into the
    /// closure and should come back as part of its result.
    pub fn submit<F>(&self, label: &str, job: F) -> u64
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel();
        let progress = Arc::clone(&self.progress);
        let current = Arc::clone(&self.generation);
        let label = label.to_string();

        progress.show(&label);
        thread::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                Err(AnalysisError::model(format!("{} panicked", label)))
            });
            // A newer job owns the indicator now.
            if current.load(Ordering::SeqCst) == generation {
                progress.hide();
            }
            // The receiver is gone when the job went stale.
            let _ = tx.send(result);
        });

        *self.pending.lock() = Some(Pending { generation, receiver: rx });
        log::debug!("Submitted background job {}", generation);
        generation
    }

    /// Mark the running job stale and hide the indicator.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.pending.lock().take().is_some() {
            self.progress.hide();
        }
    }

    pub fn is_busy(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Result of the current job if it has finished. `None` while it is
    /// still running, when nothing was submitted or when the job is stale.
    pub fn poll(&self) -> Option<Result<T>> {
        let mut guard = self.pending.lock();
        let pending = guard.take()?;
        if pending.generation != self.current_generation() {
            log::debug!("Discarding stale job {}", pending.generation);
            return None;
        }
        match pending.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => {
                *guard = Some(pending);
                None
            }
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block until the current job finishes. `None` when there is no
    /// current job or it went stale while waiting.
    pub fn wait(&self) -> Option<Result<T>> {
        let pending = self.pending.lock().take()?;
        let result = pending.receiver.recv().ok()?;
        if pending.generation != self.current_generation() {
            log::debug!("Discarding stale job {}", pending.generation);
            return None;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Mask;
    use image::Luma;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingProgress {
        shown: AtomicUsize,
        hidden: AtomicUsize,
    }

    impl ProgressIndicator for CountingProgress {
        fn show(&self, _label: &str) {
            self.shown.fetch_add(1, Ordering::SeqCst);
        }

        fn hide(&self) {
            self.hidden.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_mask_round_trips_through_job() {
        let progress = Arc::new(CountingProgress::default());
        let worker: AnalysisWorker<(Mask, usize)> = AnalysisWorker::new(progress.clone());
        let mut mask = Mask::new(4, 4);
        mask.put_pixel(1, 1, Luma([1]));

        worker.submit("Counting", move || {
            let n = crate::mask::foreground_count(&mask);
            Ok((mask, n))
        });
        let (mask, n) = worker.wait().unwrap().unwrap();
        assert_eq!(n, 1);
        assert_eq!(mask.get_pixel(1, 1)[0], 1);
        assert_eq!(progress.shown.load(Ordering::SeqCst), 1);
        assert_eq!(progress.hidden.load(Ordering::SeqCst), 1);
        assert!(!worker.is_busy());
    }

    #[test]
    fn test_resubmit_makes_old_job_stale() {
        let worker: AnalysisWorker<u32> = AnalysisWorker::new(Arc::new(LogProgress));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = worker.submit("Slow", move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(1)
        });
        let second = worker.submit("Fast", || Ok(2));
        assert!(second > first);
        assert_eq!(worker.wait().unwrap().unwrap(), 2);
        let _ = release_tx.send(());
        assert!(worker.poll().is_none());
    }

    #[test]
    fn test_cancel_refuses_result_and_hides() {
        let progress = Arc::new(CountingProgress::default());
        let worker: AnalysisWorker<u32> = AnalysisWorker::new(progress.clone());
        worker.submit("Job", || Ok(7));
        worker.cancel();
        assert!(worker.poll().is_none());
        assert!(worker.wait().is_none());
        assert!(progress.hidden.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_failure_is_delivered_and_hides_indicator() {
        let progress = Arc::new(CountingProgress::default());
        let worker: AnalysisWorker<u32> = AnalysisWorker::new(progress.clone());
        worker.submit("Failing", || Err(AnalysisError::input("no mask supplied")));
        assert!(matches!(worker.wait(), Some(Err(AnalysisError::Input(_)))));
        assert_eq!(progress.hidden.load(Ordering::SeqCst), 1);
    }
}
