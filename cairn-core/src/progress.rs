use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub finished: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            return 100;
        }
        (self.finished.min(self.total) * 100) / self.total
    }
}

/// Background task that periodically logs how far a transfer has got.
///
/// The reporter stops as soon as the guard is dropped, so every exit path of
/// the transferring task ends it.
pub struct ProgressReporter {
    finished: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(label: impl Into<String>, total: u64, interval: Duration) -> Self {
        let label = label.into();
        let finished = Arc::new(AtomicU64::new(0));
        let total = Arc::new(AtomicU64::new(total));
        let (stop, mut stopped) = watch::channel(false);

        let task = {
            let finished = Arc::clone(&finished);
            let total = Arc::clone(&total);
            tokio::spawn(async move {
                let started = Instant::now();
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        changed = stopped.changed() => {
                            if changed.is_err() || *stopped.borrow() {
                                break;
                            }
                        }
                        _ = ticker.tick() => {
                            let progress = TransferProgress {
                                finished: finished.load(Ordering::Relaxed),
                                total: total.load(Ordering::Relaxed),
                            };
                            tracing::info!(
                                "{}: {}% ({}/{} bytes, {:.1}s)",
                                label,
                                progress.percent(),
                                progress.finished,
                                progress.total,
                                started.elapsed().as_secs_f64()
                            );
                        }
                    }
                }
            })
        };

        Self {
            finished,
            total,
            stop,
            task: Some(task),
        }
    }

    /// Counter the transferring side adds finished bytes to.
    pub fn counter(&self) -> &AtomicU64 {
        &self.finished
    }

    /// Start counting from zero again, e.g. when a transfer is retried elsewhere.
    pub fn reset(&self) {
        self.finished.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferProgress {
        TransferProgress {
            finished: self.finished.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }

    /// Stop the reporter and wait for it to exit.
    pub async fn finish(mut self) -> TransferProgress {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.snapshot()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
