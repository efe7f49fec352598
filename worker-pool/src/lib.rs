//! A fixed-size pool of workers draining a bounded task queue (spec
//! §4.2). Used by the concurrent variants of the verification and
//! correlator processors to fan out per-record work; each stage sizes its
//! own pool, typically at host CPU count via `num_cpus`.
//!
//! Built on `scheduled_thread_pool`, the same crate the collector's
//! MySQL-era ancestor used for its connection-reaping background thread:
//! here it is the single substrate for all processor fan-out, with an
//! explicit queue-depth counter layered on top since the underlying pool
//! itself has no concept of a bounded queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scheduled_thread_pool::ScheduledThreadPool;

/// The outcome of a `submit` call that could not be fulfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The bounded queue is full; the caller should fall back to running
    /// the task inline or drop it, per its own back-pressure policy.
    QueueFull,
    /// `stop()` has already been called; no further submissions are
    /// accepted.
    Stopped,
}

/// A bounded-queue, fixed-size worker pool. Tasks run in arbitrary order
/// and may run concurrently; the pool does not enforce a per-task
/// deadline — callers that need one must check it themselves inside the
/// task body.
pub struct WorkerPool {
    pool: ScheduledThreadPool,
    queued: Arc<AtomicUsize>,
    queue_cap: usize,
    stopped: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(label: &str, num_workers: usize, queue_cap: usize) -> Self {
        Self {
            pool: ScheduledThreadPool::with_name(&format!("{label}-{{}}"), num_workers.max(1)),
            queued: Arc::new(AtomicUsize::new(0)),
            queue_cap,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sizes a pool the way every concurrent processor stage does: one
    /// worker per host CPU, except the PII detection pool which the
    /// verification processor caps at a small fixed size (spec §5).
    pub fn sized_at_cpu_count(label: &str, queue_cap: usize) -> Self {
        Self::new(label, num_cpus::get(), queue_cap)
    }

    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Submits `task` for execution on some worker. Returns immediately;
    /// the task runs asynchronously relative to the caller.
    pub fn submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SubmitError::Stopped);
        }
        if self.queued.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            if n >= self.queue_cap {
                None
            } else {
                Some(n + 1)
            }
        }).is_err() {
            return Err(SubmitError::QueueFull);
        }

        let queued = Arc::clone(&self.queued);
        self.pool.execute(move || {
            task();
            queued.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(())
    }

    /// Stops accepting new submissions and waits up to `grace` for
    /// in-flight tasks to drain. Tasks still running after the grace
    /// period continue on their worker thread but are no longer waited
    /// on; no task is forcibly killed.
    pub fn stop(&self, grace: Duration) {
        self.stopped.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;
        while self.queue_depth() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.queue_depth() > 0 {
            log::warn!(
                "worker pool stop() grace period elapsed with {} tasks still in flight",
                self.queue_depth()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[test]
    fn runs_submitted_tasks() {
        let pool = WorkerPool::new("test", 2, 8);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.stop(Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn rejects_beyond_queue_capacity() {
        let release = Arc::new(Mutex::new(()));
        let guard = release.lock().unwrap();
        let pool = WorkerPool::new("test", 1, 1);

        let r = Arc::clone(&release);
        // occupies the single worker; queue_cap=1 means exactly one more
        // task may be queued behind it.
        pool.submit(move || {
            let _g = r.lock().unwrap();
        })
        .unwrap();
        pool.submit(|| {}).unwrap();
        assert_eq!(pool.submit(|| {}), Err(SubmitError::QueueFull));

        drop(guard);
        pool.stop(Duration::from_secs(1));
    }

    #[test]
    fn rejects_after_stop() {
        let pool = WorkerPool::new("test", 1, 4);
        pool.stop(Duration::from_secs(1));
        assert_eq!(pool.submit(|| {}), Err(SubmitError::Stopped));
    }
}
