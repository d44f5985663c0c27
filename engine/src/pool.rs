//! Fixed-size worker pool.
//!
//! Work items are closures sent over a crossbeam channel and picked up by
//! `size` worker threads. One work item occupies one worker until it returns.
//!
//! Besides `execute`, the pool supports the two operations the scheduler
//! needs for stopping: `clear` (drop work that has not been picked up yet)
//! and `wait_for_done` (block until nothing is queued or running).

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error};

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Number of work items queued or running
#[derive(Default)]
struct Outstanding {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Outstanding {
    fn add(&self, n: usize) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += n;
    }

    fn done(&self, n: usize) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(n);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .drained
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub struct WorkerPool {
    sender: Option<Sender<Work>>,
    receiver: Receiver<Work>,
    outstanding: Arc<Outstanding>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = unbounded::<Work>();
        let outstanding = Arc::new(Outstanding::default());

        let workers = (0..size)
            .filter_map(|index| {
                let receiver = receiver.clone();
                let outstanding = Arc::clone(&outstanding);
                thread::Builder::new()
                    .name(format!("haralug-worker-{}", index))
                    .spawn(move || worker_loop(receiver, outstanding))
                    .map_err(|e| error!("Failed to spawn worker {}: {}", index, e))
                    .ok()
            })
            .collect::<Vec<_>>();

        debug!(workers = workers.len(), "worker pool started");

        WorkerPool {
            sender: Some(sender),
            receiver,
            outstanding,
            workers,
        }
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queued plus running work items
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Queue a work item.
    pub fn execute<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        self.outstanding.add(1);
        if sender.send(Box::new(work)).is_err() {
            error!("worker pool channel closed; dropping work");
            self.outstanding.done(1);
        }
    }

    /// Drop every work item that no worker has picked up yet.
    ///
    /// Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.receiver.try_iter().count();
        if dropped > 0 {
            self.outstanding.done(dropped);
            debug!(dropped, "cleared queued work");
        }
        dropped
    }

    /// Block until nothing is queued or running.
    pub fn wait_for_done(&self) {
        self.outstanding.wait_zero();
    }
}

fn worker_loop(receiver: Receiver<Work>, outstanding: Arc<Outstanding>) {
    for work in receiver.iter() {
        if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
            error!("work item panicked");
        }
        outstanding.done(1);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop once the queue is empty.
        self.clear();
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_pool_runs_all_work() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_for_done();

        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_zero_size_gets_one_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_clear_drops_queued_work() {
        let pool = WorkerPool::new(1);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let counter = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker
        pool.execute(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(pool.outstanding(), 4);

        assert_eq!(pool.clear(), 3);
        release_tx.send(()).unwrap();
        pool.wait_for_done();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_work_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(|| panic!("boom"));
        let c = Arc::clone(&counter);
        pool.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait_for_done();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
