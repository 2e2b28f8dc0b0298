// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Default worker pool for offloading blocking work.
//!
//! One shared mpsc intake channel feeds a set of named OS threads
//! (`evloop-worker-N`). A job is a [`SourceHandle`] to a work source; the
//! handle that travels with the job *is* the loop-owned reference, and it is
//! returned to the loop through the [`CompletionQueue`] whether the job ran or
//! was cancelled, so its release always happens on the loop thread.
//!
//! Cancellation contract: the worker claims a job via
//! [`work_try_begin()`] before touching the work fn. A source stopped before
//! pickup fails that claim, so neither its work fn nor its done fn runs.
//!
//! [`work_try_begin()`]: crate::SourceHandle::work_try_begin

use crate::{backend::CompletionQueue, locking::LockUnpoisoned, source::SourceHandle};
use std::{io,
          sync::{Arc, Mutex, mpsc},
          thread::JoinHandle};

enum Job {
    Run(SourceHandle),
    Shutdown,
}

pub(crate) struct WorkerPool {
    job_tx: mpsc::Sender<Job>,
    intake: Arc<Mutex<mpsc::Receiver<Job>>>,
    completions: Arc<CompletionQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns a pool with `workers` threads (at least one).
    pub(crate) fn spawn(
        workers: usize,
        completions: Arc<CompletionQueue>,
    ) -> io::Result<Self> {
        let (job_tx, job_rx) = mpsc::channel();
        let mut pool = Self {
            job_tx,
            intake: Arc::new(Mutex::new(job_rx)),
            completions,
            workers: Vec::new(),
        };
        pool.ensure_capacity(workers.max(1))?;
        Ok(pool)
    }

    /// Grows the pool to at least `workers` threads. Never shrinks.
    pub(crate) fn ensure_capacity(&mut self, workers: usize) -> io::Result<()> {
        while self.workers.len() < workers {
            let index = self.workers.len();
            let intake = Arc::clone(&self.intake);
            let completions = Arc::clone(&self.completions);
            let handle = std::thread::Builder::new()
                .name(format!("evloop-worker-{index}"))
                .spawn(move || worker_main(&intake, &completions))?;
            self.workers.push(handle);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize { self.workers.len() }

    /// Hands a job to the pool. The handle moving into the channel is the
    /// loop-owned reference.
    ///
    /// # Errors
    ///
    /// Fails if the intake channel is closed (the pool is shutting down).
    pub(crate) fn enqueue(&self, job: SourceHandle) -> io::Result<()> {
        self.job_tx
            .send(Job::Run(job))
            .map_err(|_| io::Error::other("worker pool intake channel is closed"))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            drop(self.job_tx.send(Job::Shutdown));
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("evloop worker thread panicked during shutdown");
            }
        }
        // Jobs still sitting in the intake channel are returned to the loop
        // as cancelled completions so their references release on the loop
        // thread, not here.
        if let Ok(receiver) = self.intake.lock() {
            while let Ok(Job::Run(source)) = receiver.try_recv() {
                self.completions.post(source);
            }
        }
    }
}

fn worker_main(intake: &Mutex<mpsc::Receiver<Job>>, completions: &CompletionQueue) {
    loop {
        // Holding the intake lock across recv() serializes job *pickup* only;
        // jobs run outside the lock and in parallel.
        let job = {
            let receiver = intake.lock_unpoisoned();
            receiver.recv()
        };
        match job {
            Ok(Job::Run(source)) => {
                if source.work_try_begin() {
                    source.run_work_fn();
                    source.work_finish();
                }
                // Posted even when cancelled: the reference must travel back
                // to the loop thread either way.
                completions.post(source);
            }
            Ok(Job::Shutdown) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendWaker, CompletionQueue};
    use std::{sync::atomic::{AtomicUsize, Ordering},
              time::Duration};

    struct NoopWaker;
    impl BackendWaker for NoopWaker {
        fn wake(&self) {}
    }

    fn completion_queue() -> Arc<CompletionQueue> {
        Arc::new(CompletionQueue::new(Arc::new(NoopWaker)))
    }

    #[test]
    fn jobs_run_and_post_completions() {
        let completions = completion_queue();
        let pool = WorkerPool::spawn(2, Arc::clone(&completions)).expect("spawn");

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_job = Arc::clone(&ran);
        let work = SourceHandle::work(
            move |_| {
                ran_in_job.fetch_add(1, Ordering::SeqCst);
            },
            |_, _| {},
        );
        work.work_mark_queued();
        pool.enqueue(work.clone()).expect("enqueue");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while completions.is_empty() {
            assert!(std::time::Instant::now() < deadline, "worker never posted");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(completions.drain().len(), 1);
        assert!(work.work_take_completion());
    }

    #[test]
    fn cancelled_jobs_skip_the_work_fn_but_still_post() {
        let completions = completion_queue();
        let pool = WorkerPool::spawn(1, Arc::clone(&completions)).expect("spawn");

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_job = Arc::clone(&ran);
        let work = SourceHandle::work(
            move |_| {
                ran_in_job.fetch_add(1, Ordering::SeqCst);
            },
            |_, _| {},
        );
        work.work_mark_queued();
        work.work_cancel();
        pool.enqueue(work.clone()).expect("enqueue");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while completions.is_empty() {
            assert!(std::time::Instant::now() < deadline, "worker never posted");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!work.work_take_completion());
    }

    #[test]
    fn ensure_capacity_grows_but_never_shrinks() {
        let completions = completion_queue();
        let mut pool = WorkerPool::spawn(1, completions).expect("spawn");
        assert_eq!(pool.worker_count(), 1);
        pool.ensure_capacity(3).expect("grow");
        assert_eq!(pool.worker_count(), 3);
        pool.ensure_capacity(2).expect("no shrink");
        assert_eq!(pool.worker_count(), 3);
    }
}
