use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};

use crate::detect::FileCategory;
use crate::error::WorkerError;
use crate::queue::JobQueue;
use crate::worker::job::JobResult;
use crate::worker::runner::JobRunner;

/// Worker threads consuming one category's queue.
pub struct WorkerPool {
    category: FileCategory,
    result_receiver: Receiver<JobResult>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

/// Everything a pool needs besides its runner.
#[derive(Clone)]
pub struct PoolOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Dispatcher notifications; workers still poll without them.
    pub wakeup: Option<Receiver<()>>,
    pub result_capacity: usize,
}

impl WorkerPool {
    /// Starts `options.concurrency` threads (at least one).
    pub fn start(
        category: FileCategory,
        queue: JobQueue,
        runner: Arc<JobRunner>,
        options: PoolOptions,
    ) -> Result<Self, WorkerError> {
        let worker_count = options.concurrency.max(1);
        let (result_sender, result_receiver) = bounded::<JobResult>(options.result_capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                category,
                queue: queue.clone(),
                runner: Arc::clone(&runner),
                results: result_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                wakeup: options.wakeup.clone(),
                poll_interval: options.poll_interval,
            };

            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", category, worker_id))
                .spawn(move || worker.run())
                .map_err(|e| {
                    shutdown.store(true, Ordering::Relaxed);
                    WorkerError::SpawnFailed(e.to_string())
                })?;

            workers.push(handle);
        }

        info!("Started {} {} workers", worker_count, category);

        Ok(Self {
            category,
            result_receiver,
            workers,
            shutdown,
        })
    }

    pub fn category(&self) -> FileCategory {
        self.category
    }

    pub fn try_recv_result(&self) -> Option<JobResult> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<JobResult> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down {} worker pool...", self.category);
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("{} worker {} panicked: {:?}", self.category, i, e);
            } else {
                debug!("{} worker {} finished", self.category, i);
            }
        }

        info!("All {} workers have stopped", self.category);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

struct Worker {
    id: usize,
    category: FileCategory,
    queue: JobQueue,
    runner: Arc<JobRunner>,
    results: Sender<JobResult>,
    shutdown: Arc<AtomicBool>,
    wakeup: Option<Receiver<()>>,
    poll_interval: Duration,
}

impl Worker {
    fn run(self) {
        debug!("{} worker {} started", self.category, self.id);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("{} worker {} received shutdown signal", self.category, self.id);
                break;
            }

            match self.queue.claim(self.category) {
                Ok(Some(job)) => {
                    debug!("{} worker {} processing job {}", self.category, self.id, job.id);
                    match self.runner.run(&job) {
                        Ok(result) => {
                            // Nobody has to read results; drop them when the buffer is full.
                            if self.results.try_send(result).is_err() {
                                debug!("{} worker {} result buffer full", self.category, self.id);
                            }
                        }
                        Err(e) => error!(
                            "{} worker {} could not finish job {}: {}",
                            self.category, self.id, job.id, e
                        ),
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("{} worker {} failed to claim a job: {}", self.category, self.id, e),
            }

            self.idle();
        }

        debug!("{} worker {} stopped", self.category, self.id);
    }

    /// Sleeps until woken by the dispatcher or the poll interval passes.
    fn idle(&self) {
        match &self.wakeup {
            Some(wakeup) => match wakeup.recv_timeout(self.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(self.poll_interval),
            },
            None => thread::sleep(self.poll_interval),
        }
    }
}
