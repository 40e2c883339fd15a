// Pipeline executor - runs whole pipelines as background jobs on a
// worker pool, with a wait barrier collecting failures

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{BackupError, Result};

type JobFn = Box<dyn FnOnce() -> Result<()> + Send>;
type JobCallback = Box<dyn FnOnce(&Result<()>) + Send>;

struct Job {
    id: String,
    func: JobFn,
    callback: Option<JobCallback>,
}

#[derive(Default)]
struct ExecState {
    pending: usize,
    failures: Vec<(String, BackupError)>,
}

/// Executes submitted jobs on a fixed pool of worker threads. With a
/// worker count of zero, jobs run synchronously in the calling thread.
pub struct PipelineExecutor {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<(Mutex<ExecState>, Condvar)>,
    cancel: Arc<AtomicBool>,
}

impl PipelineExecutor {
    pub fn new(worker_count: usize, cancel: Arc<AtomicBool>) -> Self {
        let state = Arc::new((Mutex::new(ExecState::default()), Condvar::new()));

        if worker_count == 0 {
            return Self {
                tx: None,
                workers: Vec::new(),
                state,
                cancel,
            };
        }

        let (tx, rx) = unbounded::<Job>();
        let workers = (0..worker_count)
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                let state = Arc::clone(&state);
                std::thread::Builder::new()
                    .name(format!("pipeline-worker-{}", i))
                    .spawn(move || {
                        for job in rx.iter() {
                            Self::run_job(&state, job);
                        }
                    })
                    .expect("failed to spawn pipeline worker")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
            state,
            cancel,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn run_job(state: &Arc<(Mutex<ExecState>, Condvar)>, job: Job) {
        debug!(job_id = %job.id, "Running pipeline job");
        let result = (job.func)();
        if let Some(callback) = job.callback {
            callback(&result);
        }

        let (lock, condvar) = &**state;
        let mut guard = lock.lock();
        if let Err(e) = result {
            guard.failures.push((job.id, e));
        }
        guard.pending -= 1;
        condvar.notify_all();
    }

    /// Schedule a pipeline for execution.
    pub fn submit(
        &self,
        job_id: String,
        func: JobFn,
        callback: Option<JobCallback>,
    ) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(BackupError::Cancelled);
        }

        match &self.tx {
            Some(tx) => {
                {
                    let (lock, _) = &*self.state;
                    lock.lock().pending += 1;
                }
                tx.send(Job {
                    id: job_id,
                    func,
                    callback,
                })
                .map_err(|_| BackupError::Pipeline("Executor is shut down".to_string()))
            }
            None => {
                let result = func();
                if let Some(callback) = callback {
                    callback(&result);
                }
                result.map_err(|e| {
                    error!(job_id = %job_id, error = %e, "Pipeline job failed");
                    e
                })
            }
        }
    }

    /// Block until all outstanding jobs finish. With `keep_going`,
    /// per-job failures are logged and swallowed instead of aborting
    /// on the first one.
    pub fn wait(&self, keep_going: bool) -> Result<()> {
        let (lock, condvar) = &*self.state;
        let mut guard = lock.lock();
        while guard.pending > 0 {
            condvar.wait(&mut guard);
        }

        let failures = std::mem::take(&mut guard.failures);
        drop(guard);

        if failures.is_empty() {
            return Ok(());
        }
        if keep_going {
            for (job_id, e) in failures {
                warn!(job_id = %job_id, error = %e, "Pipeline job failed, continuing");
            }
            return Ok(());
        }

        let (job_id, first) = failures.into_iter().next().expect("non-empty");
        error!(job_id = %job_id, error = %first, "Pipeline job failed");
        Err(first)
    }
}

impl Drop for PipelineExecutor {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
