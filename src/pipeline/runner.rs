// Pipeline runner - concurrent stages connected by bounded queues
// Each stage runs on its own worker thread. Item order is preserved
// between adjacent stages; a failing stage raises the cancel flag so
// the rest of the pipeline drains and exits instead of completing on a
// truncated stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver};

use crate::error::{BackupError, Result};

use super::stage::{ChannelEmitter, InputStage, Stage};

pub struct Pipeline {
    cancel: Arc<AtomicBool>,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Pipeline {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Add a producing stage and return its output queue.
    pub fn add_input<S>(&mut self, mut stage: S, queue_size: usize) -> Receiver<S::Out>
    where
        S: InputStage + 'static,
    {
        let (tx, rx) = bounded(queue_size.max(1));
        let cancel = Arc::clone(&self.cancel);

        let handle = std::thread::Builder::new()
            .name("pipeline-input".to_string())
            .spawn(move || {
                let mut out = ChannelEmitter::new(tx, Arc::clone(&cancel));
                let result = (|| {
                    stage.on_start(&mut out)?;
                    stage.produce(&mut out)?;
                    stage.on_done(&mut out)
                })();
                if result.is_err() {
                    cancel.store(true, Ordering::SeqCst);
                }
                result
            })
            .expect("failed to spawn pipeline worker");

        self.handles.push(handle);
        rx
    }

    /// Add a transforming or terminal stage fed from `rx`.
    pub fn add_stage<S>(
        &mut self,
        rx: Receiver<S::In>,
        stage: S,
        queue_size: usize,
    ) -> Receiver<S::Out>
    where
        S: Stage + 'static,
    {
        let (tx, out_rx) = bounded(queue_size.max(1));
        self.spawn_stage_worker(rx, tx, stage);
        out_rx
    }

    /// Add `workers` copies of a stage pulling from a shared queue.
    /// Output order across workers is not preserved; items must carry
    /// their own sequencing if the next stage depends on it.
    pub fn add_parallel_stage<S, F>(
        &mut self,
        rx: Receiver<S::In>,
        queue_size: usize,
        workers: usize,
        make_stage: F,
    ) -> Receiver<S::Out>
    where
        S: Stage + 'static,
        F: Fn() -> S,
    {
        let (tx, out_rx) = bounded(queue_size.max(1));
        for _ in 0..workers.max(1) {
            self.spawn_stage_worker(rx.clone(), tx.clone(), make_stage());
        }
        out_rx
    }

    fn spawn_stage_worker<S>(
        &mut self,
        rx: Receiver<S::In>,
        tx: crossbeam::channel::Sender<S::Out>,
        mut stage: S,
    ) where
        S: Stage + 'static,
    {
        let cancel = Arc::clone(&self.cancel);
        let handle = std::thread::Builder::new()
            .name("pipeline-stage".to_string())
            .spawn(move || {
                let mut out = ChannelEmitter::new(tx, Arc::clone(&cancel));
                let result = (|| {
                    stage.on_start(&mut out)?;
                    let mut index = 0u64;
                    for item in rx.iter() {
                        if cancel.load(Ordering::Relaxed) {
                            return Err(BackupError::Cancelled);
                        }
                        stage.on_item(item, index, &mut out)?;
                        index += 1;
                    }
                    // The input queue may also close because an upstream
                    // stage failed; finishing then would truncate data.
                    if cancel.load(Ordering::SeqCst) {
                        return Err(BackupError::Cancelled);
                    }
                    stage.on_done(&mut out)
                })();
                if result.is_err() {
                    cancel.store(true, Ordering::SeqCst);
                }
                result
            })
            .expect("failed to spawn pipeline worker");

        self.handles.push(handle);
    }

    /// Run the pipeline to completion. The first real stage error wins;
    /// teardown-only failures surface as `Cancelled`.
    pub fn run(self) -> Result<()> {
        let mut first_error: Option<BackupError> = None;
        let mut cancelled = false;

        for handle in self.handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(BackupError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(BackupError::Pipeline(
                            "Pipeline worker panicked".to_string(),
                        ));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None if cancelled => Err(BackupError::Cancelled),
            None => Ok(()),
        }
    }
}
