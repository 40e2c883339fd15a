// Stage contract for the transfer pipeline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::error::{BackupError, Result};

/// Downstream sink handed to stage callbacks.
///
/// `emit` suspends on a full queue and fails with `Cancelled` when the
/// pipeline is being torn down.
pub trait Emitter<T> {
    fn emit(&mut self, value: T) -> Result<()>;
}

pub struct ChannelEmitter<T> {
    tx: Sender<T>,
    cancel: Arc<AtomicBool>,
}

impl<T> ChannelEmitter<T> {
    pub fn new(tx: Sender<T>, cancel: Arc<AtomicBool>) -> Self {
        Self { tx, cancel }
    }
}

impl<T> Emitter<T> for ChannelEmitter<T> {
    fn emit(&mut self, value: T) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(BackupError::Cancelled);
        }
        self.tx.send(value).map_err(|_| BackupError::Cancelled)
    }
}

/// A stage that produces values and takes no input.
pub trait InputStage: Send {
    type Out: Send + 'static;

    fn on_start(&mut self, _out: &mut dyn Emitter<Self::Out>) -> Result<()> {
        Ok(())
    }

    /// Produce the whole stream.
    fn produce(&mut self, out: &mut dyn Emitter<Self::Out>) -> Result<()>;

    fn on_done(&mut self, _out: &mut dyn Emitter<Self::Out>) -> Result<()> {
        Ok(())
    }
}

/// A transforming or terminal stage. Map stages emit one value per
/// item, flat-map stages any number, terminal stages none.
pub trait Stage: Send {
    type In: Send + 'static;
    type Out: Send + 'static;

    fn on_start(&mut self, _out: &mut dyn Emitter<Self::Out>) -> Result<()> {
        Ok(())
    }

    /// `index` counts items received by this stage, starting at 0.
    fn on_item(
        &mut self,
        item: Self::In,
        index: u64,
        out: &mut dyn Emitter<Self::Out>,
    ) -> Result<()>;

    fn on_done(&mut self, _out: &mut dyn Emitter<Self::Out>) -> Result<()> {
        Ok(())
    }
}
