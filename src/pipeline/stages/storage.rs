// Storage pipeline stages - rate limiting, multipart upload and download

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::pipeline::rate_limiter::RateLimiter;
use crate::pipeline::stage::{Emitter, InputStage, Stage};
use crate::storage::StorageEngine;

/// Yield sub-chunks whose total size fits the tokens currently
/// available, sleeping between attempts when the bucket is empty.
pub struct RateLimiterStage {
    limiter: RateLimiter,
    retry_interval: Duration,
}

impl RateLimiterStage {
    pub fn new(limit_per_sec: u64, retry_interval: Duration) -> Self {
        Self {
            limiter: RateLimiter::new(limit_per_sec),
            retry_interval,
        }
    }
}

impl Stage for RateLimiterStage {
    type In = Vec<u8>;
    type Out = Vec<u8>;

    fn on_item(&mut self, item: Vec<u8>, _index: u64, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let mut data = &item[..];
        while !data.is_empty() {
            let pass = self.limiter.extract_tokens(data.len() as u64) as usize;
            if pass > 0 {
                out.emit(data[..pass].to_vec())?;
                data = &data[pass..];
            }
            if !data.is_empty() {
                std::thread::sleep(self.retry_interval);
            }
        }
        Ok(())
    }
}

/// Chunk passed between the multipart uploading stages.
pub struct UploadingChunk {
    pub data: Vec<u8>,
    pub sequence: u64,
    pub upload_id: Option<Arc<String>>,
}

/// Initiate a multipart upload once the stream proves to span more
/// than one chunk, and tag passing chunks with the upload id.
///
/// Runs in a single worker.
pub struct StartMultipartUploadStage {
    engine: Arc<StorageEngine>,
    remote_path: String,
    chunk_size: u64,
    upload_id: Option<Arc<String>>,
    /// Shared with the pipeline entrypoint for abort-on-error.
    upload_id_slot: Arc<Mutex<Option<String>>>,
}

impl StartMultipartUploadStage {
    pub fn new(
        engine: Arc<StorageEngine>,
        remote_path: String,
        chunk_size: u64,
        upload_id_slot: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            engine,
            remote_path,
            chunk_size,
            upload_id: None,
            upload_id_slot,
        }
    }
}

impl Stage for StartMultipartUploadStage {
    type In = Vec<u8>;
    type Out = UploadingChunk;

    fn on_item(
        &mut self,
        item: Vec<u8>,
        index: u64,
        out: &mut dyn Emitter<UploadingChunk>,
    ) -> Result<()> {
        debug_assert!(item.len() as u64 <= self.chunk_size);

        // A full first chunk implies more data follows; switch to
        // multipart. A single short chunk is uploaded with plain put.
        if self.upload_id.is_none() && item.len() as u64 == self.chunk_size {
            let upload_id = self.engine.create_multipart_upload(&self.remote_path)?;
            debug!(remote_path = %self.remote_path, upload_id, "Started multipart upload");
            *self.upload_id_slot.lock() = Some(upload_id.clone());
            self.upload_id = Some(Arc::new(upload_id));
        }

        out.emit(UploadingChunk {
            data: item,
            sequence: index,
            upload_id: self.upload_id.clone(),
        })
    }
}

/// Upload tagged chunks. Chunks without an upload id (single-chunk
/// objects) fall back to a plain put.
///
/// May run in several parallel workers; part numbers come from the
/// sequence assigned by the start stage.
pub struct UploadPartStage {
    engine: Arc<StorageEngine>,
    remote_path: String,
}

impl UploadPartStage {
    pub fn new(engine: Arc<StorageEngine>, remote_path: String) -> Self {
        Self {
            engine,
            remote_path,
        }
    }
}

impl Stage for UploadPartStage {
    type In = UploadingChunk;
    type Out = UploadingChunk;

    fn on_item(
        &mut self,
        item: UploadingChunk,
        _index: u64,
        out: &mut dyn Emitter<UploadingChunk>,
    ) -> Result<()> {
        match &item.upload_id {
            Some(upload_id) => {
                // Part numbers start at 1.
                let part_number = item.sequence as u32 + 1;
                self.engine
                    .upload_part(&self.remote_path, upload_id, part_number, &item.data)?;
            }
            None => {
                self.engine.put(&self.remote_path, &item.data)?;
            }
        }
        out.emit(UploadingChunk {
            data: Vec::new(),
            sequence: item.sequence,
            upload_id: item.upload_id,
        })
    }
}

/// Finalize the multipart upload once all parts have passed through.
///
/// Runs in a single worker.
pub struct CompleteMultipartUploadStage {
    engine: Arc<StorageEngine>,
    remote_path: String,
    upload_id: Option<Arc<String>>,
    upload_id_slot: Arc<Mutex<Option<String>>>,
}

impl CompleteMultipartUploadStage {
    pub fn new(
        engine: Arc<StorageEngine>,
        remote_path: String,
        upload_id_slot: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            engine,
            remote_path,
            upload_id: None,
            upload_id_slot,
        }
    }
}

impl Stage for CompleteMultipartUploadStage {
    type In = UploadingChunk;
    type Out = ();

    fn on_item(&mut self, item: UploadingChunk, _index: u64, _out: &mut dyn Emitter<()>) -> Result<()> {
        if self.upload_id.is_none() {
            self.upload_id = item.upload_id;
        }
        Ok(())
    }

    fn on_done(&mut self, _out: &mut dyn Emitter<()>) -> Result<()> {
        if let Some(upload_id) = &self.upload_id {
            self.engine
                .complete_multipart_upload(&self.remote_path, upload_id)?;
            debug!(remote_path = %self.remote_path, "Completed multipart upload");
            // Completed uploads must not be aborted by the error path.
            self.upload_id_slot.lock().take();
        }
        Ok(())
    }
}

/// Multipart download by ranged gets of the configured chunk size.
pub struct DownloadStorageStage {
    engine: Arc<StorageEngine>,
    remote_path: String,
    chunk_size: u64,
    download_id: Option<String>,
}

impl DownloadStorageStage {
    pub fn new(engine: Arc<StorageEngine>, remote_path: String, chunk_size: u64) -> Self {
        Self {
            engine,
            remote_path,
            chunk_size,
            download_id: None,
        }
    }
}

impl InputStage for DownloadStorageStage {
    type Out = Vec<u8>;

    fn on_start(&mut self, _out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        self.download_id = Some(self.engine.create_multipart_download(&self.remote_path)?);
        Ok(())
    }

    fn produce(&mut self, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let download_id = self.download_id.as_ref().expect("set by on_start");
        while let Some(data) = self.engine.download_part(download_id, self.chunk_size)? {
            out.emit(data)?;
        }
        Ok(())
    }

    fn on_done(&mut self, _out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        if let Some(download_id) = self.download_id.take() {
            self.engine.complete_multipart_download(&download_id)?;
        }
        Ok(())
    }
}
