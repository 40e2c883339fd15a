// Pipeline entrypoints - compose stages into the standard transfer
// chains and run them to completion. These functions are what the
// executor schedules as background jobs.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;

use crate::compression::get_compression;
use crate::config::{
    CompressionConfig, CompressionKind, EncryptionConfig, FilesystemConfig, RateLimiterConfig,
    StorageConfig,
};
use crate::encryption::get_encryption;
use crate::error::Result;
use crate::pipeline::runner::Pipeline;
use crate::pipeline::stage::{Emitter, InputStage};
use crate::pipeline::stages::filesystem::{
    ChunkingStage, CollectDataStage, DeleteFilesStage, ReadFileStage, ReadFilesTarballStage,
    WriteFileStage, WriteFilesStage,
};
use crate::pipeline::stages::storage::{
    CompleteMultipartUploadStage, DownloadStorageStage, RateLimiterStage,
    StartMultipartUploadStage, UploadPartStage,
};
use crate::pipeline::stages::transform::{CompressStage, DecompressStage, DecryptStage, EncryptStage};
use crate::storage::StorageEngine;
use crate::util::div_ceil;

/// Stage configuration bundle carried into pipeline jobs.
#[derive(Clone)]
pub struct TransferConfig {
    pub filesystem: FilesystemConfig,
    pub storage: StorageConfig,
    pub encryption: EncryptionConfig,
    pub compression: CompressionConfig,
    pub rate_limiter: RateLimiterConfig,
}

impl TransferConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            filesystem: config.filesystem.clone(),
            storage: config.storage.clone(),
            encryption: config.encryption.clone(),
            compression: config.compression.clone(),
            rate_limiter: config.rate_limiter.clone(),
        }
    }
}

/// Emit a single in-memory buffer.
struct IterableStage {
    data: Option<Vec<u8>>,
}

impl InputStage for IterableStage {
    type Out = Vec<u8>;

    fn produce(&mut self, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        if let Some(data) = self.data.take() {
            if !data.is_empty() {
                out.emit(data)?;
            }
        }
        Ok(())
    }
}

/// Multiply chunk and buffer size so the object fits the backend's
/// part-count limit.
fn adjust_chunk_size(storage: &StorageConfig, source_size: u64) -> (u64, u64) {
    let mut chunk_size = storage.chunk_size;
    let mut buffer_size = storage.buffer_size;
    if source_size > chunk_size {
        let chunk_count = div_ceil(source_size, chunk_size);
        if chunk_count > storage.max_chunk_count {
            let multiplier = div_ceil(chunk_count, storage.max_chunk_count);
            chunk_size *= multiplier;
            buffer_size *= multiplier;
        }
    }
    (chunk_size, buffer_size)
}

fn add_encrypt_stages(
    pipeline: &mut Pipeline,
    rx: Receiver<Vec<u8>>,
    config: &TransferConfig,
) -> Result<Receiver<Vec<u8>>> {
    let cryptor = get_encryption(&config.encryption)?;
    let queue_size = config.encryption.queue_size;
    let rx = pipeline.add_stage(
        rx,
        ChunkingStage::new(config.encryption.chunk_size, config.encryption.buffer_size),
        queue_size,
    );
    Ok(pipeline.add_stage(rx, EncryptStage::new(cryptor), queue_size))
}

fn add_decrypt_stages(
    pipeline: &mut Pipeline,
    rx: Receiver<Vec<u8>>,
    config: &TransferConfig,
) -> Result<Receiver<Vec<u8>>> {
    let cryptor = get_encryption(&config.encryption)?;
    let queue_size = config.encryption.queue_size;
    // One ciphertext chunk is one plaintext chunk plus its metadata.
    let chunk_size = config.encryption.chunk_size + cryptor.metadata_size();
    let rx = pipeline.add_stage(
        rx,
        ChunkingStage::new(chunk_size, config.encryption.buffer_size.max(chunk_size)),
        queue_size,
    );
    Ok(pipeline.add_stage(rx, DecryptStage::new(cryptor), queue_size))
}

fn add_compress_stage(
    pipeline: &mut Pipeline,
    rx: Receiver<Vec<u8>>,
    config: &TransferConfig,
) -> Receiver<Vec<u8>> {
    let queue_size = config.compression.queue_size;
    pipeline.add_stage(rx, CompressStage::new(get_compression(&config.compression)), queue_size)
}

fn add_decompress_stage(
    pipeline: &mut Pipeline,
    rx: Receiver<Vec<u8>>,
    config: &TransferConfig,
) -> Receiver<Vec<u8>> {
    let queue_size = config.compression.queue_size;
    pipeline.add_stage(
        rx,
        DecompressStage::new(get_compression(&config.compression)),
        queue_size,
    )
}

struct UploadTail {
    rx: Receiver<()>,
    upload_id_slot: Arc<Mutex<Option<String>>>,
}

fn add_upload_stages(
    pipeline: &mut Pipeline,
    rx: Receiver<Vec<u8>>,
    engine: &Arc<StorageEngine>,
    config: &TransferConfig,
    remote_path: &str,
    source_size: u64,
) -> UploadTail {
    let queue_size = config.storage.queue_size;

    let rx = pipeline.add_stage(
        rx,
        RateLimiterStage::new(
            config.rate_limiter.max_upload_rate,
            Duration::from_millis(config.rate_limiter.retry_interval_ms),
        ),
        queue_size,
    );

    let (chunk_size, buffer_size) = adjust_chunk_size(&config.storage, source_size);
    let rx = pipeline.add_stage(rx, ChunkingStage::new(chunk_size, buffer_size), queue_size);

    let upload_id_slot = Arc::new(Mutex::new(None));
    let rx = pipeline.add_stage(
        rx,
        StartMultipartUploadStage::new(
            Arc::clone(engine),
            remote_path.to_string(),
            chunk_size,
            Arc::clone(&upload_id_slot),
        ),
        queue_size,
    );

    let rx = pipeline.add_parallel_stage(
        rx,
        queue_size,
        config.storage.uploading_threads,
        || UploadPartStage::new(Arc::clone(engine), remote_path.to_string()),
    );

    let rx = pipeline.add_stage(
        rx,
        CompleteMultipartUploadStage::new(
            Arc::clone(engine),
            remote_path.to_string(),
            Arc::clone(&upload_id_slot),
        ),
        queue_size,
    );

    UploadTail { rx, upload_id_slot }
}

fn run_upload(
    pipeline: Pipeline,
    engine: &Arc<StorageEngine>,
    remote_path: &str,
    upload_id_slot: Arc<Mutex<Option<String>>>,
) -> Result<()> {
    match pipeline.run() {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(upload_id) = upload_id_slot.lock().take() {
                engine.abort_multipart_upload(remote_path, &upload_id);
            }
            Err(e)
        }
    }
}

/// Upload an in-memory buffer.
pub fn upload_data(
    engine: Arc<StorageEngine>,
    config: TransferConfig,
    cancel: Arc<AtomicBool>,
    data: Vec<u8>,
    remote_path: String,
    encrypt: bool,
) -> Result<()> {
    let source_size = data.len() as u64;
    let mut pipeline = Pipeline::new(cancel);
    let mut rx = pipeline.add_input(IterableStage { data: Some(data) }, config.filesystem.queue_size);
    if encrypt {
        rx = add_encrypt_stages(&mut pipeline, rx, &config)?;
    }
    let tail = add_upload_stages(&mut pipeline, rx, &engine, &config, &remote_path, source_size);
    drop(tail.rx);
    run_upload(pipeline, &engine, &remote_path, tail.upload_id_slot)
}

/// Upload a file from the local filesystem.
pub fn upload_file(
    engine: Arc<StorageEngine>,
    config: TransferConfig,
    cancel: Arc<AtomicBool>,
    local_path: PathBuf,
    remote_path: String,
    encrypt: bool,
    delete_after: bool,
) -> Result<()> {
    let source_size = std::fs::metadata(&local_path)?.len();
    let mut pipeline = Pipeline::new(cancel);
    let mut rx = pipeline.add_input(
        ReadFileStage::new(local_path.clone(), config.filesystem.chunk_size),
        config.filesystem.queue_size,
    );
    if encrypt {
        rx = add_encrypt_stages(&mut pipeline, rx, &config)?;
    }
    let tail = add_upload_stages(&mut pipeline, rx, &engine, &config, &remote_path, source_size);
    let rx = if delete_after {
        pipeline.add_stage(tail.rx, DeleteFilesStage::new(vec![local_path]), 1)
    } else {
        tail.rx
    };
    drop(rx);
    run_upload(pipeline, &engine, &remote_path, tail.upload_id_slot)
}

/// Archive files to a tarball and upload it.
#[allow(clippy::too_many_arguments)]
pub fn upload_files_tarball(
    engine: Arc<StorageEngine>,
    config: TransferConfig,
    cancel: Arc<AtomicBool>,
    base_path: PathBuf,
    files: Vec<PathBuf>,
    remote_path: String,
    source_size: u64,
    encrypt: bool,
    compress: bool,
    delete_after: bool,
) -> Result<()> {
    let delete_paths: Vec<PathBuf> = files.iter().map(|f| base_path.join(f)).collect();

    let mut pipeline = Pipeline::new(cancel);
    let mut rx = pipeline.add_input(
        ReadFilesTarballStage::with_files(base_path, files, config.filesystem.chunk_size),
        config.filesystem.queue_size,
    );
    if compress {
        rx = add_compress_stage(&mut pipeline, rx, &config);
    }
    if encrypt {
        rx = add_encrypt_stages(&mut pipeline, rx, &config)?;
    }
    let tail = add_upload_stages(&mut pipeline, rx, &engine, &config, &remote_path, source_size);
    let rx = if delete_after {
        pipeline.add_stage(tail.rx, DeleteFilesStage::new(delete_paths), 1)
    } else {
        tail.rx
    };
    drop(rx);
    run_upload(pipeline, &engine, &remote_path, tail.upload_id_slot)
}

/// Archive a whole directory to a tarball and upload it.
#[allow(clippy::too_many_arguments)]
pub fn upload_files_tarball_scan(
    engine: Arc<StorageEngine>,
    config: TransferConfig,
    cancel: Arc<AtomicBool>,
    dir_path: PathBuf,
    exclude_file_names: Vec<String>,
    remote_path: String,
    source_size: u64,
    encrypt: bool,
    compress: bool,
) -> Result<()> {
    let mut pipeline = Pipeline::new(cancel);
    let mut rx = pipeline.add_input(
        ReadFilesTarballStage::scan(dir_path, exclude_file_names, config.filesystem.chunk_size),
        config.filesystem.queue_size,
    );
    if compress {
        rx = add_compress_stage(&mut pipeline, rx, &config);
    }
    if encrypt {
        rx = add_encrypt_stages(&mut pipeline, rx, &config)?;
    }
    let tail = add_upload_stages(&mut pipeline, rx, &engine, &config, &remote_path, source_size);
    drop(tail.rx);
    run_upload(pipeline, &engine, &remote_path, tail.upload_id_slot)
}

/// Download an object and return its content.
pub fn download_data(
    engine: Arc<StorageEngine>,
    config: TransferConfig,
    cancel: Arc<AtomicBool>,
    remote_path: String,
    decrypt: bool,
) -> Result<Vec<u8>> {
    let collected = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = Pipeline::new(cancel);
    let mut rx = pipeline.add_input(
        DownloadStorageStage::new(Arc::clone(&engine), remote_path, config.storage.chunk_size),
        config.storage.queue_size,
    );
    if decrypt {
        rx = add_decrypt_stages(&mut pipeline, rx, &config)?;
    }
    let rx = pipeline.add_stage(rx, CollectDataStage::new(Arc::clone(&collected)), 1);
    drop(rx);
    pipeline.run()?;

    let mut collected = collected.lock();
    Ok(std::mem::take(&mut *collected))
}

/// Download an object into a single local file.
pub fn download_file(
    engine: Arc<StorageEngine>,
    config: TransferConfig,
    cancel: Arc<AtomicBool>,
    remote_path: String,
    local_path: PathBuf,
    decrypt: bool,
) -> Result<()> {
    let mut pipeline = Pipeline::new(cancel);
    let mut rx = pipeline.add_input(
        DownloadStorageStage::new(Arc::clone(&engine), remote_path, config.storage.chunk_size),
        config.storage.queue_size,
    );
    if decrypt {
        rx = add_decrypt_stages(&mut pipeline, rx, &config)?;
    }
    let rx = pipeline.add_stage(rx, WriteFileStage::new(local_path), 1);
    drop(rx);
    pipeline.run()
}

/// Download a tarball object and unpack it into a directory.
pub fn download_files(
    engine: Arc<StorageEngine>,
    config: TransferConfig,
    cancel: Arc<AtomicBool>,
    remote_path: String,
    target_dir: PathBuf,
    decrypt: bool,
    decompress: bool,
) -> Result<()> {
    let mut pipeline = Pipeline::new(cancel);
    let mut rx = pipeline.add_input(
        DownloadStorageStage::new(Arc::clone(&engine), remote_path, config.storage.chunk_size),
        config.storage.queue_size,
    );
    if decrypt {
        rx = add_decrypt_stages(&mut pipeline, rx, &config)?;
    }
    if decompress {
        rx = add_decompress_stage(&mut pipeline, rx, &config);
    }
    let rx = pipeline.add_stage(
        rx,
        WriteFilesStage::new(target_dir, config.filesystem.buffer_size),
        1,
    );
    drop(rx);
    pipeline.run()
}

/// True when the configured compression is a real algorithm.
pub fn compression_enabled(config: &TransferConfig) -> bool {
    config.compression.kind != CompressionKind::Noop
}
