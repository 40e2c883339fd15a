// Transfer pipeline integration: chunked multipart upload and download
// with compression, encryption and rate limiting over local storage.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rusty_backup::config::Config;
use rusty_backup::pipeline::pipelines::{
    download_data, download_files, upload_data, upload_files_tarball_scan, TransferConfig,
};
use rusty_backup::storage::{get_storage_engine, StorageEngine};

fn multipart_config(root: &std::path::Path) -> Config {
    let mut config = common::base_config(root);
    // Force several storage chunks per object.
    config.storage.chunk_size = 4 * 1024;
    config.storage.buffer_size = 16 * 1024;
    config.encryption.chunk_size = 8 * 1024;
    config.encryption.buffer_size = 32 * 1024;
    config.rate_limiter.max_upload_rate = 8 * 1024 * 1024;
    config.rate_limiter.retry_interval_ms = 1;
    config
}

fn engine_for(config: &Config) -> Arc<StorageEngine> {
    get_storage_engine(config).unwrap()
}

#[test]
fn test_upload_download_data_roundtrip_multipart() {
    let dir = tempfile::tempdir().unwrap();
    let config = multipart_config(dir.path());
    let engine = engine_for(&config);
    let transfer = TransferConfig::from_config(&config);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    upload_data(
        Arc::clone(&engine),
        transfer.clone(),
        Arc::new(AtomicBool::new(false)),
        payload.clone(),
        "backups/obj".to_string(),
        true,
    )
    .unwrap();

    assert!(engine.exists("backups/obj").unwrap());
    let downloaded = download_data(
        Arc::clone(&engine),
        transfer,
        Arc::new(AtomicBool::new(false)),
        "backups/obj".to_string(),
        true,
    )
    .unwrap();
    assert_eq!(downloaded, payload);
}

#[test]
fn test_upload_data_without_encryption_is_stored_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = multipart_config(dir.path());
    config.rate_limiter.max_upload_rate = 0;
    let engine = engine_for(&config);
    let transfer = TransferConfig::from_config(&config);

    let payload = b"plain metadata document".to_vec();
    upload_data(
        Arc::clone(&engine),
        transfer,
        Arc::new(AtomicBool::new(false)),
        payload.clone(),
        "backups/meta.json".to_string(),
        false,
    )
    .unwrap();

    assert_eq!(engine.get("backups/meta.json").unwrap(), payload);
}

#[test]
fn test_tarball_scan_upload_and_untar_download() {
    let dir = tempfile::tempdir().unwrap();
    let config = multipart_config(dir.path());
    let engine = engine_for(&config);
    let transfer = TransferConfig::from_config(&config);

    let src = dir.path().join("src");
    std::fs::create_dir_all(src.join("nested")).unwrap();
    let big: Vec<u8> = (0..60_000u32).map(|i| (i % 199) as u8).collect();
    std::fs::write(src.join("data.bin"), &big).unwrap();
    std::fs::write(src.join("nested/count.txt"), b"42").unwrap();
    std::fs::write(src.join("skip.tmp"), b"excluded").unwrap();
    let long_name = "f".repeat(120);
    std::fs::write(src.join(&long_name), b"long-named file").unwrap();

    upload_files_tarball_scan(
        Arc::clone(&engine),
        transfer.clone(),
        Arc::new(AtomicBool::new(false)),
        src.clone(),
        vec!["skip.tmp".to_string()],
        "backups/part.tar".to_string(),
        128 * 1024,
        true,
        true,
    )
    .unwrap();

    let dst = dir.path().join("dst");
    download_files(
        engine,
        transfer,
        Arc::new(AtomicBool::new(false)),
        "backups/part.tar".to_string(),
        dst.clone(),
        true,
        true,
    )
    .unwrap();

    assert_eq!(std::fs::read(dst.join("data.bin")).unwrap(), big);
    assert_eq!(std::fs::read(dst.join("nested/count.txt")).unwrap(), b"42");
    assert_eq!(
        std::fs::read(dst.join(&long_name)).unwrap(),
        b"long-named file"
    );
    assert!(!dst.join("skip.tmp").exists());
}

#[test]
fn test_failed_upload_leaves_no_object() {
    let dir = tempfile::tempdir().unwrap();
    let config = multipart_config(dir.path());
    let engine = engine_for(&config);
    let transfer = TransferConfig::from_config(&config);

    // Missing local file: the pipeline fails before anything lands.
    let result = rusty_backup::pipeline::pipelines::upload_file(
        Arc::clone(&engine),
        transfer,
        Arc::new(AtomicBool::new(false)),
        dir.path().join("no-such-file.bin"),
        "backups/obj".to_string(),
        true,
        false,
    );
    assert!(result.is_err());
    assert!(!engine.exists("backups/obj").unwrap());
}
