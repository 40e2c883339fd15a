// Filesystem pipeline stages - file reading, TAR framing, chunking and
// the inverse writing stages

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use std::sync::Arc;

use tracing::debug;

use crate::error::{BackupError, Result};
use crate::pipeline::bytes_fifo::BytesFifo;
use crate::pipeline::stage::{Emitter, InputStage, Stage};
use crate::pipeline::tar;

/// Emit chunks of a single file.
pub struct ReadFileStage {
    path: PathBuf,
    chunk_size: usize,
}

impl ReadFileStage {
    pub fn new(path: PathBuf, chunk_size: u64) -> Self {
        Self {
            path,
            chunk_size: chunk_size as usize,
        }
    }
}

impl InputStage for ReadFileStage {
    type Out = Vec<u8>;

    fn produce(&mut self, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let mut file = File::open(&self.path)?;
        loop {
            let mut buf = vec![0u8; self.chunk_size];
            let read = file.read(&mut buf)?;
            if read == 0 {
                return Ok(());
            }
            buf.truncate(read);
            out.emit(buf)?;
        }
    }
}

/// Recursively enumerate files under a directory, relative to it, in a
/// deterministic order.
pub fn scan_dir_files(base: &Path, exclude_file_names: &[String]) -> Result<Vec<PathBuf>> {
    fn walk(
        base: &Path,
        dir: &Path,
        exclude: &[String],
        out: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let mut entries: Vec<_> =
            std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, exclude, out)?;
            } else {
                let name = entry.file_name().to_string_lossy().to_string();
                if exclude.iter().any(|e| *e == name) {
                    continue;
                }
                let relative = path
                    .strip_prefix(base)
                    .map_err(|_| BackupError::Pipeline("Path outside base dir".to_string()))?;
                out.push(relative.to_path_buf());
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(base, base, exclude_file_names, &mut files)?;
    Ok(files)
}

/// Read files and emit them as a TAR byte stream.
///
/// Either takes an explicit ordered file list or scans the directory.
pub struct ReadFilesTarballStage {
    base_path: PathBuf,
    files: Option<Vec<PathBuf>>,
    exclude_file_names: Vec<String>,
    chunk_size: usize,
}

impl ReadFilesTarballStage {
    pub fn with_files(base_path: PathBuf, files: Vec<PathBuf>, chunk_size: u64) -> Self {
        Self {
            base_path,
            files: Some(files),
            exclude_file_names: Vec::new(),
            chunk_size: chunk_size as usize,
        }
    }

    pub fn scan(base_path: PathBuf, exclude_file_names: Vec<String>, chunk_size: u64) -> Self {
        Self {
            base_path,
            files: None,
            exclude_file_names,
            chunk_size: chunk_size as usize,
        }
    }

    fn emit_file(&self, relative: &Path, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let path = self.base_path.join(relative);
        let metadata = std::fs::metadata(&path)?;
        let mtime = metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let name = relative.to_string_lossy();
        out.emit(tar::entry_headers(&name, metadata.len(), mtime))?;

        let mut file = File::open(&path)?;
        let mut total = 0u64;
        loop {
            let mut buf = vec![0u8; self.chunk_size];
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            total += read as u64;
            buf.truncate(read);
            out.emit(buf)?;
        }

        // Pad the last block of the file to the TAR block boundary.
        let padding = tar::block_padding(total);
        if padding > 0 {
            out.emit(vec![0u8; padding])?;
        }
        Ok(())
    }
}

impl InputStage for ReadFilesTarballStage {
    type Out = Vec<u8>;

    fn produce(&mut self, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let files = match self.files.take() {
            Some(files) => files,
            None => scan_dir_files(&self.base_path, &self.exclude_file_names)?,
        };
        for relative in &files {
            self.emit_file(relative, out)?;
        }
        Ok(())
    }
}

/// Re-chunk an arbitrary byte stream into fixed-size chunks backed by a
/// ring buffer. The final chunk may be short.
pub struct ChunkingStage {
    chunk_size: usize,
    buffer: BytesFifo,
}

impl ChunkingStage {
    pub fn new(chunk_size: u64, buffer_size: u64) -> Self {
        assert!(
            chunk_size > 0 && chunk_size <= buffer_size,
            "chunk size must fit the buffer"
        );
        Self {
            chunk_size: chunk_size as usize,
            buffer: BytesFifo::new(buffer_size as usize),
        }
    }
}

impl Stage for ChunkingStage {
    type In = Vec<u8>;
    type Out = Vec<u8>;

    fn on_item(&mut self, item: Vec<u8>, _index: u64, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let mut data = &item[..];
        while !data.is_empty() {
            let written = self.buffer.write(data);
            data = &data[written..];

            while self.buffer.len() >= self.chunk_size {
                out.emit(self.buffer.read(self.chunk_size))?;
            }
        }
        Ok(())
    }

    fn on_done(&mut self, out: &mut dyn Emitter<Vec<u8>>) -> Result<()> {
        let rest = self.buffer.read_all();
        if !rest.is_empty() {
            out.emit(rest)?;
        }
        Ok(())
    }
}

/// Write the byte stream to a single file.
pub struct WriteFileStage {
    path: PathBuf,
    file: Option<File>,
}

impl WriteFileStage {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }
}

impl Stage for WriteFileStage {
    type In = Vec<u8>;
    type Out = ();

    fn on_start(&mut self, _out: &mut dyn Emitter<()>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.file = Some(File::create(&self.path)?);
        Ok(())
    }

    fn on_item(&mut self, item: Vec<u8>, _index: u64, _out: &mut dyn Emitter<()>) -> Result<()> {
        self.file
            .as_mut()
            .expect("on_start opens the file")
            .write_all(&item)?;
        Ok(())
    }

    fn on_done(&mut self, _out: &mut dyn Emitter<()>) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

enum UntarState {
    ReadHeader,
    // A name longer than the header field arrives as a special entry:
    // a header of type L followed by data blocks holding the name.
    ReadLongName,
    ReadData,
    SkipBytes,
}

/// Unarchive a TAR stream into files under a directory.
pub struct WriteFilesStage {
    dir: PathBuf,
    stream: BytesFifo,
    state: UntarState,
    bytes_to_process: u64,
    entry_size: u64,
    file: Option<File>,
    long_name: Option<Vec<u8>>,
    finished: bool,
}

impl WriteFilesStage {
    pub fn new(dir: PathBuf, buffer_size: u64) -> Self {
        assert!(
            buffer_size >= tar::BLOCK_SIZE as u64,
            "TAR stream buffer cannot be smaller than one block"
        );
        Self {
            dir,
            stream: BytesFifo::new(buffer_size as usize),
            state: UntarState::ReadHeader,
            bytes_to_process: 0,
            entry_size: 0,
            file: None,
            long_name: None,
            finished: false,
        }
    }

    fn read_header(&mut self) -> Result<bool> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        if self.stream.len() < tar::BLOCK_SIZE {
            return Ok(false);
        }

        let block = self.stream.read(tar::BLOCK_SIZE);
        let header = match tar::parse_header(&block)? {
            Some(header) => header,
            None => {
                // Padding block; the stream carries no further entries.
                self.finished = true;
                return Ok(false);
            }
        };

        self.entry_size = header.size;
        self.bytes_to_process = header.size;

        if header.typeflag == tar::TYPE_GNU_LONGNAME {
            self.state = UntarState::ReadLongName;
            self.long_name = Some(Vec::new());
            return Ok(true);
        }

        let name_bytes = match self.long_name.take() {
            // Drop the trailing NUL of the accumulated long name.
            Some(mut name) => {
                name.pop();
                name
            }
            None => header.name,
        };
        let name = String::from_utf8(name_bytes)
            .map_err(|_| BackupError::Pipeline("Non-UTF-8 file name in TAR stream".to_string()))?;

        let path = self.dir.join(&name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(name, size = self.entry_size, "Unpacking file");
        self.file = Some(File::create(&path)?);
        self.state = UntarState::ReadData;
        Ok(true)
    }

    fn process_long_name(&mut self) -> Result<bool> {
        let buf = self.stream.read(self.bytes_to_process as usize);
        self.bytes_to_process -= buf.len() as u64;
        self.long_name
            .as_mut()
            .expect("set when entering ReadLongName")
            .extend_from_slice(&buf);

        if self.bytes_to_process > 0 {
            return Ok(false);
        }
        self.enter_skip();
        Ok(true)
    }

    fn process_data(&mut self) -> Result<bool> {
        let buf = self.stream.read(self.bytes_to_process as usize);
        self.file
            .as_mut()
            .expect("set when entering ReadData")
            .write_all(&buf)?;
        self.bytes_to_process -= buf.len() as u64;

        if self.bytes_to_process > 0 {
            return Ok(false);
        }
        self.enter_skip();
        Ok(true)
    }

    fn enter_skip(&mut self) {
        self.state = UntarState::SkipBytes;
        self.bytes_to_process = tar::block_padding(self.entry_size) as u64;
    }

    fn skip_bytes(&mut self) -> Result<bool> {
        let buf = self.stream.read(self.bytes_to_process as usize);
        self.bytes_to_process -= buf.len() as u64;
        if self.bytes_to_process > 0 {
            return Ok(false);
        }
        self.state = UntarState::ReadHeader;
        Ok(true)
    }
}

impl Stage for WriteFilesStage {
    type In = Vec<u8>;
    type Out = ();

    fn on_item(&mut self, item: Vec<u8>, _index: u64, _out: &mut dyn Emitter<()>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let written = self.stream.write(&item);
        if written != item.len() {
            return Err(BackupError::Pipeline(format!(
                "TAR stream buffer of {} bytes cannot accept a chunk of {} bytes",
                self.stream.capacity(),
                item.len()
            )));
        }

        loop {
            let advanced = match self.state {
                UntarState::ReadHeader => self.read_header()?,
                UntarState::ReadLongName => self.process_long_name()?,
                UntarState::ReadData => self.process_data()?,
                UntarState::SkipBytes => self.skip_bytes()?,
            };
            if !advanced || self.finished {
                return Ok(());
            }
        }
    }

    fn on_done(&mut self, _out: &mut dyn Emitter<()>) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Concatenate the byte stream into a shared buffer.
pub struct CollectDataStage {
    into: Arc<Mutex<Vec<u8>>>,
}

impl CollectDataStage {
    pub fn new(into: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { into }
    }
}

impl Stage for CollectDataStage {
    type In = Vec<u8>;
    type Out = ();

    fn on_item(&mut self, item: Vec<u8>, _index: u64, _out: &mut dyn Emitter<()>) -> Result<()> {
        self.into.lock().extend_from_slice(&item);
        Ok(())
    }
}

/// Delete local files once the stream has fully passed through.
pub struct DeleteFilesStage {
    files: Vec<PathBuf>,
}

impl DeleteFilesStage {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }
}

impl Stage for DeleteFilesStage {
    type In = ();
    type Out = ();

    fn on_item(&mut self, _item: (), _index: u64, _out: &mut dyn Emitter<()>) -> Result<()> {
        Ok(())
    }

    fn on_done(&mut self, _out: &mut dyn Emitter<()>) -> Result<()> {
        for file in &self.files {
            match std::fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
