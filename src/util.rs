// Auxiliary helpers - path escaping, size calculators, misc formatting

use std::path::Path;

use chrono::{DateTime, Utc};

/// TAR block size in bytes.
pub const TAR_BLOCK_SIZE: u64 = 512;

/// Maximum file name length representable in a plain TAR header.
pub const TAR_NAME_LENGTH: usize = 100;

/// Escape a logical identifier (database, table) for use as a single
/// path segment of a remote object key.
///
/// All characters outside `[A-Za-z0-9_~]` are percent-encoded. `.` and
/// `-` are escaped too so the result is a single-segment token on the
/// database side as well.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'~' => out.push(byte as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{:02X}", byte));
            }
        }
    }
    out
}

/// Current time with timezone.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Split a slice into chunks of at most `chunk_size` elements.
pub fn chunked<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Vec<T>> {
    assert!(chunk_size > 0);
    items.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

/// Total size of files on disk with each file padded to `alignment`.
pub fn calc_aligned_files_size(files: &[std::path::PathBuf], alignment: u64) -> std::io::Result<u64> {
    let mut size = 0;
    for file in files {
        let file_size = std::fs::metadata(file)?.len();
        let remainder = file_size % alignment;
        size += if remainder > 0 {
            file_size + alignment - remainder
        } else {
            file_size
        };
    }
    Ok(size)
}

/// Predicted size of a TAR archive holding the given files.
///
/// `aligned_files_size` is the summed size of all files with each one
/// padded to the TAR block boundary.
pub fn calc_tarball_size(file_names: &[String], aligned_files_size: u64) -> u64 {
    let mut result = aligned_files_size;
    for name in file_names {
        if name.len() < TAR_NAME_LENGTH {
            result += TAR_BLOCK_SIZE;
        } else {
            // long name header + name data + file header
            result += (div_ceil(name.len() as u64, TAR_BLOCK_SIZE) + 2) * TAR_BLOCK_SIZE;
        }
    }
    result
}

/// Size of `data_size` bytes after chunked authenticated encryption.
pub fn calc_encrypted_size(data_size: u64, chunk_size: u64, metadata_size: u64) -> u64 {
    data_size + div_ceil(data_size, chunk_size) * metadata_size
}

pub fn div_ceil(value: u64, divisor: u64) -> u64 {
    assert!(divisor > 0);
    (value + divisor - 1) / divisor
}

/// Last modification time of a file. Returns None if the file is gone
/// or its metadata cannot be read.
pub fn file_mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Join a remote key prefix and a relative component with `/`.
pub fn join_key(prefix: &str, component: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let component = component.trim_start_matches('/');
    if prefix.is_empty() {
        component.to_string()
    } else {
        format!("{}/{}", prefix, component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("db-1.shard"), "db%2D1%2Eshard");
        assert_eq!(escape("plain_name~"), "plain_name~");
        assert_eq!(escape("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_tarball_size_short_names() {
        let names = vec!["a.bin".to_string(), "b.bin".to_string()];
        // two headers on top of aligned content
        assert_eq!(calc_tarball_size(&names, 1024), 1024 + 2 * 512);
    }

    #[test]
    fn test_tarball_size_long_name() {
        let long = "x".repeat(150);
        // long name header + one block of name data + file header
        assert_eq!(calc_tarball_size(&[long], 512), 512 + 3 * 512);
    }

    #[test]
    fn test_encrypted_size() {
        // 3 chunks of 4 bytes with 2 bytes of overhead each
        assert_eq!(calc_encrypted_size(10, 4, 2), 10 + 3 * 2);
        assert_eq!(calc_encrypted_size(8, 4, 2), 8 + 2 * 2);
        assert_eq!(calc_encrypted_size(0, 4, 2), 0);
    }

    #[test]
    fn test_chunked() {
        let items = vec![1, 2, 3, 4, 5];
        let chunks = chunked(&items, 2);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("backups/", "/b1"), "backups/b1");
        assert_eq!(join_key("", "b1"), "b1");
    }
}
