//! Append-only JSONL log file.
//!
//! Every process appends to the same file and flushes each line, so
//! `tail -f ~/.dispatch/logs/dispatch.jsonl | jq` follows all of them.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// `~/.dispatch/logs/dispatch.jsonl`, relative to the working directory when
/// there is no home directory.
pub fn default_log_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".dispatch")
        .join("logs")
        .join("dispatch.jsonl")
}

/// Shared, line-flushed writer over the log file.
#[derive(Clone)]
pub struct CentralLogWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl CentralLogWriter {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(8192, file))),
        })
    }
}

impl Write for CentralLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock();
        let written = guard.write(buf)?;
        guard.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for CentralLogWriter {
    type Writer = CentralLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn appends_and_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deeply").join("nested").join("dispatch.jsonl");

        let mut first = CentralLogWriter::open(&path).unwrap();
        first.write_all(b"one\n").unwrap();
        let mut second = CentralLogWriter::open(&path).unwrap();
        second.write_all(b"two\n").unwrap();

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn default_path_ends_in_dispatch_logs() {
        let path = default_log_path();
        assert!(path.ends_with(".dispatch/logs/dispatch.jsonl"));
    }
}
