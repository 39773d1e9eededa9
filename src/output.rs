//! Output capture for task runs.
//!
//! A run's stdout and stderr are each pumped into a [`LogWriter`]. Two
//! writers exist: [`MemoryLog`] keeps everything in a growable buffer, and
//! [`FileLog`] streams into an append-mode file. Both can be read back as text
//! while the run is live or after it has finished.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

/// Capability set shared by every capture target.
pub trait LogWriter: Send + Sync + fmt::Debug {
    /// Appends raw bytes.
    fn write(&self, bytes: &[u8]) -> io::Result<()>;
    /// Flushes and releases any underlying resource. Idempotent.
    fn close(&self) -> io::Result<()>;
    /// Everything captured so far, decoded lossily.
    fn text(&self) -> String;
}

pub type SharedLog = Arc<dyn LogWriter>;

/// In-memory accumulator. `close` is a no-op.
#[derive(Debug, Default)]
pub struct MemoryLog {
    buf: Mutex<Vec<u8>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogWriter for MemoryLog {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn text(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// File-backed writer. Reading back returns only what this writer appended.
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    offset: u64,
    file: Mutex<Option<BufWriter<File>>>,
}

impl FileLog {
    /// Opens `path` for appending, creating it and its parent directories.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();
        Ok(Self {
            path,
            offset,
            file: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    fn read_back(&self) -> io::Result<String> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl LogWriter for FileLog {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match file.as_mut() {
            Some(writer) => writer.write_all(bytes),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("log file {} is closed", self.path.display()),
            )),
        }
    }

    fn close(&self) -> io::Result<()> {
        let taken = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    fn text(&self) -> String {
        {
            let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(writer) = file.as_mut() {
                let _ = writer.flush();
            }
        }
        self.read_back().unwrap_or_else(|err| {
            warn!(path = %self.path.display(), error = %err, "failed to read back log file");
            String::new()
        })
    }
}

/// Opens the capture target for one stream.
///
/// An empty target means in-memory capture. A file that cannot be opened
/// falls back to memory and logs a warning.
pub fn open_log(target: &str) -> SharedLog {
    if target.is_empty() {
        return Arc::new(MemoryLog::new());
    }
    match FileLog::open(target) {
        Ok(log) => Arc::new(log),
        Err(err) => {
            warn!(path = target, error = %err, "unable to open log file, capturing in memory");
            Arc::new(MemoryLog::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_accumulates() {
        let log = MemoryLog::new();
        log.write(b"hello ").unwrap();
        log.write(b"world\n").unwrap();
        log.close().unwrap();
        log.write(b"after close\n").unwrap();
        assert_eq!(log.text(), "hello world\nafter close\n");
    }

    #[test]
    fn file_log_reads_back_only_its_own_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.log");

        let first = FileLog::open(&path).unwrap();
        first.write(b"first run\n").unwrap();
        first.close().unwrap();

        let second = FileLog::open(&path).unwrap();
        second.write(b"second run\n").unwrap();
        assert_eq!(second.text(), "second run\n");
        second.close().unwrap();

        assert!(second.write(b"late").is_err());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "first run\nsecond run\n"
        );
    }

    #[test]
    fn unopenable_file_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let log = open_log(dir.path().to_str().unwrap());
        log.write(b"kept\n").unwrap();
        assert_eq!(log.text(), "kept\n");
    }

    #[test]
    fn empty_target_is_memory() {
        let log = open_log("");
        log.write(b"x").unwrap();
        assert_eq!(log.text(), "x");
    }
}
