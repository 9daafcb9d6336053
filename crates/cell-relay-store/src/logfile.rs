//! Buffered per-request output log file.

use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::{fs, io::AsyncWriteExt};

use crate::StoreError;

/// Buffered chunks held before an automatic flush.
const FLUSH_THRESHOLD: usize = 100;

/// One physical log file per request, under a date-bucketed directory.
///
/// The file is created lazily on the first flush and named by a
/// high-resolution timestamp, e.g. `.log/20260807/20260807-153012-0042.log`.
/// Appends buffer in memory; `flush` writes them out. Owned exclusively by
/// the request being logged.
pub struct OutputLog {
    root: PathBuf,
    path: Option<PathBuf>,
    file: Option<fs::File>,
    buffer: Vec<String>,
    bytes_written: u64,
    closed: bool,
}

impl OutputLog {
    /// Create a log rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path: None,
            file: None,
            buffer: Vec::new(),
            bytes_written: 0,
            closed: false,
        }
    }

    /// Queue a chunk for writing. Ignored once the log is closed.
    pub fn append(&mut self, text: impl Into<String>) {
        if self.closed {
            return;
        }
        self.buffer.push(text.into());
    }

    /// Write buffered chunks out when forced, on first use, or once the
    /// buffer has grown past the threshold.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written.
    pub async fn flush(&mut self, force: bool) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        if !force && self.path.is_some() && self.buffer.len() <= FLUSH_THRESHOLD {
            return Ok(());
        }

        if self.file.is_none() {
            let path = self.allocate_path();
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).await?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            tracing::debug!(path = %path.display(), "opened output log");
            self.path = Some(path);
            self.file = Some(file);
        }

        if !self.buffer.is_empty() {
            let chunk = self.buffer.concat();
            self.buffer.clear();
            let file = self.file.as_mut().ok_or_else(|| {
                StoreError::Io(std::io::Error::other("log file vanished"))
            })?;
            file.write_all(chunk.as_bytes()).await?;
            self.bytes_written += chunk.len() as u64;
        }
        Ok(())
    }

    /// Flush remaining chunks and close the file. Idempotent.
    ///
    /// # Errors
    /// Returns error if the final write fails.
    pub async fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.flush(true).await?;
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        self.closed = true;
        Ok(())
    }

    /// Physical path, available after the first flush.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bytes written to disk so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn allocate_path(&self) -> PathBuf {
        let now = Local::now();
        let bucket = now.format("%Y%m%d").to_string();
        let name = format!(
            "{}-{:04}.log",
            now.format("%Y%m%d-%H%M%S"),
            now.timestamp_subsec_millis()
        );
        self.root.join(bucket).join(name)
    }
}
