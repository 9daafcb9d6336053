//! Rich-output artifact cache for end-of-request replay.

use std::path::{Path, PathBuf};

use cell_relay_core::Payload;
use tokio::fs;

use crate::StoreError;

/// Per-request store of rich outputs (structured results, errors).
///
/// Artifacts are ordinal-numbered JSON files beside the request's log file
/// (`<logstem>-<n>.json`). They exist so a client whose live view was
/// cleared for a summary still receives the full rich outputs at the end;
/// after replay they are deleted, not kept as history.
pub struct ResultCache {
    dir: PathBuf,
    stem: String,
    files: Vec<PathBuf>,
}

impl ResultCache {
    /// Create a cache colocated with the given log file.
    #[must_use]
    pub fn new(log_path: &Path) -> Self {
        let dir = log_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let stem = log_path
            .file_stem()
            .map_or_else(|| "results".to_string(), |s| s.to_string_lossy().into_owned());
        Self {
            dir,
            stem,
            files: Vec::new(),
        }
    }

    /// Persist one rich output, returning its ordinal.
    ///
    /// # Errors
    /// Returns error if the artifact cannot be written.
    pub async fn store(&mut self, payload: &Payload) -> Result<usize, StoreError> {
        let ordinal = self.files.len();
        let path = self.dir.join(format!("{}-{ordinal}.json", self.stem));
        fs::write(&path, serde_json::to_vec(payload)?).await?;
        self.files.push(path);
        Ok(ordinal)
    }

    /// Paths of the stored artifacts, in creation order.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Whether anything was cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Read artifacts back in creation order and clear the store.
    ///
    /// Unreadable artifacts are skipped with a warning; the files are
    /// removed either way.
    pub async fn replay_all(&mut self) -> Vec<Payload> {
        let mut payloads = Vec::with_capacity(self.files.len());
        for path in self.files.drain(..) {
            match fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice(&raw) {
                    Ok(payload) => payloads.push(payload),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "skipping corrupt artifact: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable artifact: {e}");
                }
            }
            let _ = fs::remove_file(&path).await;
        }
        payloads
    }
}
