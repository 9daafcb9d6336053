//! Append-only execution history keyed by logical cell id.

use std::path::{Path, PathBuf};

use cell_relay_core::ExecutionRecord;
use tokio::fs;

use crate::StoreError;

/// Prior runs rendered into the live prefix of a new run.
pub const MAX_HISTORY_SUMMARIES: usize = 2;

/// Per-cell history of past [`ExecutionRecord`]s.
///
/// One JSON file per cell id under `<root>/<cell_id>/<cell_id>.json`, plus a
/// relative symlink from the cell directory to each physical log file so the
/// history stays browsable when the log tree is relocated. Single writer per
/// id is assumed; writers for different ids do not interfere.
pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    /// Create a store rooted at the log directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Load the ordered history for a cell id.
    ///
    /// A missing or unreadable file is an empty history, not an error.
    pub async fn load(&self, cell_id: &str) -> Vec<ExecutionRecord> {
        let path = self.history_file(cell_id);
        let Ok(raw) = fs::read(&path).await else {
            return Vec::new();
        };
        match serde_json::from_slice(&raw) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(path = %path.display(), "unreadable history file: {e}");
                Vec::new()
            }
        }
    }

    /// Append a record and persist the history atomically.
    ///
    /// # Errors
    /// Returns error if the history file cannot be written.
    pub async fn append(&self, cell_id: &str, record: ExecutionRecord) -> Result<(), StoreError> {
        let dir = self.root.join(cell_id);
        fs::create_dir_all(&dir).await?;

        if let Some(log_path) = record.log_path.as_deref() {
            link_log_file(&dir, log_path).await;
        }

        let mut records = self.load(cell_id).await;
        records.push(record);

        let path = self.history_file(cell_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&records)?).await?;
        fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), runs = records.len(), "history saved");
        Ok(())
    }

    /// Render the most recent prior runs as a display prefix.
    #[must_use]
    pub fn preamble(records: &[ExecutionRecord]) -> String {
        let skip = records.len().saturating_sub(MAX_HISTORY_SUMMARIES);
        let mut text = String::new();
        for record in &records[skip..] {
            text.push_str(&record.summary_text());
            text.push('\n');
        }
        text
    }

    fn history_file(&self, cell_id: &str) -> PathBuf {
        self.root.join(cell_id).join(format!("{cell_id}.json"))
    }
}

/// Drop a relative link `<cell dir>/<log name> -> ../<date>/<log name>`.
///
/// Best-effort: an existing link or an unsupported platform is not an error.
async fn link_log_file(cell_dir: &Path, log_path: &Path) {
    let (Some(name), Some(bucket)) = (
        log_path.file_name(),
        log_path.parent().and_then(Path::file_name),
    ) else {
        return;
    };
    let target = PathBuf::from("..").join(bucket).join(name);
    let link = cell_dir.join(name);

    #[cfg(unix)]
    if let Err(e) = fs::symlink(&target, &link).await {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            tracing::warn!(link = %link.display(), "could not link log file: {e}");
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (target, link);
    }
}
