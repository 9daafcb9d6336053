//! Durable persistence for the cell-relay proxy.
//!
//! Provides:
//! - `OutputLog` - One buffered physical log file per request
//! - `HistoryStore` - Append-only per-cell execution history
//! - `ResultCache` - Ordinal-numbered rich-output artifacts for replay
//! - `LogForwarder` - Best-effort external record forwarding

pub mod artifacts;
pub mod forward;
pub mod history;
pub mod logfile;

use thiserror::Error;

pub use artifacts::ResultCache;
pub use forward::LogForwarder;
pub use history::{HistoryStore, MAX_HISTORY_SUMMARIES};
pub use logfile::OutputLog;

/// Persistence error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Forwarding failed: {0}")]
    Forward(String),
}
