//! Per-request execution metadata.

use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S(%Z)";

/// Terminal state of one recorded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Running,
    Ok,
    Error,
    Aborted,
}

/// Identifying and timing metadata for one request.
///
/// Created at dispatch, completed at finalization, immutable once appended
/// to the history of its cell id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default)]
    pub output_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_hits: Option<usize>,
    pub status: RecordStatus,
}

impl ExecutionRecord {
    /// Start a record for the given code, stamped with the current local time.
    #[must_use]
    pub fn new(code: impl Into<String>, cell_id: Option<String>) -> Self {
        Self {
            code: code.into(),
            cell_id,
            log_path: None,
            start: Local::now().format(TIME_FORMAT).to_string(),
            end: None,
            output_bytes: 0,
            keyword_hits: None,
            status: RecordStatus::Running,
        }
    }

    /// Stamp the end time and close the record.
    pub fn finished(&mut self, keyword_hits: usize, status: RecordStatus) {
        self.end = Some(Local::now().format(TIME_FORMAT).to_string());
        self.keyword_hits = Some(keyword_hits);
        self.status = status;
    }

    /// Leading lines shown before live output: log path and start time.
    #[must_use]
    pub fn header_text(&self) -> String {
        let mut text = String::new();
        if let Some(path) = &self.log_path {
            text.push_str(&format!("path: {}\n", path.display()));
        }
        text.push_str(&format!("start time: {}\n", self.start));
        text
    }

    /// Trailing lines shown after output: end time, size, and match count.
    #[must_use]
    pub fn footer_text(&self) -> String {
        let mut text = String::new();
        if let Some(end) = &self.end {
            text.push_str(&format!("end time: {end}\n"));
        }
        text.push_str(&format!("output size: {} bytes\n", self.output_bytes));
        if let Some(hits) = self.keyword_hits {
            text.push_str(&format!("{hits} lines matched keywords or errors\n"));
        }
        text
    }

    /// Full one-run summary, used for prior-run prefixes.
    #[must_use]
    pub fn summary_text(&self) -> String {
        let mut text = self.header_text();
        text.push_str(&self.footer_text());
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lifecycle() {
        let mut record = ExecutionRecord::new("print(1)", Some("cell-a".to_string()));
        assert_eq!(record.status, RecordStatus::Running);
        assert!(record.end.is_none());

        record.log_path = Some(PathBuf::from("/tmp/x.log"));
        record.output_bytes = 42;
        record.finished(3, RecordStatus::Ok);

        assert_eq!(record.status, RecordStatus::Ok);
        assert_eq!(record.keyword_hits, Some(3));
        let summary = record.summary_text();
        assert!(summary.contains("path: /tmp/x.log"));
        assert!(summary.starts_with("path: "));
        assert!(summary.contains("start time: "));
        assert!(summary.contains("end time: "));
        assert!(summary.contains("output size: 42 bytes"));
        assert!(summary.contains("3 lines matched keywords or errors"));
    }

    #[test]
    fn test_record_roundtrip() {
        let mut record = ExecutionRecord::new("ls", None);
        record.finished(0, RecordStatus::Error);
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.code, "ls");
        assert_eq!(parsed.status, RecordStatus::Error);
        assert_eq!(parsed.start, record.start);
    }
}
