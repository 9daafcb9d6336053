//! Live truncation of long output streams.

use std::collections::{HashSet, VecDeque};

use cell_relay_core::StreamName;
use cell_relay_filter::{highlight, SummarizeLimits, HIGHLIGHT_END, HIGHLIGHT_START};
use regex::Regex;

/// What to do with one observed output fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentAction {
    /// Emit the fragment unchanged.
    Forward,
    /// Replace the fragment with this synthetic excerpt block.
    Summarize(String),
}

/// Per-request summarization state.
///
/// Consumes the ordered output fragments of one request and maintains the
/// bounded header/tail windows and the keyword buffer. Fragments pass
/// through until the cumulative line count reaches `start_lines`; every
/// fragment after that is replaced by an excerpt block. The final
/// consolidated block is produced once, at finalization, by the router.
pub struct StreamSummarizer {
    limits: SummarizeLimits,
    keywords: Vec<Regex>,
    header: Vec<String>,
    tail: VecDeque<String>,
    tail_cap: usize,
    keyword_lines: Vec<String>,
    keyword_seen: HashSet<String>,
    keyword_total: usize,
    emitted: usize,
    truncated: bool,
}

impl StreamSummarizer {
    /// Create state for one request.
    #[must_use]
    pub fn new(limits: SummarizeLimits, keywords: Vec<Regex>) -> Self {
        let tail_cap = limits.footer_lines.max(limits.start_lines);
        Self {
            limits,
            keywords,
            header: Vec::with_capacity(limits.header_lines),
            tail: VecDeque::with_capacity(tail_cap),
            tail_cap,
            keyword_lines: Vec::new(),
            keyword_seen: HashSet::new(),
            keyword_total: 0,
            emitted: 0,
            truncated: false,
        }
    }

    /// Seed a warning line (config or pattern failure) into the keyword
    /// buffer so it surfaces in the summary.
    pub fn push_warning(&mut self, line: impl Into<String>) {
        let line = line.into();
        let marked = line.clone();
        self.buffer_keyword_line(&line, marked);
    }

    /// Observe one output fragment and decide how to present it.
    pub fn observe(&mut self, name: StreamName, text: &str) -> FragmentAction {
        let lines: Vec<&str> = text.lines().collect();

        for line in &lines {
            if name == StreamName::Stderr {
                self.buffer_keyword_line(line, format!("{HIGHLIGHT_START}{line}{HIGHLIGHT_END}"));
            } else if let Some(marked) = highlight(line, &self.keywords) {
                self.buffer_keyword_line(line, marked);
            }

            if self.header.len() < self.limits.header_lines {
                self.header.push((*line).to_string());
            }
            if self.tail.len() == self.tail_cap {
                self.tail.pop_front();
            }
            self.tail.push_back((*line).to_string());
        }

        if self.emitted < self.limits.start_lines {
            self.emitted += lines.len();
            FragmentAction::Forward
        } else {
            self.truncated = true;
            FragmentAction::Summarize(self.excerpt_block(&lines))
        }
    }

    /// Whether live truncation has engaged for this request.
    #[must_use]
    pub const fn truncated(&self) -> bool {
        self.truncated
    }

    /// Total matched lines (deduplicated, uncapped count).
    #[must_use]
    pub const fn keyword_hits(&self) -> usize {
        self.keyword_total
    }

    /// Consolidated block for the finalization message.
    ///
    /// When truncation never engaged this is the raw tail buffer; otherwise
    /// the structured header/keyword/tail excerpt.
    #[must_use]
    pub fn final_block(&self) -> String {
        if !self.truncated {
            let mut text = self
                .tail
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            return text;
        }

        let skip = self.tail.len().saturating_sub(self.limits.footer_lines);
        let closing: Vec<&str> = self.tail.iter().skip(skip).map(String::as_str).collect();
        self.compose(&closing)
    }

    fn excerpt_block(&self, fragment: &[&str]) -> String {
        let skip = fragment.len().saturating_sub(self.limits.exec_lines);
        self.compose(&fragment[skip..])
    }

    fn compose(&self, closing: &[&str]) -> String {
        let mut text = String::new();
        text.push_str(&self.header.join("\n"));
        text.push('\n');
        if !self.keyword_lines.is_empty() {
            text.push_str("...\n");
            text.push_str(&self.keyword_lines.join("\n"));
            text.push('\n');
            let overflow = self.keyword_total - self.keyword_lines.len();
            if overflow > 0 {
                text.push_str(&format!("... and {overflow} more matched lines\n"));
            }
        }
        text.push_str("...\n");
        text.push_str(&closing.join("\n"));
        text
    }

    fn buffer_keyword_line(&mut self, raw: &str, marked: String) {
        if !self.keyword_seen.insert(raw.to_string()) {
            return;
        }
        self.keyword_total += 1;
        if self.keyword_lines.len() < self.limits.header_lines * 2 {
            self.keyword_lines.push(marked);
        }
    }
}
