//! Per-request configuration resolution.

use std::{collections::HashMap, path::Path, sync::LazyLock};

use regex::Regex;

use crate::patterns;

/// Project-local configuration file, `key=value` lines.
pub const CONFIG_FILE_NAME: &str = ".cell-relay";

pub const SUMMARIZE_KEY: &str = "summarize";
pub const FORCE_KEY: &str = "summarize_force";
pub const MASKING_KEY: &str = "masking";
pub const MASKING_PATTERN_KEY: &str = "masking_pattern";
pub const KEYWORDS_KEY: &str = "keywords";
pub const HISTORY_ID_KEY: &str = "history_id";
pub const FORWARD_KEY: &str = "forward";

static CONFIG_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^(\S+)=(".*?"|\S+)"#).unwrap());

/// Line-count thresholds driving summarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummarizeLimits {
    /// Cumulative line count at which live truncation engages.
    pub start_lines: usize,
    /// Lines kept from the head of the whole stream.
    pub header_lines: usize,
    /// Lines of the current fragment shown in a live summary.
    pub exec_lines: usize,
    /// Lines kept from the tail for the final summary.
    pub footer_lines: usize,
}

impl Default for SummarizeLimits {
    fn default() -> Self {
        Self {
            start_lines: 50,
            header_lines: 20,
            exec_lines: 1,
            footer_lines: 20,
        }
    }
}

impl SummarizeLimits {
    /// Apply a `start:header:exec:footer` spec; empty fields keep defaults.
    ///
    /// After parsing, `start_lines` is raised to at least
    /// `header_lines + footer_lines + 1` so a summary is never longer than
    /// the output it replaces.
    pub fn apply_spec(&mut self, spec: &str, warnings: &mut Vec<String>) {
        let fields: Vec<&str> = spec.trim().split(':').collect();
        if fields.len() != 4 {
            warnings.push(format!("error : malformed summarize thresholds {spec:?}"));
            self.clamp_start();
            return;
        }
        let slots = [
            &mut self.start_lines,
            &mut self.header_lines,
            &mut self.exec_lines,
            &mut self.footer_lines,
        ];
        for (slot, field) in slots.into_iter().zip(&fields) {
            if field.is_empty() {
                continue;
            }
            match field.parse::<usize>() {
                Ok(value) => *slot = value,
                Err(_) => {
                    warnings.push(format!("error : malformed summarize threshold {field:?}"));
                }
            }
        }
        self.clamp_start();
    }

    fn clamp_start(&mut self) {
        self.start_lines = self
            .start_lines
            .max(self.header_lines + self.footer_lines + 1);
    }
}

/// External log forwarding destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    pub tag: String,
}

impl ForwardTarget {
    fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.trim().splitn(3, ':');
        let host = parts.next()?.to_string();
        let port = parts.next()?.parse().ok()?;
        let tag = parts.next()?.to_string();
        if host.is_empty() || tag.is_empty() {
            return None;
        }
        Some(Self { host, port, tag })
    }
}

/// Immutable configuration for one request.
///
/// Resolved once at dispatch; precedence is request overrides, then the
/// project config file, then built-in defaults. Resolution never fails:
/// malformed items degrade to disabled and leave a warning line behind.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub limits: SummarizeLimits,
    pub force_summarize: Option<bool>,
    pub masking: Option<Regex>,
    pub keywords: Vec<Regex>,
    pub cell_id: Option<String>,
    pub forward: Option<ForwardTarget>,
    /// Warning lines produced during resolution, surfaced in the keyword
    /// buffer of the request.
    pub warnings: Vec<String>,
}

impl ConfigSnapshot {
    /// Resolve the configuration for one request.
    #[must_use]
    pub fn resolve(base_dir: &Path, overrides: &HashMap<String, String>) -> Self {
        let mut warnings = Vec::new();
        let mut config = read_config_file(&base_dir.join(CONFIG_FILE_NAME), &mut warnings);
        for (key, value) in overrides {
            config.insert(key.clone(), value.clone());
        }

        let mut limits = SummarizeLimits::default();
        if let Some(spec) = config.get(SUMMARIZE_KEY) {
            limits.apply_spec(spec, &mut warnings);
        } else {
            limits.clamp_start();
        }

        let force_summarize = config.get(FORCE_KEY).and_then(|v| {
            match v.trim().to_ascii_lowercase().as_str() {
                "on" => Some(true),
                "off" => Some(false),
                other => {
                    warnings.push(format!("error : unexpected {FORCE_KEY} value {other:?}"));
                    None
                }
            }
        });

        let masking = resolve_masking(&config, &mut warnings);

        let keyword_source = config
            .get(KEYWORDS_KEY)
            .map_or("file:default", String::as_str);
        let keywords = patterns::load_source(keyword_source, base_dir, &mut warnings);

        let cell_id = config.get(HISTORY_ID_KEY).cloned().filter(|v| !v.is_empty());

        let forward = config.get(FORWARD_KEY).and_then(|spec| {
            let target = ForwardTarget::parse(spec);
            if target.is_none() {
                warnings.push(format!("error : malformed forward target {spec:?}"));
            }
            target
        });

        Self {
            limits,
            force_summarize,
            masking,
            keywords,
            cell_id,
            forward,
            warnings,
        }
    }
}

fn resolve_masking(
    config: &HashMap<String, String>,
    warnings: &mut Vec<String>,
) -> Option<Regex> {
    let enabled = match config.get(MASKING_KEY).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if v == "off" => false,
        Some(v) if v == "on" => true,
        Some(other) => {
            warnings.push(format!("error : unexpected {MASKING_KEY} value {other:?}"));
            false
        }
        // Providing a pattern alone is enough to switch masking on.
        None => config.contains_key(MASKING_PATTERN_KEY),
    };
    if !enabled {
        return None;
    }
    let Some(pattern) = config.get(MASKING_PATTERN_KEY) else {
        warnings.push(format!(
            "error : {MASKING_KEY} is on but {MASKING_PATTERN_KEY} is unset"
        ));
        return None;
    };
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern, "invalid masking pattern: {e}");
            warnings.push(format!("error : invalid masking pattern {pattern:?}: {e}"));
            None
        }
    }
}

fn read_config_file(path: &Path, warnings: &mut Vec<String>) -> HashMap<String, String> {
    let mut config = HashMap::new();
    let Ok(text) = std::fs::read_to_string(path) else {
        return config;
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = CONFIG_LINE.captures(line) {
            let value = caps[2].trim_matches('"').to_string();
            config.insert(caps[1].to_string(), value);
        } else {
            tracing::warn!(line, path = %path.display(), "unexpected config line");
            warnings.push(format!("error : unexpected config line {line:?}"));
        }
    }
    config
}

/// Strip the leading force marker (`!!`) from request code.
///
/// Returns the remaining code when the marker is present.
#[must_use]
pub fn strip_force_marker(code: &str) -> Option<&str> {
    let trimmed = code.trim_start();
    trimmed.strip_prefix("!!")
}
