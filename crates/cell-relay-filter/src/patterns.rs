//! Keyword pattern sets for output highlighting.

use std::path::Path;

use regex::Regex;

/// File holding the default keyword patterns, one regex per line.
pub const DEFAULT_PATTERN_FILE: &str = ".cell-relay-keywords";

/// Built-in failure/lifecycle vocabulary, written out to
/// [`DEFAULT_PATTERN_FILE`] when the file does not exist yet.
pub const DEFAULT_PATTERNS: &str = "\
ERROR|error|Error|Panic|panic|Invalid|invalid|Warning|warning|Bad|bad
FAIL|[Ff]ail(ed|ure)?
(Not|not) (Found|found)
(Device )?not ready
out of (Memory|memory)
[Tt]ime(d)? ?out
interrupt(ed)?|abort(ed)?|stop(ped)?
insecure|inaccessible|Forbidden|forbidden|Denied|denied
Unauthorised|unauthorised|Unauthorized|unauthorized
(No|no|Low|low) (.+ )?(Capacity|capacity|Space|space)
has (encountered|stopped)
is not";

/// Write the default pattern file into `dir` when absent.
///
/// # Errors
/// Returns error if the file cannot be written.
pub fn ensure_default_pattern_file(dir: &Path) -> std::io::Result<()> {
    let path = dir.join(DEFAULT_PATTERN_FILE);
    if !path.exists() {
        std::fs::write(&path, DEFAULT_PATTERNS)?;
    }
    Ok(())
}

/// Compile a newline-separated pattern list.
///
/// Malformed lines degrade to "no matching" for that pattern and are
/// reported as warning lines instead of failing the whole set.
pub(crate) fn compile_pattern_lines(text: &str, warnings: &mut Vec<String>) -> Vec<Regex> {
    let mut compiled = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Regex::new(line) {
            Ok(re) => compiled.push(re),
            Err(e) => {
                tracing::warn!(pattern = line, "invalid keyword pattern: {e}");
                warnings.push(format!("error : invalid keyword pattern {line:?}: {e}"));
            }
        }
    }
    compiled
}

/// Load keyword patterns from a configured source.
///
/// `file:default` reads [`DEFAULT_PATTERN_FILE`] in `dir`, `file:<name>`
/// reads the named file, anything else is compiled as one inline regex.
/// A missing file degrades to an empty set with a warning line.
pub(crate) fn load_source(source: &str, dir: &Path, warnings: &mut Vec<String>) -> Vec<Regex> {
    let source = source.trim();
    if source.is_empty() {
        return Vec::new();
    }

    if let Some(name) = source.strip_prefix("file:") {
        let name = name.trim();
        let file_name = if name == "default" {
            DEFAULT_PATTERN_FILE
        } else {
            name
        };
        let path = dir.join(file_name);
        match std::fs::read_to_string(&path) {
            Ok(text) => compile_pattern_lines(&text, warnings),
            Err(e) => {
                tracing::warn!(path = %path.display(), "keyword pattern file unreadable: {e}");
                warnings.push(format!("error : not found {}", path.display()));
                Vec::new()
            }
        }
    } else {
        compile_pattern_lines(source, warnings)
    }
}
