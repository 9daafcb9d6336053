//! Redaction and keyword emphasis over output text.

use regex::Regex;

/// Character used to overwrite redacted spans.
pub const MASK_CHAR: char = '*';

/// ANSI marker opening a highlighted span.
pub const HIGHLIGHT_START: &str = "\x1b[0;31m";

/// ANSI marker closing a highlighted span.
pub const HIGHLIGHT_END: &str = "\x1b[0m";

/// Replace every match of `pattern` with a run of [`MASK_CHAR`].
///
/// The replacement repeats per matched **character**, so line lengths and
/// multibyte layout are preserved. Without a pattern the text passes through
/// unchanged.
#[must_use]
pub fn mask(text: &str, pattern: Option<&Regex>) -> String {
    let Some(pattern) = pattern else {
        return text.to_string();
    };
    pattern
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let matched = caps.get(0).map_or("", |m| m.as_str());
            MASK_CHAR.to_string().repeat(matched.chars().count())
        })
        .into_owned()
}

/// Wrap every pattern match in `text` in highlight markers.
///
/// At each position the left-most match across all patterns wins; on ties
/// the longest match is taken. Returns `None` when no pattern matches
/// anywhere, distinguishing "nothing to highlight" from a highlight that
/// happens to render identically.
#[must_use]
pub fn highlight(text: &str, patterns: &[Regex]) -> Option<String> {
    if patterns.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut matched = false;

    loop {
        let best = patterns
            .iter()
            .filter_map(|p| p.find(rest))
            .min_by(|a, b| {
                a.start()
                    .cmp(&b.start())
                    .then(b.end().cmp(&a.end()))
            });

        let Some(m) = best else {
            out.push_str(rest);
            break;
        };

        matched = true;
        out.push_str(&rest[..m.start()]);
        out.push_str(HIGHLIGHT_START);
        out.push_str(m.as_str());
        out.push_str(HIGHLIGHT_END);

        if m.end() == m.start() {
            // Zero-width match: step over one character to guarantee progress.
            let step = rest[m.end()..]
                .chars()
                .next()
                .map_or(0, char::len_utf8);
            if step == 0 {
                break;
            }
            out.push_str(&rest[m.end()..m.end() + step]);
            rest = &rest[m.end() + step..];
        } else {
            rest = &rest[m.end()..];
        }
    }

    matched.then_some(out)
}
