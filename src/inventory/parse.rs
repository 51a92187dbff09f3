//! Byte-count extraction from the raw text a size backend prints.
//!
//! Measurement tools disagree on shape: a bare integer, `"<bytes>  gs://name"`,
//! a labeled `Total: ...` line, or a sentence with the number buried inside.
//! URL tokens (`gs://logs-2024`) are blanked first; resource names never carry
//! the byte count. Then, first match wins:
//! 1. The last line labeled as a total (`Total: ...`, `total = ...`, or
//!    `300  total`, any case): its last integer.
//! 2. The first non-empty line, if it starts with an integer: that integer.
//! 3. The last integer anywhere in the text.
//!
//! Decimals (`1.5`) are never byte counts and are skipped, as are integers that
//! overflow `u64`. No candidate at all means the output is unparseable.

use std::sync::LazyLock;

use regex::Regex;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:\.\d+)?").unwrap_or_else(|e| panic!("number regex: {e}"))
});

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\S+://\S*").unwrap_or_else(|e| panic!("url regex: {e}")));

static TOTAL_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*total\b|\btotal\s*[:=]|\btotal\s*$")
        .unwrap_or_else(|e| panic!("total label regex: {e}"))
});

/// Extract a byte count from probe output. `None` when nothing usable is found.
#[must_use]
pub fn parse_size(raw: &str) -> Option<u64> {
    let text = URL.replace_all(raw, " ");

    if let Some(line) = text.lines().rev().find(|line| TOTAL_LABEL.is_match(line))
        && let Some(value) = last_integer(line)
    {
        return Some(value);
    }

    if let Some(first) = text.lines().map(str::trim).find(|line| !line.is_empty())
        && let Some(value) = leading_integer(first)
    {
        return Some(value);
    }

    last_integer(&text)
}

fn integers(text: &str) -> impl Iterator<Item = u64> + '_ {
    NUMBER
        .find_iter(text)
        .filter(|m| !m.as_str().contains('.'))
        .filter_map(|m| m.as_str().parse::<u64>().ok())
}

fn last_integer(text: &str) -> Option<u64> {
    integers(text).last()
}

fn leading_integer(line: &str) -> Option<u64> {
    let digits: &str = &line[..line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(line.len())];
    if digits.is_empty() {
        return None;
    }
    // "12.5 GiB" is not a byte count.
    if line[digits.len()..].starts_with('.') {
        return None;
    }
    digits.parse().ok()
}
