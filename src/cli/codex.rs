//! Output recognition for the Codex CLI.

use std::sync::OnceLock;

use regex::Regex;

/// Codex prints "NN% context left" in its footer.
pub(super) fn parse_context_remaining(chunk: &str) -> Option<u8> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d{1,3})%\s+context left").unwrap());
    re.captures_iter(chunk)
        .last()
        .and_then(|caps| caps[1].parse::<u8>().ok())
        .filter(|pct| *pct <= 100)
}

pub(super) fn is_idle(tail: &str) -> bool {
    tail.contains("⏎ send") || tail.contains("Ctrl+C to quit")
}
