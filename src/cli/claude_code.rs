//! Output recognition for Claude Code.

use std::sync::OnceLock;

use regex::Regex;

/// Claude Code surfaces remaining context in its status line, e.g.
/// "Context left until auto-compact: 34%".
pub(super) fn parse_context_remaining(chunk: &str) -> Option<u8> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"[Cc]ontext left(?: until auto-compact)?:\s*(\d{1,3})%").unwrap()
    });
    re.captures_iter(chunk)
        .last()
        .and_then(|caps| caps[1].parse::<u8>().ok())
        .filter(|pct| *pct <= 100)
}

/// The idle footer Claude Code prints while waiting at its input box.
pub(super) fn is_idle(tail: &str) -> bool {
    tail.contains("? for shortcuts") || tail.contains("Bypassing Permissions")
}
