//! Checkbox progress inspection for task documents.
//!
//! A task document tracks work as Markdown list checkboxes. Items under a
//! heading containing "optional" (any case), or whose line itself says
//! "optional", do not count toward completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use regex::Regex;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocProgress {
    pub total: usize,
    pub checked: usize,
    pub optional: usize,
}

impl DocProgress {
    pub fn remaining(&self) -> usize {
        self.total - self.checked
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} checked ({} remaining, {} optional excluded)",
            self.checked,
            self.total,
            self.remaining(),
            self.optional
        )
    }
}

struct CacheEntry {
    progress: DocProgress,
    read_at: SystemTime,
    mtime: SystemTime,
}

/// Parses checkbox documents, with a short-lived cache keyed on mtime so
/// the watchdog can probe every sweep without re-reading unchanged files.
pub struct ProgressInspector {
    ttl: Duration,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    unchecked: Regex,
    checked: Regex,
    heading: Regex,
}

impl Default for ProgressInspector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ProgressInspector {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
            unchecked: Regex::new(r"^\s*[-*+]\s*\[\s\]\s+\S").unwrap(),
            checked: Regex::new(r"^\s*[-*+]\s*\[[xX]\]\s+\S").unwrap(),
            heading: Regex::new(r"^(#{1,6})\s+").unwrap(),
        }
    }

    pub fn progress(&self, doc_path: &Path) -> Result<DocProgress> {
        let meta = std::fs::metadata(doc_path)?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(doc_path)
                && entry.mtime == mtime
                && entry.read_at.elapsed().map(|e| e < self.ttl).unwrap_or(false)
            {
                return Ok(entry.progress);
            }
        }

        let content = std::fs::read_to_string(doc_path)?;
        let progress = self.parse(&content);

        self.cache.lock().insert(
            doc_path.to_path_buf(),
            CacheEntry {
                progress,
                read_at: SystemTime::now(),
                mtime,
            },
        );

        Ok(progress)
    }

    pub fn invalidate(&self, doc_path: &Path) {
        self.cache.lock().remove(doc_path);
    }

    pub fn parse(&self, content: &str) -> DocProgress {
        let mut progress = DocProgress::default();
        let mut optional_depth: Option<usize> = None;

        for line in content.lines() {
            if let Some(caps) = self.heading.captures(line) {
                let level = caps[1].len();
                if is_optional_text(line) {
                    optional_depth = Some(level);
                } else if optional_depth.is_some_and(|d| level <= d) {
                    optional_depth = None;
                }
                continue;
            }

            let is_checked = self.checked.is_match(line);
            if !is_checked && !self.unchecked.is_match(line) {
                continue;
            }

            if optional_depth.is_some() || is_optional_text(line) {
                progress.optional += 1;
                continue;
            }

            progress.total += 1;
            if is_checked {
                progress.checked += 1;
            }
        }

        progress
    }
}

fn is_optional_text(line: &str) -> bool {
    line.to_lowercase().contains("optional")
}
