//! Per-session context-budget tracking.
//!
//! Readings come from best-effort output parsing, so the tracker is
//! defensive: within one session lifetime remaining context can only
//! shrink, and a reading larger than the last accepted one is discarded
//! as a misparse. The tracker only ever advises; restarts are driven by
//! the session manager.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::ContextConfig;

const MAX_SAMPLES: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct ContextSample {
    pub at: DateTime<Utc>,
    pub percent: u8,
}

#[derive(Debug)]
pub struct ContextTracker {
    last_percent: Option<u8>,
    samples: Vec<ContextSample>,
    started: Instant,
}

impl Default for ContextTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextTracker {
    pub fn new() -> Self {
        Self {
            last_percent: None,
            samples: Vec::new(),
            started: Instant::now(),
        }
    }

    #[cfg(test)]
    fn with_age(age: Duration) -> Self {
        Self {
            last_percent: None,
            samples: Vec::new(),
            started: Instant::now().checked_sub(age).unwrap_or_else(Instant::now),
        }
    }

    /// Records a reading. Returns the accepted value, or `None` when the
    /// reading would increase remaining context and is ignored.
    pub fn observe(&mut self, percent: u8) -> Option<u8> {
        let percent = percent.min(100);
        if let Some(last) = self.last_percent
            && percent > last
        {
            return None;
        }
        self.last_percent = Some(percent);
        if self.samples.len() >= MAX_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(ContextSample {
            at: Utc::now(),
            percent,
        });
        Some(percent)
    }

    pub fn last_percent(&self) -> Option<u8> {
        self.last_percent
    }

    pub fn samples(&self) -> &[ContextSample] {
        &self.samples
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// True iff remaining context is at or below the threshold and the
    /// session has run long enough that a spurious low reading at startup
    /// cannot flap it into a restart loop.
    pub fn should_restart(&self, config: &ContextConfig) -> bool {
        let Some(percent) = self.last_percent else {
            return false;
        };
        percent <= config.restart_threshold_percent
            && self.age() >= Duration::from_secs(config.min_run_secs)
    }
}
