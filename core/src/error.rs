//! Orchestrator-level errors and the per-run error log.

use thiserror::Error;

use crate::config::ConfigError;
use crate::observation::ObservationError;
use crate::payload::MergeError;
use crate::remote::timerange::GridError;


#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Observation(#[from] ObservationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("listener failure: {0}")]
    Listener(#[source] std::io::Error),

    #[error("grid assembly failed: {0}")]
    Grid(#[from] GridError),

    #[error("aggregation failed: {0}")]
    Aggregation(#[from] MergeError),

    #[error("row tasks need an initialized timerange")]
    TimerangeNotInitialized,

    #[error("event channel closed while work was outstanding")]
    ChannelClosed,

    #[error("worker process for {0} already started")]
    AlreadyStarted(String),

    #[error("cannot start thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Non-fatal node failures collected during a run.
    #[error("{count} error(s) occurred on remote nodes:\n{summary}")]
    Remote { count: usize, summary: String },
}


// ---------------------------------------------------------------------------
// ErrorLog
// ---------------------------------------------------------------------------

/// Append-only list of recoverable node errors for one `run`.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Vec<String>,
}

impl ErrorLog {
    pub fn new() -> ErrorLog {
        ErrorLog::default()
    }

    pub fn push(&mut self, message: String) {
        log::warn!("{}", message);
        self.entries.push(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// One line per error, at most `max` of them, then a remainder count.
    pub fn summary(&self, max: usize) -> String {
        let mut lines: Vec<String> = self.entries.iter().take(max).cloned().collect();
        if self.entries.len() > max {
            lines.push(format!("... and {} more", self.entries.len() - max));
        }
        lines.join("\n")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_all_when_under_limit() {
        let mut log = ErrorLog::new();
        log.push("a failed".into());
        log.push("b failed".into());
        assert_eq!(log.summary(30), "a failed\nb failed");
    }

    #[test]
    fn summary_caps_and_counts_remainder() {
        let mut log = ErrorLog::new();
        for i in 0..35 {
            log.push(format!("node{} failed", i));
        }
        let summary = log.summary(30);
        assert_eq!(summary.lines().count(), 31);
        assert!(summary.starts_with("node0 failed"));
        assert!(summary.ends_with("... and 5 more"));
    }

    #[test]
    fn clear_empties_log() {
        let mut log = ErrorLog::new();
        log.push("x".into());
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.summary(30), "");
    }

    #[test]
    fn remote_error_message() {
        let err = ClusterError::Remote { count: 1, summary: "n2: could not open table".into() };
        assert!(err.to_string().contains("1 error(s)"));
    }
}
