//! Observation descriptor.
//!
//! A clustered observation is an ordered list of shards, each stored on one
//! host. It is loaded from a reference file (`.ref`), one shard per line:
//!
//! ```text
//! # local path                         host
//! /data/L123456/L123456_SB000_uv.MS    node001
//! /data/L123456/L123456_SB001_uv.MS    node002
//! ```
//!
//! Any other path is taken to be a single shard on the local host.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;


#[derive(Debug, Error)]
pub enum ObservationError {
    #[error("cannot read observation descriptor {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line} of observation descriptor: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("observation descriptor lists no shards")]
    Empty,
}


// ---------------------------------------------------------------------------
// ClusterItem
// ---------------------------------------------------------------------------

/// One shard of the observation and the host holding it.
///
/// `index` is the shard's position in the descriptor and is used for
/// deterministic placement of per-shard results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterItem {
    pub index: usize,
    pub local_path: String,
    pub hostname: String,
}

impl PartialOrd for ClusterItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusterItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}


// ---------------------------------------------------------------------------
// ClusteredObservation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteredObservation {
    items: Vec<ClusterItem>,
}

impl ClusteredObservation {
    pub fn new() -> ClusteredObservation {
        ClusteredObservation { items: Vec::new() }
    }

    /// Append a shard; its index is its position.
    pub fn add_item(&mut self, local_path: &str, hostname: &str) {
        let index = self.items.len();
        self.items.push(ClusterItem {
            index,
            local_path: local_path.to_string(),
            hostname: hostname.to_string(),
        });
    }

    pub fn items(&self) -> &[ClusterItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Distinct host names, in order of first appearance.
    pub fn hostnames(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for item in &self.items {
            if !hosts.iter().any(|h| h == &item.hostname) {
                hosts.push(item.hostname.clone());
            }
        }
        hosts
    }

    /// Load a descriptor. `.ref` files are parsed as shard lists; anything
    /// else becomes a single shard on `localhost`.
    pub fn load(path: &Path) -> Result<ClusteredObservation, ObservationError> {
        let is_ref = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("ref"))
            .unwrap_or(false);
        if !is_ref {
            let mut obs = ClusteredObservation::new();
            obs.add_item(&path.to_string_lossy(), "localhost");
            return Ok(obs);
        }
        let content = std::fs::read_to_string(path).map_err(|source| ObservationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_ref(&content)
    }

    /// Parse the contents of a `.ref` file.
    pub fn parse_ref(content: &str) -> Result<ClusteredObservation, ObservationError> {
        let mut obs = ClusteredObservation::new();
        for (n, raw_line) in content.lines().enumerate() {
            let line = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let mut fields = line.split_whitespace();
            let Some(local_path) = fields.next() else {
                continue;
            };
            let hostname = fields.next().ok_or_else(|| ObservationError::Malformed {
                line: n + 1,
                reason: format!("shard '{}' has no host name", local_path),
            })?;
            if let Some(extra) = fields.next() {
                return Err(ObservationError::Malformed {
                    line: n + 1,
                    reason: format!("unexpected field '{}'", extra),
                });
            }
            obs.add_item(local_path, hostname);
        }
        if obs.is_empty() {
            return Err(ObservationError::Empty);
        }
        Ok(obs)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
