//! Coordinator settings.
//!
//! Loaded from a YAML file; every field is optional and falls back to the
//! defaults below, so an empty file (or no file at all) is a valid setup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::format::DEFAULT_PORT;


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid cluster settings: {0}")]
    Invalid(#[from] serde_yaml::Error),
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// TCP port the coordinator listens on. 0 picks an ephemeral port.
    pub port: u16,
    pub bind_address: String,
    /// Name workers use to reach the coordinator. Defaults to this host's name.
    pub coordinator_host: Option<String>,
    pub ssh_program: String,
    pub ssh_args: Vec<String>,
    /// Tokens placed after the host name, e.g. `["bash", "-lc"]`.
    pub remote_shell: Vec<String>,
    pub worker_binary: String,
    pub handshake_timeout_ms: u64,
    /// Deadline for a single request's response.
    pub request_timeout_ms: u64,
    /// How many individual errors `error_string()` lists before summarizing.
    pub max_reported_errors: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterSettings {
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".into(),
            coordinator_host: None,
            ssh_program: "ssh".into(),
            ssh_args: vec!["-o".into(), "BatchMode=yes".into()],
            remote_shell: Vec::new(),
            worker_binary: "aoremoteclient".into(),
            handshake_timeout_ms: 30_000,
            request_timeout_ms: 600_000,
            max_reported_errors: 30,
        }
    }
}

impl ClusterSettings {
    pub fn load(path: &Path) -> Result<ClusterSettings, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<ClusterSettings, ConfigError> {
        if content.trim().is_empty() {
            return Ok(ClusterSettings::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn coordinator_host(&self) -> String {
        self.coordinator_host.clone().unwrap_or_else(local_hostname)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}


/// This machine's host name, or `localhost` if it cannot be determined.
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".into();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".into(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = ClusterSettings::parse("").unwrap();
        assert_eq!(cfg, ClusterSettings::default());
        assert_eq!(cfg.port, 1892);
        assert_eq!(cfg.max_reported_errors, 30);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let yaml = r#"
port: 2000
coordinator_host: head.cluster
remote_shell: ["bash", "-lc"]
request_timeout_ms: 5000
"#;
        let cfg = ClusterSettings::parse(yaml).unwrap();
        assert_eq!(cfg.port, 2000);
        assert_eq!(cfg.coordinator_host(), "head.cluster");
        assert_eq!(cfg.remote_shell, vec!["bash", "-lc"]);
        assert_eq!(cfg.request_timeout_ms, 5000);
        assert_eq!(cfg.worker_binary, "aoremoteclient");
        assert_eq!(cfg.ssh_program, "ssh");
    }

    #[test]
    fn invalid_yaml_is_rejected() {
        let result = ClusterSettings::parse("port: [not a number]\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_missing_file() {
        let result = ClusterSettings::load(Path::new("/nonexistent/cluster.yaml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn load_from_disk() {
        let path = std::env::temp_dir().join(format!("cluster-{}.yaml", std::process::id()));
        std::fs::write(&path, "max_reported_errors: 5\n").unwrap();
        let cfg = ClusterSettings::load(&path).unwrap();
        assert_eq!(cfg.max_reported_errors, 5);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn local_hostname_is_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}
