//! Worker process supervision.
//!
//! `WorkerLauncher` starts the worker for one host and blocks until it
//! exits. `SshLauncher` does this with `ssh`; tests substitute in-process
//! launchers. `RemoteProcess` runs a launcher on a dedicated thread and
//! reports the exit to the orchestrator as `CommanderEvent::ProcessFinished`.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::event::{CommanderEvent, EventSender};
use crate::config::ClusterSettings;
use crate::error::ClusterError;


// ---------------------------------------------------------------------------
// ExitReport
// ---------------------------------------------------------------------------

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn success() -> ExitReport {
        ExitReport { code: Some(0), signal: None }
    }

    pub fn with_code(code: i32) -> ExitReport {
        ExitReport { code: Some(code), signal: None }
    }

    pub fn from_status(status: ExitStatus) -> ExitReport {
        ExitReport {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Non-zero exit or abnormal termination.
    pub fn failed(&self) -> bool {
        self.code != Some(0)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}


// ---------------------------------------------------------------------------
// Launchers
// ---------------------------------------------------------------------------

/// Where workers should connect back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorAddress {
    pub host: String,
    pub port: u16,
}

pub trait WorkerLauncher: Send + Sync {
    /// Run the worker for `hostname` to completion. `Err` means it could not
    /// be started at all.
    fn launch(&self, hostname: &str, coordinator: &CoordinatorAddress) -> Result<ExitReport, String>;
}

/// Starts `aoremoteclient connect` on the target host through ssh.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    pub ssh_program: String,
    pub ssh_args: Vec<String>,
    pub remote_shell: Vec<String>,
    pub worker_binary: String,
}

impl SshLauncher {
    pub fn from_settings(settings: &ClusterSettings) -> SshLauncher {
        SshLauncher {
            ssh_program: settings.ssh_program.clone(),
            ssh_args: settings.ssh_args.clone(),
            remote_shell: settings.remote_shell.clone(),
            worker_binary: settings.worker_binary.clone(),
        }
    }

    /// Full argument vector, program first.
    pub fn build_command(&self, hostname: &str, coordinator: &CoordinatorAddress) -> Vec<String> {
        let worker = format!(
            "{} connect {} --port {} --hostname {}",
            self.worker_binary, coordinator.host, coordinator.port, hostname
        );
        let mut argv = vec![self.ssh_program.clone()];
        argv.extend(self.ssh_args.iter().cloned());
        argv.push(hostname.to_string());
        if self.remote_shell.is_empty() {
            argv.push(worker);
        } else {
            argv.extend(self.remote_shell.iter().cloned());
            argv.push(format!("'{}'", worker));
        }
        argv
    }
}

impl WorkerLauncher for SshLauncher {
    fn launch(&self, hostname: &str, coordinator: &CoordinatorAddress) -> Result<ExitReport, String> {
        let argv = self.build_command(hostname, coordinator);
        log::debug!("starting worker: {}", argv.join(" "));
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .status()
            .map_err(|e| format!("cannot run {}: {}", argv[0], e))?;
        Ok(ExitReport::from_status(status))
    }
}


// ---------------------------------------------------------------------------
// RemoteProcess
// ---------------------------------------------------------------------------

/// Supervises the worker of one host. One `start` per instance; dropping it
/// waits for the worker to exit.
pub struct RemoteProcess {
    hostname: String,
    coordinator: CoordinatorAddress,
    launcher: Arc<dyn WorkerLauncher>,
    thread: Option<JoinHandle<()>>,
    started: bool,
}

impl RemoteProcess {
    pub fn new(hostname: &str, coordinator: CoordinatorAddress, launcher: Arc<dyn WorkerLauncher>) -> RemoteProcess {
        RemoteProcess {
            hostname: hostname.to_string(),
            coordinator,
            launcher,
            thread: None,
            started: false,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn start(&mut self, events: EventSender) -> Result<(), ClusterError> {
        if self.started {
            return Err(ClusterError::AlreadyStarted(self.hostname.clone()));
        }
        self.started = true;

        let hostname = self.hostname.clone();
        let coordinator = self.coordinator.clone();
        let launcher = Arc::clone(&self.launcher);
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", hostname))
            .spawn(move || {
                log::info!("starting worker on {}", hostname);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| launcher.launch(&hostname, &coordinator)))
                    .unwrap_or_else(|_| Err("worker launcher panicked".to_string()));
                match &outcome {
                    Ok(report) if !report.failed() => log::info!("worker on {} finished", hostname),
                    Ok(report) => log::warn!("worker on {} failed with {}", hostname, report),
                    Err(e) => log::warn!("worker on {} could not start: {}", hostname, e),
                }
                let _ = events.send(CommanderEvent::ProcessFinished { hostname, outcome });
            });
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => Err(ClusterError::Spawn(e)),
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        self.join();
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
