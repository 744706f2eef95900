//! Host Control - restart or stop the host process after plugin changes.
//!
//! Two mechanisms, mirroring how a supervised server is usually recycled:
//! - graceful restart: `SIGUSR1` to the supervisor (unix only)
//! - stop-all: ask the running HTTP server to shut down so its supervisor
//!   brings up a fresh process

use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Delay before a stop-all takes effect, so in-flight responses can finish
const STOP_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Graceful restart unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: i32, message: String },
}

/// How the host is restarted
#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Send SIGUSR1 to the supervisor process
    Signal,
    /// Shut the HTTP server down and let the supervisor restart it
    #[default]
    Shutdown,
    /// Do nothing (log only)
    None,
}

impl fmt::Display for RestartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartMode::Signal => write!(f, "signal"),
            RestartMode::Shutdown => write!(f, "shutdown"),
            RestartMode::None => write!(f, "none"),
        }
    }
}

/// Restart/reload operations on the host process
pub trait HostControl: Send + Sync {
    /// Ask the host to reload its workers without dropping the process
    fn graceful_restart(&self) -> Result<(), HostError>;

    /// Stop the host entirely
    fn stop_all(&self);

    /// Graceful restart, falling back to stop-all. Returns whether the
    /// graceful path was taken.
    fn restart(&self) -> bool {
        match self.graceful_restart() {
            Ok(()) => true,
            Err(HostError::Unavailable(reason)) => {
                debug!(reason = %reason, "Graceful restart unavailable, stopping host");
                self.stop_all();
                false
            }
            Err(e) => {
                error!(error = %e, "Graceful restart failed, stopping host");
                self.stop_all();
                false
            }
        }
    }
}

/// Host control for the current process
pub struct ProcessHost {
    mode: RestartMode,
    supervisor_pid: Option<i32>,
    shutdown: Option<watch::Sender<bool>>,
}

impl ProcessHost {
    pub fn new(mode: RestartMode, supervisor_pid: Option<i32>) -> Self {
        Self {
            mode,
            supervisor_pid,
            shutdown: None,
        }
    }

    /// Attach the server's shutdown channel used by stop-all
    pub fn with_shutdown(mut self, tx: watch::Sender<bool>) -> Self {
        self.shutdown = Some(tx);
        self
    }

    #[cfg(unix)]
    fn signal_supervisor(&self) -> Result<(), HostError> {
        // SAFETY: getppid has no preconditions and cannot fail
        let pid = self
            .supervisor_pid
            .unwrap_or_else(|| unsafe { libc::getppid() });
        if pid <= 1 {
            return Err(HostError::Unavailable(format!(
                "no supervisor process (pid {})",
                pid
            )));
        }
        // SAFETY: kill(2) only sends a signal; an invalid pid yields -1/errno
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGUSR1) };
        if rc != 0 {
            return Err(HostError::Signal {
                pid,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
        info!(pid = pid, "Sent SIGUSR1 to supervisor");
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal_supervisor(&self) -> Result<(), HostError> {
        Err(HostError::Unavailable(
            "signals are not supported on this platform".to_string(),
        ))
    }
}

impl HostControl for ProcessHost {
    fn graceful_restart(&self) -> Result<(), HostError> {
        match self.mode {
            RestartMode::Signal => self.signal_supervisor(),
            RestartMode::Shutdown => Err(HostError::Unavailable(
                "restart mode is shutdown".to_string(),
            )),
            RestartMode::None => {
                info!("Host restart requested (restart mode none, ignoring)");
                Ok(())
            }
        }
    }

    fn stop_all(&self) {
        let Some(tx) = self.shutdown.clone() else {
            warn!("Host stop requested but no server is running in this process");
            return;
        };
        info!(delay_ms = STOP_DELAY.as_millis() as u64, "Stopping host server");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(STOP_DELAY).await;
                    let _ = tx.send(true);
                });
            }
            // called outside the runtime, e.g. from a plain CLI thread
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(STOP_DELAY);
                    let _ = tx.send(true);
                });
            }
        }
    }
}
