//! Local helper server processes
//!
//! Every mount needs a UTFS server running on this machine for the helper
//! client on the device to connect back to. The set owns those processes
//! from a successful start until they are terminated.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use dr_core::command::helper_server_args;
use dr_core::HelperError;

/// One running helper server
#[derive(Debug)]
struct HelperProcess {
    port: u16,
    child: Child,
}

/// Helper servers owned by one runner
#[derive(Debug, Default)]
pub struct HelperProcessSet {
    processes: Vec<HelperProcess>,
}

impl HelperProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `program` as the helper server for `port`.
    ///
    /// The process must still be alive after `grace`; one that exits within
    /// that window counts as a failed start.
    pub async fn start(
        &mut self,
        program: &Path,
        port: u16,
        grace: Duration,
    ) -> Result<(), HelperError> {
        let mut child = Command::new(program)
            .args(helper_server_args(port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HelperError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(HelperError::ExitedEarly {
                    program: program.display().to_string(),
                    status: status.to_string(),
                })
            }
            Ok(Err(e)) => return Err(HelperError::Io(e)),
            Err(_) => {}
        }

        tracing::info!(
            "Started helper server {} for port {} (pid {:?})",
            program.display(),
            port,
            child.id()
        );
        self.processes.push(HelperProcess { port, child });
        Ok(())
    }

    /// Terminate every helper: SIGTERM, up to `timeout` to exit, then kill.
    ///
    /// All handles are released even if signalling fails.
    pub async fn terminate_all(&mut self, timeout: Duration) {
        for mut helper in self.processes.drain(..) {
            tracing::debug!("Stopping helper server for port {}", helper.port);
            terminate(&mut helper.child, timeout).await;
        }
    }

    /// Ports of the running helpers, in start order
    pub fn ports(&self) -> Vec<u16> {
        self.processes.iter().map(|p| p.port).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

async fn terminate(child: &mut Child, timeout: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we own and have not reaped.
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            tracing::warn!(
                "Failed to send SIGTERM to helper {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("Helper server exited: {}", status),
        Ok(Err(e)) => tracing::warn!("Failed to wait for helper server: {}", e),
        Err(_) => {
            tracing::debug!("Helper server ignored SIGTERM, killing it");
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill helper server: {}", e);
            }
        }
    }
}
