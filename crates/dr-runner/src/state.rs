//! Runner lifecycle states

use std::fmt;

/// Where a deployment cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Nothing started yet
    Idle,
    /// Waiting for the transport session
    Connecting,
    /// Killing stale processes and unmounting old mounts
    CleaningUp,
    /// Uploading the helper client to the device
    UploadingHelper,
    /// Starting helper servers and the remote mount command
    Mounting,
    /// The collaborator may start the remote process
    ReadyForExecution,
    /// The remote process is running
    Executing,
    /// The remote process exited normally
    Finished,
    /// The cycle hit an error; `start` has to be called again
    Failed,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerState::Idle => "idle",
            RunnerState::Connecting => "connecting",
            RunnerState::CleaningUp => "cleaning up",
            RunnerState::UploadingHelper => "uploading helper",
            RunnerState::Mounting => "mounting",
            RunnerState::ReadyForExecution => "ready for execution",
            RunnerState::Executing => "executing",
            RunnerState::Finished => "finished",
            RunnerState::Failed => "failed",
        };
        f.write_str(name)
    }
}
