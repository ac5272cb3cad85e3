//! Messages between the runner and its collaborator

use bytes::Bytes;

/// Notifications from the runner.
///
/// `Error` ends the current cycle; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// The cycle failed
    Error(String),
    /// Connection, cleanup and mounts are in place; emitted once per cycle
    ReadyForExecution,
    /// The remote process was accepted by the device
    RemoteProcessStarted,
    /// Chunk of remote stdout
    RemoteOutput(Bytes),
    /// Chunk of remote stderr
    RemoteErrorOutput(Bytes),
    /// The remote process exited with this code
    RemoteProcessFinished(i32),
}

/// Requests to a runner task, see [`crate::RunnerHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCommand {
    /// Begin a new cycle
    Start,
    /// Run this command line on the device
    Execute(String),
    /// Cancel the current cycle
    Stop,
    /// Extend the kill list
    AddProcsToKill(Vec<String>),
    /// Stop, release helpers and end the task
    Shutdown,
}
