//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::serde_utils::duration_secs;
use crate::traits::HELPER_CLIENT_NAME;

/// How to authenticate against the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Authentication {
    /// Plain password authentication
    Password { password: String },
    /// Public key authentication with a private key file
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl Default for Authentication {
    fn default() -> Self {
        Authentication::KeyFile {
            path: dirs::home_dir()
                .unwrap_or_default()
                .join(".ssh")
                .join("id_rsa"),
            passphrase: None,
        }
    }
}

/// Everything needed to open a transport session to a device.
///
/// Two runs may share a live connection only if their parameters compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    /// Host name or address of the device
    pub host: String,

    /// SSH port
    pub port: u16,

    /// User to log in as
    pub username: String,

    /// Credentials
    pub authentication: Authentication,

    /// How long to wait for the connection to come up
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: whoami::username(),
            authentication: Authentication::default(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionParameters {
    /// `host:port` form used when dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Lifecycle of a connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No live session
    Disconnected,
    /// Session is being established
    Connecting,
    /// Session is authenticated and usable
    Connected,
    /// The last attempt failed
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// One bridged mount: a local helper server listening on `port` and the
/// remote directory the helper client mounts it on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpecification {
    /// Port used for both the local and the remote side of the bridge
    pub port: u16,
    /// Absolute path on the device
    pub remote_mount_point: String,
}

impl MountSpecification {
    pub fn new(port: u16, remote_mount_point: impl Into<String>) -> Self {
        Self {
            port,
            remote_mount_point: remote_mount_point.into(),
        }
    }
}

/// Process names to kill on the device before a run.
///
/// Insertion order is kept; duplicates are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillList {
    names: Vec<String>,
}

impl KillList {
    /// Empty kill list
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill list for running `local_executable`: its file name plus the
    /// helper client, which may still be alive from an earlier run.
    pub fn for_executable(local_executable: &Path) -> Self {
        let mut list = Self::new();
        if let Some(name) = local_executable.file_name() {
            list.push(name.to_string_lossy());
        }
        list.push(HELPER_CLIENT_NAME);
        list
    }

    /// Add a name unless it is already present or empty
    pub fn push(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !name.is_empty() && !self.names.contains(&name) {
            self.names.push(name);
        }
    }

    /// Add several names
    pub fn extend<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.push(name);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Identifier of an SFTP transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u32);

impl JobId {
    /// Returned when a transfer could not even be queued
    pub const INVALID: JobId = JobId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a remote process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Channel could not be opened or the command could not be executed
    FailedToStart,
    /// The process was killed, or the channel closed without an exit status
    KilledBySignal,
    /// The process exited and reported an exit code
    ExitedNormally,
}

/// Final report of a remote process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteExit {
    pub status: ExitStatus,
    /// Exit code, meaningful only for [`ExitStatus::ExitedNormally`]
    pub exit_code: i32,
    /// Diagnostic text for abnormal exits
    pub error: String,
}

impl RemoteExit {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            status: ExitStatus::ExitedNormally,
            exit_code,
            error: String::new(),
        }
    }

    pub fn failed_to_start(error: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::FailedToStart,
            exit_code: -1,
            error: error.into(),
        }
    }

    pub fn killed(error: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::KilledBySignal,
            exit_code: -1,
            error: error.into(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.status == ExitStatus::ExitedNormally
    }
}
