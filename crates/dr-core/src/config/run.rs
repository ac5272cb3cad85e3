//! Run configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::traits::HELPER_CLIENT_NAME;
use crate::types::{ConnectionParameters, KillList, MountSpecification};

/// When the mount stage counts as done.
///
/// The helper client is expected to daemonize itself, so by default the
/// runner treats the mount channel starting as readiness. `OnFinished` waits
/// for the mount command to exit successfully instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountReadiness {
    #[default]
    OnStarted,
    OnFinished,
}

/// Everything the runner needs to deploy to and run on one device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Device to connect to
    pub device: ConnectionParameters,

    /// Executable as built on this machine; its file name is killed on the
    /// device before each run
    pub local_executable: PathBuf,

    /// Executable path on the device
    pub remote_executable: String,

    /// Arguments passed to the remote executable
    pub arguments: Vec<String>,

    /// Local directories bridged onto the device
    pub mounts: Vec<MountSpecification>,

    /// Address of this machine as seen from the device
    pub host_address_from_device: String,

    /// Root of the SDK that ships the helper client and server binaries
    pub toolchain_root: PathBuf,

    /// Home directory of the developer user on the device
    pub device_home: String,

    /// Prefix that runs a command with elevated privileges on the device
    pub remote_sudo: String,

    /// Extra process names to kill during cleanup
    pub kill: Vec<String>,

    /// Readiness policy of the mount stage
    pub mount_readiness: MountReadiness,

    /// How long a freshly spawned helper server must stay alive
    #[serde(with = "duration_millis")]
    pub helper_start_grace: Duration,

    /// How long a helper server gets to exit after SIGTERM
    #[serde(with = "duration_secs")]
    pub helper_stop_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device: ConnectionParameters::default(),
            local_executable: PathBuf::new(),
            remote_executable: String::new(),
            arguments: vec![],
            mounts: vec![],
            host_address_from_device: String::new(),
            toolchain_root: PathBuf::from("/opt/madde"),
            device_home: "/home/developer".to_string(),
            remote_sudo: "/usr/lib/mad-developer/devrootsh".to_string(),
            kill: vec![],
            mount_readiness: MountReadiness::default(),
            helper_start_grace: Duration::from_millis(100),
            helper_stop_timeout: Duration::from_secs(1),
        }
    }
}

impl RunConfig {
    /// Where the helper client is uploaded to on the device
    pub fn helper_client_on_device(&self) -> String {
        format!(
            "{}/{}",
            self.device_home.trim_end_matches('/'),
            HELPER_CLIENT_NAME
        )
    }

    /// Initial kill list: the local executable's name, the helper client and
    /// any configured extras
    pub fn kill_list(&self) -> KillList {
        let mut list = KillList::for_executable(&self.local_executable);
        list.extend(self.kill.iter().cloned());
        list
    }

    /// Check the fields the runner cannot work without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.is_empty() {
            return Err(ConfigError::MissingField("device.host".into()));
        }
        if !self.mounts.is_empty() && self.host_address_from_device.is_empty() {
            return Err(ConfigError::MissingField(
                "host_address_from_device".into(),
            ));
        }
        for mount in &self.mounts {
            if mount.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "mount {} has port 0",
                    mount.remote_mount_point
                )));
            }
            if !mount.remote_mount_point.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "remote mount point '{}' is not absolute",
                    mount.remote_mount_point
                )));
            }
        }
        Ok(())
    }
}
