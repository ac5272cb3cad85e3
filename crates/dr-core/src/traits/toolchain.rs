//! Toolchain capability

use std::path::PathBuf;

/// File name of the mount helper that runs on the device
pub const HELPER_CLIENT_NAME: &str = "utfs-client";

/// File name of the mount helper that runs on this machine
pub const HELPER_SERVER_NAME: &str = "utfs-server";

/// Locates the two helper binaries the runner needs
pub trait HelperPaths: Send + Sync {
    /// Local copy of the helper client, uploaded to the device
    fn helper_client_path(&self) -> PathBuf;

    /// Helper server binary, spawned locally once per mount
    fn helper_server_path(&self) -> PathBuf;
}

/// MADDE-style SDK layout: helpers live in `<root>/madlib`
#[derive(Debug, Clone)]
pub struct MaddeToolchain {
    root: PathBuf,
}

impl MaddeToolchain {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl HelperPaths for MaddeToolchain {
    fn helper_client_path(&self) -> PathBuf {
        self.root.join("madlib").join(HELPER_CLIENT_NAME)
    }

    fn helper_server_path(&self) -> PathBuf {
        self.root.join("madlib").join(HELPER_SERVER_NAME)
    }
}
