//! dr-ssh: SSH transport for devrun
//!
//! Implements the `dr-core` transport traits on top of russh: one
//! authenticated session per device, exec channels for remote commands and
//! the SFTP subsystem for uploads.

mod connection;
mod process;
mod sftp;

pub use connection::{SshConnection, SshConnector};
pub use sftp::SftpUploader;
