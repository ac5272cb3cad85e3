//! Core trait definitions

mod toolchain;
mod transport;

pub use toolchain::{HelperPaths, MaddeToolchain, HELPER_CLIENT_NAME, HELPER_SERVER_NAME};
pub use transport::{Connection, Connector, FileUploader, SftpChannel, TransferFinished};
