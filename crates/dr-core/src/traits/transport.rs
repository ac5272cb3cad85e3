//! Transport traits
//!
//! The runner only talks to the device through these traits, so it can be
//! driven by the russh implementation in `dr-ssh` or by test doubles.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::remote::RemoteProcess;
use crate::types::{ConnectionParameters, ConnectionState, JobId};

/// Opens connections to devices
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish and authenticate a new session
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An authenticated session to one device
#[async_trait]
pub trait Connection: Send + Sync {
    /// Parameters this session was opened with
    fn parameters(&self) -> &ConnectionParameters;

    /// Current session state
    fn state(&self) -> ConnectionState;

    /// Start `command` in a new exec channel.
    ///
    /// Returns immediately; progress and the exit report arrive on the
    /// returned handle. Failing to open the channel is reported as a
    /// `FailedToStart` exit, not as an error here.
    fn create_remote_process(&self, command: &str) -> RemoteProcess;

    /// Open the SFTP subsystem
    async fn create_sftp_channel(&self) -> Result<SftpChannel, TransportError>;

    /// Tear the session down
    async fn disconnect(&self);
}

/// Completion report of one transfer job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFinished {
    pub job: JobId,
    /// `None` on success
    pub error: Option<String>,
}

/// Upload side of an SFTP channel
pub trait FileUploader: Send + Sync {
    /// Queue an upload of `local` to `remote`, replacing any existing file.
    ///
    /// Returns [`JobId::INVALID`] if the job could not be queued (for example
    /// when the local file cannot be read); otherwise exactly one
    /// [`TransferFinished`] for the returned id follows.
    fn upload_file(&self, local: &Path, remote: &str) -> JobId;

    /// Close the channel, abandoning queued jobs
    fn close_channel(&self);
}

/// An initialized SFTP channel: the uploader plus its completion stream
pub struct SftpChannel {
    uploader: Box<dyn FileUploader>,
    finished: mpsc::UnboundedReceiver<TransferFinished>,
}

impl SftpChannel {
    pub fn new(
        uploader: Box<dyn FileUploader>,
        finished: mpsc::UnboundedReceiver<TransferFinished>,
    ) -> Self {
        Self { uploader, finished }
    }

    /// Split into the uploader and the completion stream
    pub fn into_parts(
        self,
    ) -> (
        Box<dyn FileUploader>,
        mpsc::UnboundedReceiver<TransferFinished>,
    ) {
        (self.uploader, self.finished)
    }
}

impl std::fmt::Debug for SftpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpChannel").finish_non_exhaustive()
    }
}
