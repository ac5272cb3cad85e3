//! SFTP uploads

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use russh::client::Handle;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dr_core::traits::{FileUploader, SftpChannel, TransferFinished};
use dr_core::{JobId, TransportError};

use crate::connection::ClientHandler;

/// Open the SFTP subsystem on a fresh session channel
pub(crate) async fn open(handle: &Handle<ClientHandler>) -> Result<SftpChannel, TransportError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| TransportError::Channel(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| TransportError::Sftp(format!("subsystem request failed: {}", e)))?;
    let session = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| TransportError::Sftp(e.to_string()))?;

    tracing::debug!("SFTP channel initialized");
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let uploader = SftpUploader {
        session: Arc::new(session),
        finished: finished_tx,
        next_job: AtomicU32::new(1),
        cancel: CancellationToken::new(),
    };
    Ok(SftpChannel::new(Box::new(uploader), finished_rx))
}

/// Uploads files over one SFTP session, one task per job
pub struct SftpUploader {
    session: Arc<SftpSession>,
    finished: mpsc::UnboundedSender<TransferFinished>,
    next_job: AtomicU32,
    cancel: CancellationToken,
}

impl SftpUploader {
    fn allocate_job(&self) -> JobId {
        loop {
            let id = JobId(self.next_job.fetch_add(1, Ordering::Relaxed));
            if id.is_valid() {
                return id;
            }
        }
    }
}

impl FileUploader for SftpUploader {
    fn upload_file(&self, local: &Path, remote: &str) -> JobId {
        if self.cancel.is_cancelled() {
            tracing::warn!("Upload of {} requested on a closed channel", local.display());
            return JobId::INVALID;
        }
        let permissions = match std::fs::metadata(local) {
            Ok(meta) if meta.is_file() => file_mode(&meta),
            Ok(_) => {
                tracing::warn!("Cannot upload {}: not a regular file", local.display());
                return JobId::INVALID;
            }
            Err(e) => {
                tracing::warn!("Cannot upload {}: {}", local.display(), e);
                return JobId::INVALID;
            }
        };

        let job = self.allocate_job();
        let session = Arc::clone(&self.session);
        let finished = self.finished.clone();
        let cancel = self.cancel.clone();
        let local = local.to_path_buf();
        let remote = remote.to_string();

        tracing::debug!("Upload job {}: {} -> {}", job, local.display(), remote);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = upload(&session, &local, &remote, permissions) => result,
            };
            let _ = finished.send(TransferFinished {
                job,
                error: result.err(),
            });
        });
        job
    }

    fn close_channel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            if let Err(e) = session.close().await {
                tracing::debug!("Closing SFTP session failed: {}", e);
            }
        });
    }
}

async fn upload(
    session: &SftpSession,
    local: &Path,
    remote: &str,
    permissions: u32,
) -> Result<(), String> {
    let contents = tokio::fs::read(local)
        .await
        .map_err(|e| format!("Failed to read {}: {}", local.display(), e))?;

    let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE;
    let mut file = session
        .open_with_flags(remote, flags)
        .await
        .map_err(|e| format!("Failed to open {}: {}", remote, e))?;
    file.write_all(&contents)
        .await
        .map_err(|e| format!("Failed to write {}: {}", remote, e))?;
    file.shutdown()
        .await
        .map_err(|e| format!("Failed to close {}: {}", remote, e))?;

    let attributes = FileAttributes {
        permissions: Some(permissions),
        ..Default::default()
    };
    session
        .set_metadata(remote, attributes)
        .await
        .map_err(|e| format!("Failed to set permissions on {}: {}", remote, e))?;

    tracing::debug!("Uploaded {} bytes to {}", contents.len(), remote);
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o755
}
