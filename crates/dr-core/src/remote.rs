//! Remote command channel handle
//!
//! A [`RemoteProcess`] is the consumer end of one exec channel. The transport
//! drives the channel in its own task and reports through a
//! [`RemoteProcessSink`]; the owner reads events and may close the channel at
//! any time through the shared cancellation token.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::RemoteExit;

/// Buffered events between the channel task and the owner.
///
/// Output chunks are the bulk of the traffic; 256 keeps a fast remote
/// process from stalling on a briefly busy runner.
pub const REMOTE_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Progress of a remote process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteProcessEvent {
    /// The command was accepted by the server
    Started,
    /// Chunk of stdout
    Output(Bytes),
    /// Chunk of stderr
    ErrorOutput(Bytes),
    /// The channel is gone; always the last event
    Closed(RemoteExit),
}

/// Owner side of a remote process
#[derive(Debug)]
pub struct RemoteProcess {
    events: mpsc::Receiver<RemoteProcessEvent>,
    cancel: CancellationToken,
}

impl RemoteProcess {
    /// Create a connected sink/handle pair
    pub fn channel() -> (RemoteProcessSink, RemoteProcess) {
        let (tx, rx) = mpsc::channel(REMOTE_EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        (
            RemoteProcessSink {
                tx,
                cancel: cancel.clone(),
            },
            RemoteProcess { events: rx, cancel },
        )
    }

    /// A handle whose process never started
    pub fn failed(error: impl Into<String>) -> RemoteProcess {
        let (sink, process) = Self::channel();
        // Capacity is non-zero and nothing else was sent, so this cannot fail.
        let _ = sink
            .tx
            .try_send(RemoteProcessEvent::Closed(RemoteExit::failed_to_start(error)));
        process
    }

    /// Next event, `None` once the channel task is gone
    pub async fn next_event(&mut self) -> Option<RemoteProcessEvent> {
        self.events.recv().await
    }

    /// Ask the transport to close the channel
    pub fn close_channel(&self) {
        self.cancel.cancel();
    }

    /// Token that closes the channel when cancelled
    pub fn closer(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain events until the process closes, returning its exit report
    pub async fn wait(mut self) -> Option<RemoteExit> {
        while let Some(event) = self.events.recv().await {
            if let RemoteProcessEvent::Closed(exit) = event {
                return Some(exit);
            }
        }
        None
    }
}

/// Transport side of a remote process
#[derive(Debug, Clone)]
pub struct RemoteProcessSink {
    tx: mpsc::Sender<RemoteProcessEvent>,
    cancel: CancellationToken,
}

impl RemoteProcessSink {
    pub async fn started(&self) {
        let _ = self.tx.send(RemoteProcessEvent::Started).await;
    }

    pub async fn output(&self, data: Bytes) {
        let _ = self.tx.send(RemoteProcessEvent::Output(data)).await;
    }

    pub async fn error_output(&self, data: Bytes) {
        let _ = self.tx.send(RemoteProcessEvent::ErrorOutput(data)).await;
    }

    pub async fn closed(&self, exit: RemoteExit) {
        let _ = self.tx.send(RemoteProcessEvent::Closed(exit)).await;
    }

    /// Resolves when the owner asked for the channel to be closed
    pub async fn close_requested(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_close_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
