//! Deployment state machine
//!
//! A [`DeploymentRunner`] sequences one deployment cycle:
//!
//! ```text
//! start -> Connecting -> CleaningUp -> [UploadingHelper -> Mounting] -> ReadyForExecution
//!       start_execution -> Executing -> Finished
//! ```
//!
//! All transport work happens in spawned tasks that report back to the
//! runner over an internal channel. Every report carries the generation of
//! the cycle that asked for it; `start` and `stop` advance the generation,
//! so reports from an abandoned cycle are dropped unseen. The runner itself
//! is only ever touched from one task, so its state needs no locking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dr_core::command::{cleanup_command, mount_command};
use dr_core::config::{MountReadiness, RunConfig};
use dr_core::traits::{
    Connection, Connector, FileUploader, HelperPaths, SftpChannel, TransferFinished,
};
use dr_core::{
    ConnectionState, JobId, KillList, RemoteExit, RemoteProcess,
    RemoteProcessEvent, TransportError,
};

use crate::events::{RunnerCommand, RunnerEvent};
use crate::helpers::HelperProcessSet;
use crate::state::RunnerState;

/// Capacity of the event channel towards the collaborator.
///
/// Remote output flows through here, so the collaborator's read speed
/// throttles how fast the runner pulls output off the channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the command channel of a spawned runner
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Completion reports from transport tasks
enum Internal {
    Connected(Result<Arc<dyn Connection>, TransportError>),
    Cleanup(RemoteProcessEvent),
    UploaderInitialized(Result<SftpChannel, TransportError>),
    UploadFinished(TransferFinished),
    Mount(RemoteProcessEvent),
    Execution(RemoteProcessEvent),
}

/// A report tagged with the cycle it belongs to
struct Tagged {
    generation: u64,
    event: Internal,
}

/// Orchestrates deployment to and execution on one device
pub struct DeploymentRunner {
    config: RunConfig,
    connector: Arc<dyn Connector>,
    helper_paths: Arc<dyn HelperPaths>,

    connection: Option<Arc<dyn Connection>>,
    /// Whether `connection` was opened by this runner rather than injected
    owns_connection: bool,
    /// Connection state while `connection` is `None`
    connection_state: ConnectionState,
    kill_list: KillList,

    state: RunnerState,
    stopped: bool,
    generation: u64,
    ready_emitted: bool,

    upload_job: JobId,
    uploader: Option<Box<dyn FileUploader>>,
    mount_closer: Option<CancellationToken>,
    execution_closer: Option<CancellationToken>,
    helpers: HelperProcessSet,

    events: mpsc::Sender<RunnerEvent>,
    internal_tx: mpsc::UnboundedSender<Tagged>,
    internal_rx: mpsc::UnboundedReceiver<Tagged>,

    /// Commands of a spawned runner, read while an event send is blocked
    commands: Option<mpsc::Receiver<RunnerCommand>>,
    /// Commands received while an event send was blocked, in arrival order
    deferred: VecDeque<RunnerCommand>,
    /// A deferred `Stop` or `Shutdown` is waiting to be handled
    stop_pending: bool,
    shutdown_requested: bool,
}

impl DeploymentRunner {
    /// Create a runner and the receiver for its events
    pub fn new(
        config: RunConfig,
        connector: Arc<dyn Connector>,
        helper_paths: Arc<dyn HelperPaths>,
    ) -> (Self, mpsc::Receiver<RunnerEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let kill_list = config.kill_list();

        let runner = Self {
            config,
            connector,
            helper_paths,
            connection: None,
            owns_connection: false,
            connection_state: ConnectionState::Disconnected,
            kill_list,
            state: RunnerState::Idle,
            stopped: false,
            generation: 0,
            ready_emitted: false,
            upload_job: JobId::INVALID,
            uploader: None,
            mount_closer: None,
            execution_closer: None,
            helpers: HelperProcessSet::new(),
            events,
            internal_tx,
            internal_rx,
            commands: None,
            deferred: VecDeque::new(),
            stop_pending: false,
            shutdown_requested: false,
        };
        (runner, events_rx)
    }

    /// Current state
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Whether `stop` was called since the last `start`
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn kill_list(&self) -> &KillList {
        &self.kill_list
    }

    /// Local helper servers currently owned by the runner
    pub fn helpers(&self) -> &HelperProcessSet {
        &self.helpers
    }

    /// The connection in use, for sharing with other components
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.clone()
    }

    /// State of the connection to the device
    pub fn connection_state(&self) -> ConnectionState {
        match &self.connection {
            Some(connection) => connection.state(),
            None => self.connection_state,
        }
    }

    /// Offer an existing connection; `start` reuses it if it is connected to
    /// the configured device
    pub fn set_connection(&mut self, connection: Arc<dyn Connection>) {
        self.connection = Some(connection);
        self.owns_connection = false;
    }

    /// Add process names to kill during cleanup
    pub fn add_procs_to_kill<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kill_list.extend(names);
    }

    /// Begin a deployment cycle
    pub fn start(&mut self) {
        self.stopped = false;
        self.generation += 1;
        self.ready_emitted = false;
        self.upload_job = JobId::INVALID;
        self.release_channels();

        let reuse = self.connection.as_ref().is_some_and(|conn| {
            conn.state() == ConnectionState::Connected
                && *conn.parameters() == self.config.device
        });

        if reuse {
            tracing::debug!("Reusing connection to {}", self.config.device);
            self.handle_connected();
            return;
        }

        // A connection that does not match the device is never used again.
        if let Some(previous) = self.connection.take() {
            if self.owns_connection {
                tokio::spawn(async move { previous.disconnect().await });
            }
        }
        self.owns_connection = false;

        tracing::info!("Connecting to {}", self.config.device);
        self.state = RunnerState::Connecting;
        self.connection_state = ConnectionState::Connecting;
        let connector = Arc::clone(&self.connector);
        let params = self.config.device.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = connector.connect(&params).await;
            let _ = tx.send(Tagged {
                generation,
                event: Internal::Connected(result),
            });
        });
    }

    /// Cancel the current cycle.
    ///
    /// Pending reports are dropped, open channels are closed and, if a
    /// remote process was started, the cleanup command is fired once more
    /// without waiting for it. Safe to call repeatedly and before `start`.
    pub fn stop(&mut self) {
        if !self.stopped {
            tracing::info!("Stopping runner (state: {})", self.state);
        }
        self.stopped = true;
        self.generation += 1;
        if self.connection_state == ConnectionState::Connecting {
            self.connection_state = ConnectionState::Disconnected;
        }

        if let Some(uploader) = self.uploader.take() {
            uploader.close_channel();
        }
        if let Some(mount) = self.mount_closer.take() {
            mount.cancel();
        }
        if let Some(execution) = self.execution_closer.take() {
            execution.cancel();
            self.fire_cleanup();
        }
    }

    /// `stop`, then terminate the local helpers and drop a connection this
    /// runner opened itself
    pub async fn shutdown(&mut self) {
        self.stop();
        self.helpers
            .terminate_all(self.config.helper_stop_timeout)
            .await;
        if self.owns_connection {
            if let Some(connection) = self.connection.take() {
                connection.disconnect().await;
            }
            self.owns_connection = false;
            self.connection_state = ConnectionState::Disconnected;
        }
    }

    /// Run `command` on the device
    pub async fn start_execution(&mut self, command: &str) {
        if self.stopped {
            tracing::warn!("Ignoring execution request on a stopped runner");
            return;
        }
        if self.config.remote_executable.is_empty() {
            self.fail("Cannot run: No remote executable set.".to_string())
                .await;
            return;
        }
        let connection = match self.connection.clone() {
            Some(connection)
                if connection.state() == ConnectionState::Connected
                    && *connection.parameters() == self.config.device =>
            {
                connection
            }
            _ => {
                self.fail(format!("Cannot run: {}.", TransportError::NotConnected))
                    .await;
                return;
            }
        };
        if self.state != RunnerState::ReadyForExecution {
            tracing::warn!("Starting execution while {}", self.state);
        }

        tracing::info!("Starting remote process: {}", command);
        if let Some(previous) = self.execution_closer.take() {
            previous.cancel();
        }
        self.state = RunnerState::Executing;
        let process = connection.create_remote_process(command);
        self.execution_closer = Some(process.closer());
        self.forward_process(process, Internal::Execution);
    }

    /// Handle reports until none arrives for `idle`
    pub async fn run_until_idle(&mut self, idle: Duration) {
        while let Ok(Some(tagged)) = tokio::time::timeout(idle, self.internal_rx.recv()).await {
            self.handle_internal(tagged).await;
        }
    }

    /// Serve `commands` until `Shutdown` or until every sender is gone
    pub async fn run(mut self, commands: mpsc::Receiver<RunnerCommand>) {
        self.commands = Some(commands);
        while !self.shutdown_requested {
            if let Some(command) = self.deferred.pop_front() {
                self.handle_command(command).await;
                continue;
            }
            let Some(commands) = self.commands.as_mut() else {
                break;
            };
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(tagged) = self.internal_rx.recv() => self.handle_internal(tagged).await,
            }
        }
        self.commands = None;
        self.shutdown().await;
        tracing::debug!("Runner task finished");
    }

    /// Move the runner onto its own task
    pub fn spawn(self) -> (RunnerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (RunnerHandle { commands: tx }, task)
    }

    async fn handle_command(&mut self, command: RunnerCommand) {
        match command {
            RunnerCommand::Start => self.start(),
            RunnerCommand::Execute(command) => self.start_execution(&command).await,
            RunnerCommand::Stop => {
                self.stop_pending = false;
                self.stop();
            }
            RunnerCommand::AddProcsToKill(names) => self.add_procs_to_kill(names),
            RunnerCommand::Shutdown => {
                self.stop_pending = false;
                self.shutdown_requested = true;
            }
        }
    }

    async fn handle_internal(&mut self, tagged: Tagged) {
        if self.stopped || tagged.generation != self.generation {
            tracing::trace!(
                "Dropping report from generation {} (current {})",
                tagged.generation,
                self.generation
            );
            if let Internal::Connected(Ok(connection)) = tagged.event {
                tokio::spawn(async move { connection.disconnect().await });
            }
            return;
        }

        match tagged.event {
            Internal::Connected(Ok(connection)) => {
                self.connection = Some(connection);
                self.owns_connection = true;
                self.connection_state = ConnectionState::Connected;
                self.handle_connected();
            }
            Internal::Connected(Err(e)) => {
                self.connection_state = ConnectionState::Failed;
                self.fail(format!("Could not connect to host: {}", e)).await;
            }
            Internal::Cleanup(event) => self.handle_cleanup_event(event).await,
            Internal::UploaderInitialized(result) => self.handle_uploader_initialized(result).await,
            Internal::UploadFinished(finished) => self.handle_upload_finished(finished).await,
            Internal::Mount(event) => self.handle_mount_event(event).await,
            Internal::Execution(event) => self.handle_execution_event(event).await,
        }
    }

    fn handle_connected(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        self.state = RunnerState::CleaningUp;
        let command = self.cleanup_command();
        tracing::debug!("Initial cleanup: {}", command);
        let process = connection.create_remote_process(&command);
        self.forward_process(process, Internal::Cleanup);
    }

    async fn handle_cleanup_event(&mut self, event: RemoteProcessEvent) {
        let RemoteProcessEvent::Closed(exit) = event else {
            return;
        };

        self.helpers
            .terminate_all(self.config.helper_stop_timeout)
            .await;

        if !exit.is_normal() {
            self.fail(format!("Initial cleanup failed: {}", exit.error))
                .await;
        } else if self.config.mounts.is_empty() {
            self.set_ready().await;
        } else {
            self.deploy_helper_client();
        }
    }

    fn deploy_helper_client(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        self.state = RunnerState::UploadingHelper;
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = connection.create_sftp_channel().await;
            let _ = tx.send(Tagged {
                generation,
                event: Internal::UploaderInitialized(result),
            });
        });
    }

    async fn handle_uploader_initialized(&mut self, result: Result<SftpChannel, TransportError>) {
        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(format!("Failed to establish SFTP connection: {}", e))
                    .await;
                return;
            }
        };

        let (uploader, mut finished) = channel.into_parts();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            while let Some(report) = finished.recv().await {
                if tx
                    .send(Tagged {
                        generation,
                        event: Internal::UploadFinished(report),
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        let local = self.helper_paths.helper_client_path();
        let remote = self.config.helper_client_on_device();
        let job = uploader.upload_file(&local, &remote);
        if let Some(previous) = self.uploader.replace(uploader) {
            previous.close_channel();
        }

        if !job.is_valid() {
            self.fail(format!("Could not upload UTFS client ({}).", local.display()))
                .await;
            return;
        }
        tracing::debug!("Uploading {} to {} (job {})", local.display(), remote, job);
        self.upload_job = job;
    }

    async fn handle_upload_finished(&mut self, finished: TransferFinished) {
        if finished.job != self.upload_job {
            tracing::warn!("Unknown upload job {} finished", finished.job);
            return;
        }

        self.upload_job = JobId::INVALID;
        match finished.error {
            Some(error) if !error.is_empty() => {
                self.fail(format!("Could not upload UTFS client: {}", error))
                    .await;
            }
            _ => self.mount().await,
        }
    }

    async fn mount(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        self.state = RunnerState::Mounting;

        let server = self.helper_paths.helper_server_path();
        let ports: Vec<u16> = self.config.mounts.iter().map(|mount| mount.port).collect();
        for port in ports {
            if let Err(e) = self
                .helpers
                .start(&server, port, self.config.helper_start_grace)
                .await
            {
                self.fail(format!("Could not start UTFS server: {}", e))
                    .await;
                return;
            }
        }

        let command = mount_command(
            &self.config.mounts,
            &self.config.helper_client_on_device(),
            &self.config.host_address_from_device,
            &self.config.remote_sudo,
        );
        tracing::debug!("Mounting: {}", command);
        if let Some(previous) = self.mount_closer.take() {
            previous.cancel();
        }
        let process = connection.create_remote_process(&command);
        self.mount_closer = Some(process.closer());
        self.forward_process(process, Internal::Mount);
    }

    async fn handle_mount_event(&mut self, event: RemoteProcessEvent) {
        match event {
            // TODO: switch the default to OnFinished once it is confirmed that
            // utfs-client closes its channel after going to the background.
            RemoteProcessEvent::Started => {
                if self.config.mount_readiness == MountReadiness::OnStarted {
                    self.set_ready().await;
                }
            }
            RemoteProcessEvent::Output(data) | RemoteProcessEvent::ErrorOutput(data) => {
                tracing::debug!("Mount: {}", String::from_utf8_lossy(&data).trim_end());
            }
            RemoteProcessEvent::Closed(exit) => {
                if !exit.is_normal() {
                    // Readiness already reported stays reported.
                    let message = format!("Failure running UTFS client: {}", exit.error);
                    if self.ready_emitted {
                        self.emit(RunnerEvent::Error(message)).await;
                    } else {
                        self.fail(message).await;
                    }
                } else if self.config.mount_readiness == MountReadiness::OnFinished {
                    self.set_ready().await;
                }
            }
        }
    }

    async fn handle_execution_event(&mut self, event: RemoteProcessEvent) {
        match event {
            RemoteProcessEvent::Started => self.emit(RunnerEvent::RemoteProcessStarted).await,
            RemoteProcessEvent::Output(data) => self.emit(RunnerEvent::RemoteOutput(data)).await,
            RemoteProcessEvent::ErrorOutput(data) => {
                self.emit(RunnerEvent::RemoteErrorOutput(data)).await
            }
            RemoteProcessEvent::Closed(exit) => self.handle_execution_closed(exit).await,
        }
    }

    async fn handle_execution_closed(&mut self, exit: RemoteExit) {
        if exit.is_normal() {
            tracing::info!("Remote process exited with code {}", exit.exit_code);
            self.state = RunnerState::Finished;
            self.emit(RunnerEvent::RemoteProcessFinished(exit.exit_code))
                .await;
        } else {
            self.fail(format!("Error running remote process: {}", exit.error))
                .await;
        }
    }

    async fn set_ready(&mut self) {
        if self.ready_emitted {
            return;
        }
        self.ready_emitted = true;
        self.state = RunnerState::ReadyForExecution;
        tracing::info!("Ready for execution");
        self.emit(RunnerEvent::ReadyForExecution).await;
    }

    async fn fail(&mut self, message: String) {
        tracing::error!("{}", message);
        self.state = RunnerState::Failed;
        self.emit(RunnerEvent::Error(message)).await;
    }

    /// Send `event` to the collaborator.
    ///
    /// A spawned runner keeps reading commands while the event channel is
    /// full. Other commands are deferred; a `Stop` or `Shutdown` abandons the
    /// event so the actor loop can handle it.
    async fn emit(&mut self, event: RunnerEvent) {
        if self.stopped || self.stop_pending {
            return;
        }
        loop {
            let received = match self.commands.as_mut() {
                None => {
                    if self.events.send(event).await.is_err() {
                        tracing::debug!("Event receiver dropped");
                    }
                    return;
                }
                Some(commands) => tokio::select! {
                    permit = self.events.reserve() => {
                        match permit {
                            Ok(permit) => permit.send(event),
                            Err(_) => tracing::debug!("Event receiver dropped"),
                        }
                        return;
                    }
                    command = commands.recv() => command,
                },
            };

            let command = received.unwrap_or(RunnerCommand::Shutdown);
            let interrupts = matches!(command, RunnerCommand::Stop | RunnerCommand::Shutdown);
            self.deferred.push_back(command);
            if interrupts {
                tracing::debug!("Event channel full, dropping {:?} for a pending stop", event);
                self.stop_pending = true;
                return;
            }
        }
    }

    fn cleanup_command(&self) -> String {
        cleanup_command(&self.kill_list, &self.config.mounts, &self.config.remote_sudo)
    }

    /// Run the cleanup command without tracking it
    fn fire_cleanup(&self) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let process = connection.create_remote_process(&self.cleanup_command());
        tokio::spawn(async move {
            if let Some(exit) = process.wait().await {
                tracing::debug!("Final cleanup finished: {:?}", exit.status);
            }
        });
    }

    /// Close every channel left over from a previous cycle
    fn release_channels(&mut self) {
        if let Some(uploader) = self.uploader.take() {
            uploader.close_channel();
        }
        if let Some(mount) = self.mount_closer.take() {
            mount.cancel();
        }
        if let Some(execution) = self.execution_closer.take() {
            execution.cancel();
        }
    }

    fn forward_process(&self, mut process: RemoteProcess, wrap: fn(RemoteProcessEvent) -> Internal) {
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            while let Some(event) = process.next_event().await {
                if tx
                    .send(Tagged {
                        generation,
                        event: wrap(event),
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

/// The runner task has exited
#[derive(Debug, Error)]
#[error("Runner task has exited")]
pub struct RunnerClosed;

/// Sends commands to a runner moved onto its own task with
/// [`DeploymentRunner::spawn`]
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    commands: mpsc::Sender<RunnerCommand>,
}

impl RunnerHandle {
    pub async fn start(&self) -> Result<(), RunnerClosed> {
        self.send(RunnerCommand::Start).await
    }

    pub async fn start_execution(&self, command: impl Into<String>) -> Result<(), RunnerClosed> {
        self.send(RunnerCommand::Execute(command.into())).await
    }

    pub async fn stop(&self) -> Result<(), RunnerClosed> {
        self.send(RunnerCommand::Stop).await
    }

    pub async fn add_procs_to_kill(&self, names: Vec<String>) -> Result<(), RunnerClosed> {
        self.send(RunnerCommand::AddProcsToKill(names)).await
    }

    pub async fn shutdown(&self) -> Result<(), RunnerClosed> {
        self.send(RunnerCommand::Shutdown).await
    }

    async fn send(&self, command: RunnerCommand) -> Result<(), RunnerClosed> {
        self.commands.send(command).await.map_err(|_| RunnerClosed)
    }
}
