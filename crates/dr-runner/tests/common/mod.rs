//! Scripted transport for driving a runner without a device

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use dr_core::config::RunConfig;
use dr_core::traits::{
    Connection, Connector, FileUploader, HelperPaths, SftpChannel, TransferFinished,
};
use dr_core::{
    ConnectionParameters, ConnectionState, JobId, RemoteExit, RemoteProcess,
    RemoteProcessSink, TransportError,
};
use dr_runner::{DeploymentRunner, RunnerEvent};

/// How long `run_until_idle` waits for the next report
pub const IDLE: Duration = Duration::from_millis(100);

/// Behaviour of the next remote process
#[derive(Debug, Clone)]
pub enum Script {
    /// Start, print, exit with a code
    Exit {
        stdout: Vec<&'static str>,
        stderr: Vec<&'static str>,
        code: i32,
    },
    /// Never start
    FailToStart(&'static str),
    /// Start, then die from a signal
    Killed(&'static str),
    /// Start and stay open; the test drives the sink
    Hold,
    /// Do nothing at all; the test drives the sink
    Manual,
}

impl Script {
    pub fn ok() -> Self {
        Script::Exit {
            stdout: vec![],
            stderr: vec![],
            code: 0,
        }
    }
}

/// How opening the SFTP channel behaves
#[derive(Debug, Clone)]
pub enum SftpScript {
    /// Channel cannot be opened
    Fail(&'static str),
    /// Uploads get this job id; `finish` is reported right away if set
    Job {
        job: JobId,
        finish: Option<Option<String>>,
    },
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub local: PathBuf,
    pub remote: String,
}

pub struct MockConnection {
    params: ConnectionParameters,
    state: Mutex<ConnectionState>,
    scripts: Mutex<VecDeque<Script>>,
    commands: Mutex<Vec<String>>,
    sinks: Mutex<Vec<RemoteProcessSink>>,
    sftp: Mutex<SftpScript>,
    sftp_opened: AtomicUsize,
    uploads: Arc<Mutex<Vec<Upload>>>,
    finished_tx: Arc<Mutex<Option<mpsc::UnboundedSender<TransferFinished>>>>,
    uploader_closed: Arc<Mutex<bool>>,
    disconnects: AtomicUsize,
}

impl MockConnection {
    pub fn new(params: ConnectionParameters) -> Arc<Self> {
        Arc::new(Self {
            params,
            state: Mutex::new(ConnectionState::Connected),
            scripts: Mutex::new(VecDeque::new()),
            commands: Mutex::new(vec![]),
            sinks: Mutex::new(vec![]),
            sftp: Mutex::new(SftpScript::Job {
                job: JobId(1),
                finish: Some(None),
            }),
            sftp_opened: AtomicUsize::new(0),
            uploads: Arc::new(Mutex::new(vec![])),
            finished_tx: Arc::new(Mutex::new(None)),
            uploader_closed: Arc::new(Mutex::new(false)),
            disconnects: AtomicUsize::new(0),
        })
    }

    /// Queue behaviours for the next remote processes, in order
    pub fn script(&self, scripts: impl IntoIterator<Item = Script>) {
        self.scripts.lock().unwrap().extend(scripts);
    }

    pub fn set_sftp(&self, script: SftpScript) {
        *self.sftp.lock().unwrap() = script;
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Every remote command started so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Sink of the `index`th remote process
    pub fn sink(&self, index: usize) -> RemoteProcessSink {
        self.sinks.lock().unwrap()[index].clone()
    }

    pub fn sftp_opened(&self) -> usize {
        self.sftp_opened.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn uploader_closed(&self) -> bool {
        *self.uploader_closed.lock().unwrap()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Report a transfer completion as the SFTP channel would
    pub fn finish_upload(&self, job: JobId, error: Option<&str>) {
        let tx = self.finished_tx.lock().unwrap();
        tx.as_ref()
            .expect("no SFTP channel open")
            .send(TransferFinished {
                job,
                error: error.map(str::to_string),
            })
            .unwrap();
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn create_remote_process(&self, command: &str) -> RemoteProcess {
        self.commands.lock().unwrap().push(command.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(Script::ok);

        let (sink, process) = RemoteProcess::channel();
        self.sinks.lock().unwrap().push(sink.clone());
        tokio::spawn(async move {
            match script {
                Script::Exit {
                    stdout,
                    stderr,
                    code,
                } => {
                    sink.started().await;
                    for chunk in stdout {
                        sink.output(Bytes::from_static(chunk.as_bytes())).await;
                    }
                    for chunk in stderr {
                        sink.error_output(Bytes::from_static(chunk.as_bytes()))
                            .await;
                    }
                    sink.closed(RemoteExit::exited(code)).await;
                }
                Script::FailToStart(error) => {
                    sink.closed(RemoteExit::failed_to_start(error)).await;
                }
                Script::Killed(error) => {
                    sink.started().await;
                    sink.closed(RemoteExit::killed(error)).await;
                }
                Script::Hold => sink.started().await,
                Script::Manual => {}
            }
        });
        process
    }

    async fn create_sftp_channel(&self) -> Result<SftpChannel, TransportError> {
        self.sftp_opened.fetch_add(1, Ordering::SeqCst);
        let script = self.sftp.lock().unwrap().clone();
        match script {
            SftpScript::Fail(reason) => Err(TransportError::Sftp(reason.to_string())),
            SftpScript::Job { job, finish } => {
                let (tx, rx) = mpsc::unbounded_channel();
                *self.finished_tx.lock().unwrap() = Some(tx.clone());
                *self.uploader_closed.lock().unwrap() = false;
                let uploader = MockUploader {
                    job,
                    finish,
                    tx,
                    uploads: Arc::clone(&self.uploads),
                    closed: Arc::clone(&self.uploader_closed),
                };
                Ok(SftpChannel::new(Box::new(uploader), rx))
            }
        }
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }
}

struct MockUploader {
    job: JobId,
    finish: Option<Option<String>>,
    tx: mpsc::UnboundedSender<TransferFinished>,
    uploads: Arc<Mutex<Vec<Upload>>>,
    closed: Arc<Mutex<bool>>,
}

impl FileUploader for MockUploader {
    fn upload_file(&self, local: &Path, remote: &str) -> JobId {
        self.uploads.lock().unwrap().push(Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        if let (true, Some(error)) = (self.job.is_valid(), self.finish.clone()) {
            let _ = self.tx.send(TransferFinished {
                job: self.job,
                error,
            });
        }
        self.job
    }

    fn close_channel(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

pub struct MockConnector {
    connection: Arc<MockConnection>,
    failure: Option<&'static str>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(connection: Arc<MockConnection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            failure: None,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn failing(connection: Arc<MockConnection>, reason: &'static str) -> Arc<Self> {
        Arc::new(Self {
            connection,
            failure: Some(reason),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _params: &ConnectionParameters,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.failure {
            Some(reason) => Err(TransportError::ConnectionRefused(reason.to_string())),
            None => Ok(Arc::clone(&self.connection) as Arc<dyn Connection>),
        }
    }
}

/// Helper paths inside a scratch toolchain
pub struct TestToolchain {
    pub root: PathBuf,
}

impl HelperPaths for TestToolchain {
    fn helper_client_path(&self) -> PathBuf {
        self.root.join("madlib").join("utfs-client")
    }

    fn helper_server_path(&self) -> PathBuf {
        self.root.join("madlib").join("utfs-server")
    }
}

pub fn device() -> ConnectionParameters {
    ConnectionParameters {
        host: "192.168.2.15".into(),
        username: "developer".into(),
        ..Default::default()
    }
}

pub fn config() -> RunConfig {
    RunConfig {
        device: device(),
        local_executable: PathBuf::from("/home/me/calc/build/calc"),
        remote_executable: "/opt/calc/bin/calc".into(),
        host_address_from_device: "192.168.2.14".into(),
        helper_start_grace: Duration::from_millis(200),
        helper_stop_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

pub struct Harness {
    pub runner: DeploymentRunner,
    pub events: mpsc::Receiver<RunnerEvent>,
    pub connection: Arc<MockConnection>,
    pub connector: Arc<MockConnector>,
}

impl Harness {
    pub fn new(config: RunConfig, toolchain_root: &Path) -> Self {
        let connection = MockConnection::new(config.device.clone());
        let connector = MockConnector::new(Arc::clone(&connection));
        Self::with_connector(config, toolchain_root, connection, connector)
    }

    pub fn with_connector(
        config: RunConfig,
        toolchain_root: &Path,
        connection: Arc<MockConnection>,
        connector: Arc<MockConnector>,
    ) -> Self {
        let toolchain = TestToolchain {
            root: toolchain_root.to_path_buf(),
        };
        let (runner, events) = DeploymentRunner::new(
            config,
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(toolchain),
        );
        Self {
            runner,
            events,
            connection,
            connector,
        }
    }

    pub async fn settle(&mut self) {
        self.runner.run_until_idle(IDLE).await;
    }

    /// Every event emitted so far
    pub fn drain(&mut self) -> Vec<RunnerEvent> {
        let mut out = vec![];
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Toolchain whose helper server records its arguments and keeps running
#[cfg(unix)]
pub fn scratch_toolchain() -> tempfile::TempDir {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let madlib = dir.path().join("madlib");
    std::fs::create_dir_all(&madlib).unwrap();
    std::fs::write(madlib.join("utfs-client"), b"\x7fELF client").unwrap();

    let server = madlib.join("utfs-server");
    std::fs::write(
        &server,
        format!(
            "#!/bin/sh\necho \"$@\" >> {}\nexec sleep 30\n",
            madlib.join("server-args.txt").display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&server, std::fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

/// Lines written by the scratch helper server, one per start
pub fn server_args(toolchain: &Path) -> Vec<String> {
    std::fs::read_to_string(toolchain.join("madlib").join("server-args.txt"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
