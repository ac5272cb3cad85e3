//! SSH session to a device

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;

use dr_core::traits::{Connection, Connector, SftpChannel};
use dr_core::{
    Authentication, ConnectionParameters, ConnectionState, RemoteProcess, TransportError,
};

use crate::{process, sftp};

/// Opens russh sessions
#[derive(Debug, Clone, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let ssh_config = Arc::new(Config::default());

        tracing::debug!("Connecting to {}", params.address());
        let mut handle = tokio::time::timeout(
            params.connect_timeout,
            client::connect(
                ssh_config,
                (params.host.as_str(), params.port),
                ClientHandler,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout(params.connect_timeout))?
        .map_err(|e| TransportError::ConnectionRefused(format!("{}: {}", params.address(), e)))?;

        tracing::debug!("Authenticating as user '{}'", params.username);
        let authenticated = match &params.authentication {
            Authentication::Password { password } => {
                handle
                    .authenticate_password(params.username.clone(), password.clone())
                    .await
            }
            Authentication::KeyFile { path, passphrase } => {
                let key = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(
                    |e| TransportError::KeyNotFound {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    },
                )?;
                handle
                    .authenticate_publickey(params.username.clone(), Arc::new(key))
                    .await
            }
        }
        .map_err(|e| TransportError::ConnectionRefused(format!("Authentication error: {}", e)))?;

        if !authenticated {
            return Err(TransportError::AuthenticationFailed {
                user: params.username.clone(),
            });
        }

        tracing::info!("Connected to {}", params);
        Ok(Arc::new(SshConnection {
            params: params.clone(),
            handle: Arc::new(handle),
        }))
    }
}

/// An authenticated russh session
pub struct SshConnection {
    params: ConnectionParameters,
    handle: Arc<Handle<ClientHandler>>,
}

#[async_trait]
impl Connection for SshConnection {
    fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    fn state(&self) -> ConnectionState {
        if self.handle.is_closed() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }

    fn create_remote_process(&self, command: &str) -> RemoteProcess {
        process::spawn(Arc::clone(&self.handle), command.to_string())
    }

    async fn create_sftp_channel(&self) -> Result<SftpChannel, TransportError> {
        sftp::open(&self.handle).await
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("Disconnect from {} failed: {}", self.params, e);
        }
    }
}

/// russh client callbacks
pub(crate) struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Any host key is accepted; the fingerprint is only logged.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Server host key: {}", server_public_key.fingerprint());
        Ok(true)
    }
}
