//! Core error types for devrun

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Transport-level errors (connection, channels, file transfer)
#[derive(Error, Debug)]
pub enum TransportError {
    /// The host could not be reached
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Connecting took longer than the configured timeout
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// The server rejected our credentials
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// Private key could not be loaded
    #[error("Private key not found at {path}: {message}")]
    KeyNotFound { path: String, message: String },

    /// An operation needed a live connection to the target device
    #[error("Not connected to device")]
    NotConnected,

    /// Opening or driving a channel failed
    #[error("Channel error: {0}")]
    Channel(String),

    /// SFTP subsystem error
    #[error("SFTP error: {0}")]
    Sftp(String),
}

/// Errors starting or stopping local helper processes
#[derive(Error, Debug)]
pub enum HelperError {
    /// The process could not be spawned at all
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process was spawned but exited during the start grace period
    #[error("{program} exited right after starting ({status})")]
    ExitedEarly { program: String, status: String },

    /// Waiting on or signalling the process failed
    #[error("I/O error on helper process: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
