//! dr-core: Core abstractions and configuration for devrun
//!
//! This crate provides the domain types, configuration structures, error
//! taxonomy and transport traits shared by the SSH transport and the
//! deployment runner.

pub mod command;
pub mod config;
pub mod error;
pub mod remote;
pub mod traits;
pub mod types;

pub use error::{ConfigError, HelperError, TransportError};
pub use remote::{RemoteProcess, RemoteProcessEvent, RemoteProcessSink};
pub use types::{
    Authentication, ConnectionParameters, ConnectionState, ExitStatus, JobId, KillList,
    MountSpecification, RemoteExit,
};
