//! dr-runner: Deployment runner for devrun
//!
//! Connects to a device, kills stale processes, bridges local directories
//! onto the device through the UTFS helpers and then runs and supervises a
//! remote process, relaying its output and exit status.

pub mod events;
pub mod helpers;
pub mod runner;
pub mod state;

pub use events::{RunnerCommand, RunnerEvent};
pub use helpers::HelperProcessSet;
pub use runner::{DeploymentRunner, RunnerClosed, RunnerHandle};
pub use state::RunnerState;
