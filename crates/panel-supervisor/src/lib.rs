//! Spawning, output fan-out and lifecycle tracking for the managed server.

pub mod command;
pub mod error;
pub mod output;
pub mod runner;
pub mod slot;

pub use command::CommandInvocation;
pub use error::ProcessError;
pub use output::{OutputHub, OutputStream};
pub use runner::{ProcessHandle, SpawnSpec, TermSignal};
pub use slot::{ManagedServerSlot, StartOutcome, StopOutcome, StopPolicy};
