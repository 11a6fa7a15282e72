//! Control channel for external administration
//!
//! This module contains:
//! - The TCP control server and its JSON-lines protocol
//! - The command descriptor requests are validated against
//! - Discovery publication of the server's reachable address

mod command;
mod registry;
mod server;

pub use command::{
    ArgKind, ArgSpec, CommandDescriptor, CommandDocument, CommandHandler, CommandResponse, CommandSpec,
};
pub use registry::{advertised_address, publish, Advertised, Publication, REGISTRY_KEY};
pub use server::ControlServer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the control channel
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to bind control server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Control server already started")]
    AlreadyStarted,

    #[error("Control server is shut down")]
    ShutDown,

    #[error("Invalid command descriptor: {0}")]
    Descriptor(String),

    #[error("Malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Command '{command}' requires argument '{arg}'")]
    MissingArgument { command: String, arg: String },

    #[error("Command '{command}' does not take argument '{arg}'")]
    UnknownArgument { command: String, arg: String },

    #[error("Argument '{arg}' of '{command}' must be {expected}")]
    WrongArgumentKind {
        command: String,
        arg: String,
        expected: ArgKind,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Command failed: {0}")]
    Handler(String),

    #[error("Failed to update registry {path}: {message}")]
    Registry { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
