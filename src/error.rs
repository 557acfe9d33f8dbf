use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::vm_state::VmState;

#[derive(Debug, Error, Diagnostic)]
pub enum ProvError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("invalid config: {message}")]
    Config { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error("failed to persist record for '{name}': {message}")]
    Persist { name: String, message: String },

    #[error("no VM named '{name}'")]
    NotFound { name: String },

    #[error("cannot {action} VM '{name}' while it is {state:?}")]
    InvalidState {
        name: String,
        state: VmState,
        action: &'static str,
    },

    #[error("VM '{name}' has an operation in progress")]
    #[diagnostic(help("poll `kvmprov status {name}` until the current operation settles"))]
    Busy { name: String },

    #[error("server error: {message}")]
    Server { message: String },

    #[error("{message}")]
    #[diagnostic(help("is `kvmprov serve` running and reachable at the configured address?"))]
    Client { message: String },
}

/// A request rejected before any control-plane call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    /// The target exists but does not match what was asked for.
    #[error("image conflict at {path}: {reason}")]
    Conflict { path: String, reason: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ControlPlaneError {
    #[error("transient control-plane error: {message}")]
    Transient { message: String },

    #[error("control-plane error: {message} ({hint})")]
    Permanent { message: String, hint: String },

    #[error("domain '{name}' not found")]
    NotFound { name: String },
}

/// Errors the orchestrator may retry with backoff.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ImageError {
    fn is_retryable(&self) -> bool {
        matches!(self, ImageError::Io { .. })
    }
}

impl Retryable for ControlPlaneError {
    fn is_retryable(&self) -> bool {
        matches!(self, ControlPlaneError::Transient { .. })
    }
}
