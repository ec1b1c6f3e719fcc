use thiserror::Error;

use crate::registry::RegistryError;

/// Errors surfaced by VM, storage and console operations.
///
/// Every variant maps to a stable [`VmError::code`] so HTTP callers can branch
/// on the cause instead of the message text.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    InvalidState(String),

    #[error("failed to launch hypervisor: {0}")]
    SpawnFailure(String),

    #[error("could not reach console endpoint 127.0.0.1:{port}: {reason}")]
    UpstreamConnectFailure { port: u16, reason: String },

    #[error("{field} '{value}' is already in use")]
    DuplicateName { field: &'static str, value: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no free console port in {min}..={max}")]
    NoFreeConsolePort { min: u16, max: u16 },

    #[error("qemu-img failed: {0}")]
    ImageToolFailure(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl VmError {
    pub fn vm_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "VM",
            id: id.to_string(),
        }
    }

    pub fn disk_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "disk",
            id: id.to_string(),
        }
    }

    /// A name taken by another record.
    pub fn duplicate_name(name: impl ToString) -> Self {
        Self::DuplicateName {
            field: "name",
            value: name.to_string(),
        }
    }

    pub fn iso_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "ISO",
            id: id.to_string(),
        }
    }

    /// Stable machine-readable error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::SpawnFailure(_) => "SPAWN_FAILURE",
            Self::UpstreamConnectFailure { .. } => "UPSTREAM_CONNECT_FAILURE",
            Self::DuplicateName { .. } => "DUPLICATE_NAME",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NoFreeConsolePort { .. } => "NO_FREE_CONSOLE_PORT",
            Self::ImageToolFailure(_) => "IMAGE_TOOL_FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<RegistryError> for VmError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Conflict { field, value } => Self::DuplicateName { field, value },
            RegistryError::Storage(e) => Self::Internal(e),
        }
    }
}

pub type VmResult<T> = std::result::Result<T, VmError>;
