//! Error types for the Foundry operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the machine, namespace or command it relates to so a
//! failure can be written into a machine's status without extra lookups.

use std::fmt;

use thiserror::Error;

use crate::remote::CommandError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Outcome of a failed control-plane lookup in a namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupFailure {
    /// No machine in the namespace carries the control-plane role
    NotFound,
    /// More than one machine carries the control-plane role
    Ambiguous {
        /// Number of control-plane machines found
        count: usize,
    },
}

impl fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no control-plane machine found"),
            Self::Ambiguous { count } => {
                write!(f, "found {count} control-plane machines, expected exactly one")
            }
        }
    }
}

/// Main error type for Foundry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A write was rejected because the record changed since it was read
    #[error("conflict writing {kind} {name}: record was modified concurrently")]
    Conflict {
        /// Resource kind being written
        kind: String,
        /// Name of the record
        name: String,
    },

    /// A dependency (cluster record, control-plane address) is not available yet
    #[error("dependency not ready for {machine}: {message}")]
    DependencyNotReady {
        /// Machine waiting on the dependency
        machine: String,
        /// What is missing
        message: String,
    },

    /// The control-plane machine of a namespace could not be resolved
    #[error("control-plane lookup in namespace {namespace} failed: {failure}")]
    ControlPlaneLookup {
        /// Namespace that was searched
        namespace: String,
        /// Why the lookup failed
        failure: LookupFailure,
    },

    /// A remote command failed on a machine
    #[error(transparent)]
    Command {
        /// The structured command failure
        #[from]
        source: CommandError,
    },

    /// Infrastructure provisioner error
    #[error("provisioner error for {machine}: {message}")]
    Provisioner {
        /// Machine being provisioned or released
        machine: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// The machine's status carries a phase this controller does not know
    #[error("machine {machine} has unrecognized phase {phase:?}")]
    UnknownPhase {
        /// Machine with the corrupt phase
        machine: String,
        /// The raw phase value
        phase: String,
    },

    /// Certificate bundle generation or signing failed
    #[error("certificate error: {message}")]
    Certificate {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being serialized (if known)
        kind: Option<String>,
    },

    /// A record is missing data the controller needs
    #[error("validation error for {machine}: {message}")]
    Validation {
        /// Name of the machine with invalid configuration
        machine: String,
        /// Description of what's invalid
        message: String,
    },

    /// An operation observed its cancellation token
    #[error("operation {operation} was cancelled")]
    Cancelled {
        /// Name of the cancelled operation
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "runner", "controller")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for a stale write
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a dependency-not-ready error
    pub fn dependency_not_ready(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DependencyNotReady {
            machine: machine.into(),
            message: msg.into(),
        }
    }

    /// Create a control-plane lookup error
    pub fn control_plane_lookup(namespace: impl Into<String>, failure: LookupFailure) -> Self {
        Self::ControlPlaneLookup {
            namespace: namespace.into(),
            failure,
        }
    }

    /// Create a retryable provisioner error
    pub fn provisioner(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioner {
            machine: machine.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provisioner error (e.g., bad credentials)
    pub fn provisioner_permanent(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioner {
            machine: machine.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an unknown-phase error
    pub fn unknown_phase(machine: impl Into<String>, phase: impl Into<String>) -> Self {
        Self::UnknownPhase {
            machine: machine.into(),
            phase: phase.into(),
        }
    }

    /// Create a certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a validation error with machine context
    pub fn validation_for(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            machine: machine.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Retryable errors are requeued with backoff by the controller and keep
    /// polling loops going. Non-retryable errors stop a polling loop early and
    /// wait for the record to change before the controller looks again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Conflict { .. } => true,
            Error::DependencyNotReady { .. } => true,
            Error::ControlPlaneLookup { failure, .. } => *failure == LookupFailure::NotFound,
            Error::Command { .. } => true,
            Error::Provisioner { retryable, .. } => *retryable,
            Error::UnknownPhase { .. } => false,
            Error::Certificate { .. } => false,
            Error::Serialization { .. } => false,
            Error::Validation { .. } => false,
            Error::Cancelled { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the machine name if this error is associated with a specific machine
    pub fn machine(&self) -> Option<&str> {
        match self {
            Error::DependencyNotReady { machine, .. } => Some(machine),
            Error::Provisioner { machine, .. } => Some(machine),
            Error::UnknownPhase { machine, .. } => Some(machine),
            Error::Validation { machine, .. } => Some(machine),
            _ => None,
        }
    }

    /// The failing command line, when this is a remote command failure
    pub fn command(&self) -> Option<&str> {
        match self {
            Error::Command { source } => Some(source.command()),
            _ => None,
        }
    }
}

/// True when a kube error is a 404 from the API server
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when a kube error is a 409 from the API server
pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
