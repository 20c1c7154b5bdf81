//! Error types for matchlock

use std::time::Duration;

use thiserror::Error;

use crate::phase::Phase;

/// Result type alias using matchlock Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in matchlock operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unusable request parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Dialing a guest port over the hypervisor's vsock UDS failed
    #[error("vsock connect failed: {0}")]
    VsockConnect(String),

    /// The guest never signalled readiness within the deadline
    #[error("VM not ready after {0:?}")]
    VmNotReady(Duration),

    /// Every third octet in the configured range is allocated
    #[error("no available subnets")]
    SubnetExhausted,

    /// Reconcile skipped because the VM is alive and `force` was not set
    #[error("VM {0} is running")]
    VmRunning(String),

    /// No state row for the given VM ID
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// Illegal lifecycle transition
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidPhase { from: Phase, to: Phase },

    /// A schema migration failed; the pre-migration file was restored
    #[error("migration failed: {0}")]
    Migration(String),

    /// TAP device create/delete/configure failure
    #[error("tap device error: {0}")]
    Tap(String),

    /// Firewall table operation failure (other than missing permissions,
    /// which reconcile swallows)
    #[error("firewall error: {0}")]
    Firewall(String),

    /// Hypervisor process management failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Guest communication errors
    #[error("guest error: {0}")]
    Guest(String),

    /// The guest ran the request but reported a non-empty error
    #[error("remote exec failed: {0}")]
    RemoteExec(String),

    /// The guest refused a port-forward request
    #[error("port forward rejected: {0}")]
    PortForwardRejected(String),

    /// Relational store errors (the busy/locked class is retried before
    /// surfacing here)
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Protocol wire-format errors
    #[error("protocol error: {0}")]
    Protocol(#[from] matchlock_protocol::ProtocolError),
}
