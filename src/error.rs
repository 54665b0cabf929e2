//! Error taxonomy for the benchmark harness.
//!
//! Errors are split by blast radius. [`BenchError`] is fatal to whoever
//! returns it (the whole run for the coordinator, a single worker for a
//! worker task). [`RegistrationError`] is answered to the offending worker and
//! never affects the run. [`SessionError`] is local to one data-plane session
//! and is turned into a [`FailureKind`] on the affected pair's result record.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Fatal errors for a coordinator run or a single worker.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("registry did not reach {expected} workers within {timeout:?} ({registered} registered, {attached} subscribed)")]
    RegistrationTimeout {
        expected: usize,
        registered: usize,
        attached: usize,
        timeout: Duration,
    },

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("control channel lost: {0}")]
    ControlChannelLost(String),

    #[error("protocol desync: expected case {expected:?}, got {received} in {message}")]
    ProtocolDesync {
        expected: Option<u64>,
        received: u64,
        message: &'static str,
    },

    #[error("invalid worker state transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to write results: {0}")]
    Output(String),

    #[error("control frame codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reasons the registry refuses a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("worker id {0} is already registered with a different identity")]
    DuplicateRegistration(String),

    #[error("registration is closed")]
    RegistrationClosed,

    #[error("all {capacity} {role} slots are taken")]
    RoleFull { role: String, capacity: usize },
}

/// Failures of one data-plane session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind data port {port}: {source}")]
    SocketBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr} within {timeout:?}: {detail}")]
    Connect {
        addr: String,
        timeout: Duration,
        detail: String,
    },

    #[error("only {connected} of {expected} peers connected within {timeout:?}")]
    PeersMissing {
        connected: usize,
        expected: usize,
        timeout: Duration,
    },

    #[error("data frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("every peer connection was lost")]
    PeersLost,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// The failure kind recorded for this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::SocketBind { .. } => FailureKind::SocketBindError,
            SessionError::Connect { .. } | SessionError::PeersMissing { .. } => {
                FailureKind::ConnectError
            }
            _ => FailureKind::SessionError,
        }
    }
}

/// Why a pair's result record for a case is marked failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// A worker missed the ready or completion deadline.
    CaseTimeout,
    /// A worker could not open its data-plane socket.
    SocketBindError,
    /// A worker could not reach its data-plane peers.
    ConnectError,
    /// The data-plane session failed after it started.
    SessionError,
    /// A worker saw a case index it did not expect and terminated.
    ProtocolDesync,
    /// The worker's control connection went away.
    Disconnected,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::CaseTimeout => "CaseTimeout",
            FailureKind::SocketBindError => "SocketBindError",
            FailureKind::ConnectError => "ConnectError",
            FailureKind::SessionError => "SessionError",
            FailureKind::ProtocolDesync => "ProtocolDesync",
            FailureKind::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CaseTimeout" => Ok(FailureKind::CaseTimeout),
            "SocketBindError" => Ok(FailureKind::SocketBindError),
            "ConnectError" => Ok(FailureKind::ConnectError),
            "SessionError" => Ok(FailureKind::SessionError),
            "ProtocolDesync" => Ok(FailureKind::ProtocolDesync),
            "Disconnected" => Ok(FailureKind::Disconnected),
            other => Err(format!("unknown failure kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_kinds() {
        let bind = SessionError::SocketBind {
            port: 6000,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(bind.kind(), FailureKind::SocketBindError);

        let connect = SessionError::Connect {
            addr: "127.0.0.1:6000".to_string(),
            timeout: Duration::from_secs(1),
            detail: "refused".to_string(),
        };
        assert_eq!(connect.kind(), FailureKind::ConnectError);
        assert_eq!(SessionError::PeersLost.kind(), FailureKind::SessionError);
    }

    #[test]
    fn test_failure_kind_text_round_trip() {
        for kind in [
            FailureKind::CaseTimeout,
            FailureKind::SocketBindError,
            FailureKind::ConnectError,
            FailureKind::SessionError,
            FailureKind::ProtocolDesync,
            FailureKind::Disconnected,
        ] {
            assert_eq!(kind.to_string().parse::<FailureKind>().unwrap(), kind);
        }
        assert!("Bogus".parse::<FailureKind>().is_err());
    }
}
