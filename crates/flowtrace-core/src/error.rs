//! Error types for multipath traceroute operations.

use crate::result::TracerouteResult;
use std::net::IpAddr;
use thiserror::Error;

/// Classification of a raw-socket send failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// The host refused the raw send (missing CAP_NET_RAW or equivalent).
    PermissionDenied,
    /// No route to the destination.
    HostUnreachable,
    /// Any other transport-level failure.
    Other,
}

impl std::fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendErrorKind::PermissionDenied => write!(f, "permission denied"),
            SendErrorKind::HostUnreachable => write!(f, "host unreachable"),
            SendErrorKind::Other => write!(f, "send failed"),
        }
    }
}

/// Errors raised while serializing a probe packet.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("probe of {size} bytes exceeds the {limit}-byte MTU heuristic")]
    Overflow { size: usize, limit: usize },

    #[error("{role} address {addr} is not IPv4")]
    InvalidAddress { role: &'static str, addr: IpAddr },
}

/// Main error type for traceroute operations.
#[derive(Error, Debug)]
pub enum TraceError {
    // Construction-time errors
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("raw socket or packet capture unavailable: {0}")]
    NoCapability(String),

    #[error("failed to resolve target {hostname}: {reason}")]
    AddressResolution { hostname: String, reason: String },

    // Socket/IO errors
    #[error("failed to create socket: {0}")]
    SocketCreation(#[source] std::io::Error),

    #[error("probe send failed ({kind}): {source}")]
    SendFailure {
        kind: SendErrorKind,
        #[source]
        source: std::io::Error,
    },

    #[error("read timeout exceeded")]
    ReadTimeout,

    /// The capture stream closed mid-run. The engine attaches the partial
    /// result before surfacing this to the caller.
    #[error("packet capture stream ended mid-run")]
    CaptureEnded {
        partial: Option<Box<TracerouteResult>>,
    },

    // Packet errors
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("failed to parse {layer} layer: {reason}")]
    PacketParseFailed { layer: &'static str, reason: String },

    #[error("packet did not match any outstanding probe")]
    PacketMismatch,

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl TraceError {
    /// Returns true if this error should not abort the receive loop.
    ///
    /// A promiscuous capture sees plenty of traffic that has nothing to do
    /// with our probes; mismatches and parse failures mean "keep reading",
    /// not "give up".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PacketMismatch
                | Self::MalformedPacket(_)
                | Self::PacketParseFailed { .. }
                | Self::PacketTooShort { .. }
        )
    }

    /// Classifies an I/O error from a raw-socket send.
    pub fn from_send_io(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => SendErrorKind::PermissionDenied,
            std::io::ErrorKind::HostUnreachable | std::io::ErrorKind::NetworkUnreachable => {
                SendErrorKind::HostUnreachable
            }
            _ => SendErrorKind::Other,
        };
        TraceError::SendFailure { kind, source: err }
    }
}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TraceError::ReadTimeout,
            std::io::ErrorKind::WouldBlock => TraceError::ReadTimeout,
            _ => TraceError::Internal(err.to_string()),
        }
    }
}

/// Result type alias for traceroute operations.
pub type TraceResult<T> = Result<T, TraceError>;
