//! Core traits implemented by the protocol drivers.

use crate::types::Protocol;
use crate::TraceError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Instant;

/// Metadata about a probe driver implementation.
#[derive(Debug, Clone, Copy)]
pub struct ProbeDriverInfo {
    /// Protocol the driver emits.
    pub protocol: Protocol,
}

/// A reply correlated to the most recently sent probe.
#[derive(Debug, Clone)]
pub struct ProbeReply {
    /// Flow index recovered from the quoted transport source port.
    pub flow: u16,
    /// Address of the responding router (outer frame source).
    pub responder: IpAddr,
    /// ICMP type, absent for a TCP SYN-ACK/RST arrival.
    pub icmp_type: Option<u8>,
    /// ICMP code, absent for a TCP SYN-ACK/RST arrival.
    pub icmp_code: Option<u8>,
    /// Whether the reply came from the target itself.
    pub is_dest: bool,
}

/// Core trait for probe drivers (UDP, TCP SYN).
///
/// A driver owns a raw sender and a sniffer, builds one probe per
/// `send_probe` call, and matches replies by the quoted inner 4-tuple.
/// The engine serializes calls: one probe is outstanding at a time, and
/// `receive_matching` refers to the probe from the latest `send_probe`.
#[async_trait]
pub trait ProbeDriver: Send {
    /// Returns metadata about this driver.
    fn driver_info(&self) -> ProbeDriverInfo;

    /// Builds and transmits a probe with the given TTL and flow index.
    async fn send_probe(&mut self, ttl: u8, flow: u16) -> Result<(), TraceError>;

    /// Waits for a reply matching the outstanding probe.
    ///
    /// Returns `Err(ReadTimeout)` once the deadline passes. Frames that
    /// match some other traffic are consumed and skipped internally.
    async fn receive_matching(&mut self, deadline: Instant) -> Result<ProbeReply, TraceError>;

    /// Closes the driver, releasing capture and socket handles. Idempotent.
    async fn close(&mut self) -> Result<(), TraceError>;
}

/// Reverse DNS hook consulted by the engine on round 0.
///
/// Name resolution lives with the embedding application; the engine only
/// needs something that can turn a responder address into a name.
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    /// Returns the PTR name for `ip`, or `None` if there is none.
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String>;
}
