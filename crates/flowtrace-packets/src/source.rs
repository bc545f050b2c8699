//! Packet capture source trait.

use async_trait::async_trait;
use flowtrace_core::TraceError;
use std::time::Instant;

/// Filter class for packet capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// ICMPv4 messages.
    Icmp,
    /// TCP segments (SYN-ACK/RST arrival detection).
    Tcp,
}

/// Specification for a capture-level packet filter.
///
/// Capture-level filters are an optimization only. They have been
/// unreliable on some capture stacks, so every frame is re-checked in
/// userspace regardless of what the filter admits.
#[derive(Debug, Clone, Copy)]
pub struct PacketFilterSpec {
    pub filter_type: FilterType,
}

/// Trait for packet capture sources.
#[async_trait]
pub trait Source: Send {
    /// Sets the read deadline for subsequent read operations.
    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TraceError>;

    /// Reads one captured packet (starting at the IP layer) into `buf`.
    /// Returns the number of bytes read, `ReadTimeout` once the deadline
    /// passes, or `CaptureEnded` if the stream closed underneath us.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TraceError>;

    /// Closes the source. Idempotent.
    async fn close(&mut self) -> Result<(), TraceError>;

    /// Installs a capture-level filter. Best effort; implementations may
    /// ignore it.
    fn set_packet_filter(&mut self, spec: PacketFilterSpec) -> Result<(), TraceError>;
}
