//! Packet I/O for flowtrace.
//!
//! Provides the raw sender and capture abstractions, the frame parser for
//! ICMPv4 replies with their quoted inner datagrams, and the [`Sniffer`]
//! matching primitives the probe drivers are built on.

pub mod parser;
pub mod platform;
pub mod sink;
pub mod sniffer;
pub mod source;
pub mod testutil;

pub use parser::{
    parse_ip_frame, parse_tcp_first_bytes, parse_udp_first_bytes, Frame, IcmpFrame, QuotedPacket,
    TcpFrame, TcpInfo, UdpInfo, ICMP_DEST_UNREACHABLE, ICMP_ECHO_REPLY, ICMP_TIME_EXCEEDED,
    IPPROTO_TCP, IPPROTO_UDP,
};
pub use sink::RawSender;
pub use sniffer::{Sniffer, TargetReply};
pub use source::{FilterType, PacketFilterSpec, Source};

use flowtrace_core::TraceError;
use std::net::Ipv4Addr;

/// Capture source plus raw sender, acquired together so that a partial
/// construction failure releases whatever was already open.
pub struct SourceSinkHandle {
    /// Packet capture source.
    pub source: Box<dyn Source>,
    /// Raw packet sender.
    pub sink: Box<dyn RawSender>,
}

/// Creates a source and sender appropriate for the current platform.
pub async fn new_source_sink(target_addr: Ipv4Addr) -> Result<SourceSinkHandle, TraceError> {
    platform::new_source_sink(target_addr).await
}
