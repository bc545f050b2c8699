//! Frame parsing using etherparse.
//!
//! Captured frames are decoded from the IP layer up. ICMP errors carry
//! the original IP header plus at least eight transport bytes; those
//! quoted bytes are the correlation key for the whole system, so they are
//! extracted here by explicit slicing rather than trusting a full
//! transport decode of a truncated datagram.

use etherparse::{Icmpv4Type, Ipv4Header, NetHeaders, PacketHeaders, TransportHeader};
use flowtrace_core::TraceError;
use std::net::Ipv4Addr;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

/// UDP header fields recovered from the quoted transport bytes.
#[derive(Debug, Clone, Copy)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

/// TCP header fields recoverable from eight quoted bytes.
#[derive(Debug, Clone, Copy)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
}

/// Parses the first 8 bytes of a UDP header from an ICMP quote.
pub fn parse_udp_first_bytes(buf: &[u8]) -> Result<UdpInfo, TraceError> {
    if buf.len() < 8 {
        return Err(TraceError::PacketTooShort {
            expected: 8,
            actual: buf.len(),
        });
    }

    Ok(UdpInfo {
        src_port: u16::from_be_bytes([buf[0], buf[1]]),
        dst_port: u16::from_be_bytes([buf[2], buf[3]]),
        length: u16::from_be_bytes([buf[4], buf[5]]),
        checksum: u16::from_be_bytes([buf[6], buf[7]]),
    })
}

/// Parses the first 8 bytes of a TCP header from an ICMP quote.
pub fn parse_tcp_first_bytes(buf: &[u8]) -> Result<TcpInfo, TraceError> {
    if buf.len() < 8 {
        return Err(TraceError::PacketTooShort {
            expected: 8,
            actual: buf.len(),
        });
    }

    Ok(TcpInfo {
        src_port: u16::from_be_bytes([buf[0], buf[1]]),
        dst_port: u16::from_be_bytes([buf[2], buf[3]]),
        seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
    })
}

/// The original datagram quoted inside an ICMP error message.
#[derive(Debug, Clone)]
pub struct QuotedPacket {
    /// Source of the probe that triggered the error.
    pub src_ip: Ipv4Addr,
    /// Destination of the triggering probe.
    pub dst_ip: Ipv4Addr,
    /// IP protocol of the triggering probe.
    pub protocol: u8,
    /// Identification field, echoed back unchanged.
    pub ip_id: u16,
    /// Quoted transport bytes following the inner IP header.
    pub transport: Vec<u8>,
}

/// A decoded ICMPv4 frame of interest.
#[derive(Debug, Clone)]
pub struct IcmpFrame {
    /// Outer source: the router that generated the message.
    pub responder: Ipv4Addr,
    /// Outer destination.
    pub outer_dst: Ipv4Addr,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Present for Time Exceeded and Destination Unreachable.
    pub quoted: Option<QuotedPacket>,
}

/// A decoded TCP frame, kept for SYN-ACK/RST arrival detection.
#[derive(Debug, Clone, Copy)]
pub struct TcpFrame {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub is_syn_ack: bool,
    pub is_rst: bool,
}

/// Classification of a captured frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Icmp(IcmpFrame),
    Tcp(TcpFrame),
    /// IPv6, unrelated protocols, or ICMP types nobody asked about.
    Other,
}

/// Decodes a frame starting at the IP layer.
pub fn parse_ip_frame(data: &[u8]) -> Result<Frame, TraceError> {
    let headers =
        PacketHeaders::from_ip_slice(data).map_err(|e| TraceError::PacketParseFailed {
            layer: "ip",
            reason: e.to_string(),
        })?;

    let (src_ip, dst_ip) = match &headers.net {
        Some(NetHeaders::Ipv4(ipv4, _)) => {
            (Ipv4Addr::from(ipv4.source), Ipv4Addr::from(ipv4.destination))
        }
        _ => return Ok(Frame::Other),
    };

    match headers.transport {
        Some(TransportHeader::Icmpv4(icmp)) => {
            let (icmp_type, icmp_code) = match icmp.icmp_type {
                Icmpv4Type::TimeExceeded(code) => (ICMP_TIME_EXCEEDED, code.code_u8()),
                Icmpv4Type::DestinationUnreachable(ref header) => {
                    (ICMP_DEST_UNREACHABLE, header.code_u8())
                }
                Icmpv4Type::EchoReply(_) => (ICMP_ECHO_REPLY, 0),
                _ => return Ok(Frame::Other),
            };

            let quoted = if icmp_type == ICMP_ECHO_REPLY {
                None
            } else {
                parse_quoted_packet(headers.payload.slice())
            };

            Ok(Frame::Icmp(IcmpFrame {
                responder: src_ip,
                outer_dst: dst_ip,
                icmp_type,
                icmp_code,
                quoted,
            }))
        }
        Some(TransportHeader::Tcp(tcp)) => Ok(Frame::Tcp(TcpFrame {
            src_ip,
            dst_ip,
            src_port: tcp.source_port,
            dst_port: tcp.destination_port,
            is_syn_ack: tcp.syn && tcp.ack,
            is_rst: tcp.rst,
        })),
        _ => Ok(Frame::Other),
    }
}

/// Extracts the quoted original datagram from an ICMP error payload.
///
/// Routers quote the full inner IP header and at least eight bytes of the
/// transport header. The transport slice is taken verbatim; a quote
/// shorter than eight bytes yields an empty correlation key and the frame
/// will simply never match a probe.
fn parse_quoted_packet(payload: &[u8]) -> Option<QuotedPacket> {
    let (inner, rest) = Ipv4Header::from_slice(payload).ok()?;
    let transport = rest.get(..8).unwrap_or(rest).to_vec();

    Some(QuotedPacket {
        src_ip: Ipv4Addr::from(inner.source),
        dst_ip: Ipv4Addr::from(inner.destination),
        protocol: inner.protocol.into(),
        ip_id: inner.identification,
        transport,
    })
}
