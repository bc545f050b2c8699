//! UDP probe construction using pnet.

use flowtrace_core::{BuildError, TraceError};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{Ipv4Flags, MutableIpv4Packet};
use pnet_packet::udp::MutableUdpPacket;
use std::net::{IpAddr, Ipv4Addr};

/// Sentinel payload carried by every UDP probe. Routers quote at least
/// 64 bits of the transport payload in their ICMP errors, so these bytes
/// come back and help confirm a match.
pub const PROBE_PAYLOAD: [u8; 8] = [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE];

const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const MTU_LIMIT: usize = 1500;

/// Builds a complete IPv4+UDP probe ready for a header-included raw
/// socket.
///
/// The IP identification is set to `ip_id` and stays stable for the
/// probe's lifetime so the responder echoes it back. DF is set: a
/// fragmented probe would hash differently per fragment.
pub fn build_udp_probe(
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    ip_id: u16,
    ttl: u8,
    payload: &[u8],
) -> Result<Vec<u8>, TraceError> {
    let (src, dst) = require_ipv4(src_ip, dst_ip)?;

    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    if total_len > MTU_LIMIT {
        return Err(BuildError::Overflow {
            size: total_len,
            limit: MTU_LIMIT,
        }
        .into());
    }

    let mut buffer = vec![0u8; total_len];

    let mut ip_packet = MutableIpv4Packet::new(&mut buffer)
        .ok_or_else(|| TraceError::Internal("failed to create IP packet".to_string()))?;
    ip_packet.set_version(4);
    ip_packet.set_header_length(5);
    ip_packet.set_total_length(total_len as u16);
    ip_packet.set_identification(ip_id);
    ip_packet.set_flags(Ipv4Flags::DontFragment);
    ip_packet.set_fragment_offset(0);
    ip_packet.set_ttl(ttl);
    ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ip_packet.set_source(src);
    ip_packet.set_destination(dst);

    let ip_checksum = pnet_packet::ipv4::checksum(&ip_packet.to_immutable());
    ip_packet.set_checksum(ip_checksum);

    {
        let mut udp_packet = MutableUdpPacket::new(&mut buffer[IPV4_HEADER_LEN..])
            .ok_or_else(|| TraceError::Internal("failed to create UDP packet".to_string()))?;
        udp_packet.set_source(src_port);
        udp_packet.set_destination(dst_port);
        udp_packet.set_length(udp_len as u16);
        udp_packet.set_payload(payload);

        // Pseudo-header checksum over src, dst, protocol, and length
        let udp_checksum = pnet_packet::udp::ipv4_checksum(&udp_packet.to_immutable(), &src, &dst);
        udp_packet.set_checksum(udp_checksum);
    }

    Ok(buffer)
}

fn require_ipv4(src: IpAddr, dst: IpAddr) -> Result<(Ipv4Addr, Ipv4Addr), TraceError> {
    let src = match src {
        IpAddr::V4(ip) => ip,
        other => {
            return Err(BuildError::InvalidAddress {
                role: "source",
                addr: other,
            }
            .into())
        }
    };
    let dst = match dst {
        IpAddr::V4(ip) => ip,
        other => {
            return Err(BuildError::InvalidAddress {
                role: "destination",
                addr: other,
            }
            .into())
        }
    };
    Ok((src, dst))
}
