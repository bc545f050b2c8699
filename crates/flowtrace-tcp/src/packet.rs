//! TCP SYN probe construction using pnet.

use flowtrace_core::{BuildError, TraceError};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{Ipv4Flags, MutableIpv4Packet};
use pnet_packet::tcp::{MutableTcpPacket, TcpFlags};
use std::net::{IpAddr, Ipv4Addr};

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;

/// Advertised receive window. Probes never complete a handshake, so the
/// value only needs to look like an ordinary opening SYN.
const TCP_WINDOW: u16 = 65535;

/// Builds a complete IPv4+TCP SYN probe ready for a header-included raw
/// socket.
///
/// `seq` is chosen per probe and echoed in the quoted header, giving a
/// second correlation signal next to the source port.
pub fn build_tcp_syn_probe(
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    ip_id: u16,
    ttl: u8,
    seq: u32,
) -> Result<Vec<u8>, TraceError> {
    let (src, dst) = require_ipv4(src_ip, dst_ip)?;

    let total_len = IPV4_HEADER_LEN + TCP_HEADER_LEN;
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
    ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
    ip_packet.set_source(src);
    ip_packet.set_destination(dst);

    let ip_checksum = pnet_packet::ipv4::checksum(&ip_packet.to_immutable());
    ip_packet.set_checksum(ip_checksum);

    {
        let mut tcp_packet = MutableTcpPacket::new(&mut buffer[IPV4_HEADER_LEN..])
            .ok_or_else(|| TraceError::Internal("failed to create TCP packet".to_string()))?;
        tcp_packet.set_source(src_port);
        tcp_packet.set_destination(dst_port);
        tcp_packet.set_sequence(seq);
        tcp_packet.set_acknowledgement(0);
        tcp_packet.set_data_offset(5);
        tcp_packet.set_flags(TcpFlags::SYN);
        tcp_packet.set_window(TCP_WINDOW);
        tcp_packet.set_urgent_ptr(0);

        let tcp_checksum =
            pnet_packet::tcp::ipv4_checksum(&tcp_packet.to_immutable(), &src, &dst);
        tcp_packet.set_checksum(tcp_checksum);
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

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const DST: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    fn internet_checksum(data: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        let mut chunks = data.chunks_exact(2);
        for chunk in &mut chunks {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        if let [odd] = chunks.remainder() {
            sum += u32::from(*odd) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    #[test]
    fn test_build_syn_probe_layout() {
        let packet = build_tcp_syn_probe(
            IpAddr::V4(SRC),
            IpAddr::V4(DST),
            33435,
            443,
            1,
            9,
            0xDEADBEEF,
        )
        .unwrap();

        assert_eq!(packet.len(), 40);
        assert_eq!(packet[0], 0x45);
        assert_eq!(packet[8], 9);
        assert_eq!(packet[9], 6);
        assert_eq!(packet[6] & 0x40, 0x40);

        assert_eq!(u16::from_be_bytes([packet[20], packet[21]]), 33435);
        assert_eq!(u16::from_be_bytes([packet[22], packet[23]]), 443);
        assert_eq!(
            u32::from_be_bytes([packet[24], packet[25], packet[26], packet[27]]),
            0xDEADBEEF
        );
        // SYN alone, data offset 5
        assert_eq!(packet[33] & 0x3F, 0x02);
        assert_eq!(packet[32] >> 4, 5);
        assert_eq!(u16::from_be_bytes([packet[34], packet[35]]), 65535);
    }

    #[test]
    fn test_checksums_validate() {
        let packet = build_tcp_syn_probe(
            IpAddr::V4(SRC),
            IpAddr::V4(DST),
            33434,
            80,
            0,
            1,
            12345,
        )
        .unwrap();

        assert_eq!(internet_checksum(&packet[..20]), 0);

        // TCP pseudo-header: src, dst, zero, protocol, segment length
        let tcp = &packet[20..];
        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&packet[12..20]);
        pseudo.push(0);
        pseudo.push(6);
        pseudo.extend_from_slice(&(tcp.len() as u16).to_be_bytes());
        pseudo.extend_from_slice(tcp);
        assert_eq!(internet_checksum(&pseudo), 0);
    }

    #[test]
    fn test_non_ipv4_rejected() {
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(build_tcp_syn_probe(v6, IpAddr::V4(DST), 33434, 80, 0, 1, 0).is_err());
        assert!(build_tcp_syn_probe(IpAddr::V4(SRC), v6, 33434, 80, 0, 1, 0).is_err());
    }
}
