//! UDP traceroute driver.

use crate::packet::{build_udp_probe, PROBE_PAYLOAD};
use async_trait::async_trait;
use flowtrace_core::{ProbeDriver, ProbeDriverInfo, ProbeReply, Protocol, TraceError};
use flowtrace_packets::{
    parse_udp_first_bytes, IcmpFrame, RawSender, Sniffer, Source, FilterType, PacketFilterSpec,
    ICMP_ECHO_REPLY, IPPROTO_UDP,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Instant;
use tracing::{trace, warn};

/// The probe currently in flight.
#[derive(Debug, Clone, Copy)]
struct Outstanding {
    flow: u16,
    src_port: u16,
}

/// UDP multipath traceroute driver.
pub struct UdpDriver {
    src_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
    base_src_port: u16,
    dst_port: u16,
    num_paths: u16,
    sniffer: Sniffer,
    sender: Box<dyn RawSender>,
    outstanding: Option<Outstanding>,
    closed: bool,
}

impl UdpDriver {
    /// Creates a UDP driver over the given capture source and raw sender.
    pub fn new(
        src_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        base_src_port: u16,
        dst_port: u16,
        num_paths: u16,
        source: Box<dyn Source>,
        sender: Box<dyn RawSender>,
    ) -> Self {
        let mut sniffer = Sniffer::new(source);
        // Best-effort hint; matching below never relies on it.
        if let Err(e) = sniffer.set_packet_filter(PacketFilterSpec {
            filter_type: FilterType::Icmp,
        }) {
            warn!(error = %e, "capture filter rejected, relying on software matching");
        }

        Self {
            src_ip,
            target_ip,
            base_src_port,
            dst_port,
            num_paths,
            sniffer,
            sender,
            outstanding: None,
            closed: false,
        }
    }

    /// Correlates a matched ICMP frame back to the outstanding probe.
    ///
    /// The sniffer already checked the quoted src/dst addresses; what is
    /// left is the transport half of the quoted 4-tuple. The source port
    /// recovers the flow index.
    fn correlate(&self, outstanding: Outstanding, icmp: &IcmpFrame) -> Option<ProbeReply> {
        if icmp.icmp_type == ICMP_ECHO_REPLY {
            // No quote to inspect; the outer destination matched us.
            return Some(ProbeReply {
                flow: outstanding.flow,
                responder: IpAddr::V4(icmp.responder),
                icmp_type: Some(icmp.icmp_type),
                icmp_code: Some(icmp.icmp_code),
                is_dest: icmp.responder == self.target_ip,
            });
        }

        let quoted = icmp.quoted.as_ref()?;
        if quoted.protocol != IPPROTO_UDP {
            return None;
        }

        let udp = parse_udp_first_bytes(&quoted.transport).ok()?;
        if udp.dst_port != self.dst_port {
            return None;
        }
        if udp.src_port != outstanding.src_port {
            // A late reply to an earlier probe; the serial model drops it.
            trace!(
                src_port = udp.src_port,
                awaited = outstanding.src_port,
                "dropping reply for a different probe"
            );
            return None;
        }

        let flow = udp.src_port.checked_sub(self.base_src_port)?;
        if flow >= self.num_paths {
            return None;
        }

        Some(ProbeReply {
            flow,
            responder: IpAddr::V4(icmp.responder),
            icmp_type: Some(icmp.icmp_type),
            icmp_code: Some(icmp.icmp_code),
            is_dest: icmp.responder == self.target_ip,
        })
    }
}

#[async_trait]
impl ProbeDriver for UdpDriver {
    fn driver_info(&self) -> ProbeDriverInfo {
        ProbeDriverInfo {
            protocol: Protocol::Udp,
        }
    }

    async fn send_probe(&mut self, ttl: u8, flow: u16) -> Result<(), TraceError> {
        if flow >= self.num_paths {
            return Err(TraceError::Internal(format!(
                "flow {} outside the configured {} paths",
                flow, self.num_paths
            )));
        }

        let src_port = self.base_src_port + flow;
        let packet = build_udp_probe(
            IpAddr::V4(self.src_ip),
            IpAddr::V4(self.target_ip),
            src_port,
            self.dst_port,
            flow,
            ttl,
            &PROBE_PAYLOAD,
        )?;

        trace!(ttl = ttl, flow = flow, src_port = src_port, "sending UDP probe");

        self.sender
            .send(&packet, SocketAddrV4::new(self.target_ip, self.dst_port))
            .await?;

        self.outstanding = Some(Outstanding { flow, src_port });
        Ok(())
    }

    async fn receive_matching(&mut self, deadline: Instant) -> Result<ProbeReply, TraceError> {
        let outstanding = self
            .outstanding
            .ok_or_else(|| TraceError::Internal("no probe outstanding".to_string()))?;

        loop {
            let icmp = self
                .sniffer
                .match_icmp_for(self.src_ip, self.target_ip, deadline)
                .await?;

            if let Some(reply) = self.correlate(outstanding, &icmp) {
                return Ok(reply);
            }
        }
    }

    async fn close(&mut self) -> Result<(), TraceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let sender_result = self.sender.close().await;
        let sniffer_result = self.sniffer.close().await;
        sender_result?;
        sniffer_result
    }
}
