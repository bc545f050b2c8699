//! TCP SYN traceroute driver.

use crate::packet::build_tcp_syn_probe;
use async_trait::async_trait;
use flowtrace_core::{ProbeDriver, ProbeDriverInfo, ProbeReply, Protocol, TraceError};
use flowtrace_packets::{
    parse_tcp_first_bytes, IcmpFrame, RawSender, Sniffer, Source, TargetReply, FilterType,
    PacketFilterSpec, IPPROTO_TCP,
};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Instant;
use tracing::{trace, warn};

/// The probe currently in flight.
#[derive(Debug, Clone, Copy)]
struct Outstanding {
    flow: u16,
    src_port: u16,
    seq: u32,
}

/// TCP SYN multipath traceroute driver.
pub struct TcpDriver {
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

impl TcpDriver {
    /// Creates a TCP driver over the given capture source and raw sender.
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
        // TCP replies from the target arrive as plain segments, so the
        // filter hint has to admit more than ICMP.
        if let Err(e) = sniffer.set_packet_filter(PacketFilterSpec {
            filter_type: FilterType::Tcp,
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

    /// Correlates a quoted ICMP error back to the outstanding SYN.
    fn correlate_icmp(&self, outstanding: Outstanding, icmp: &IcmpFrame) -> Option<ProbeReply> {
        let quoted = icmp.quoted.as_ref()?;
        if quoted.protocol != IPPROTO_TCP {
            return None;
        }

        let tcp = parse_tcp_first_bytes(&quoted.transport).ok()?;
        if tcp.dst_port != self.dst_port || tcp.src_port != outstanding.src_port {
            trace!(
                src_port = tcp.src_port,
                awaited = outstanding.src_port,
                "dropping reply for a different probe"
            );
            return None;
        }
        // The quoted sequence number must belong to this SYN, not a
        // previous round on the same port.
        if tcp.seq != outstanding.seq {
            return None;
        }

        let flow = tcp.src_port.checked_sub(self.base_src_port)?;
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
impl ProbeDriver for TcpDriver {
    fn driver_info(&self) -> ProbeDriverInfo {
        ProbeDriverInfo {
            protocol: Protocol::Tcp,
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
        let seq = rand::thread_rng().gen::<u32>();
        let packet = build_tcp_syn_probe(
            IpAddr::V4(self.src_ip),
            IpAddr::V4(self.target_ip),
            src_port,
            self.dst_port,
            flow,
            ttl,
            seq,
        )?;

        trace!(ttl = ttl, flow = flow, src_port = src_port, seq = seq, "sending TCP SYN probe");

        self.sender
            .send(&packet, SocketAddrV4::new(self.target_ip, self.dst_port))
            .await?;

        self.outstanding = Some(Outstanding {
            flow,
            src_port,
            seq,
        });
        Ok(())
    }

    async fn receive_matching(&mut self, deadline: Instant) -> Result<ProbeReply, TraceError> {
        let outstanding = self
            .outstanding
            .ok_or_else(|| TraceError::Internal("no probe outstanding".to_string()))?;

        loop {
            let reply = self
                .sniffer
                .match_target_reply(
                    self.src_ip,
                    self.target_ip,
                    outstanding.src_port,
                    self.dst_port,
                    deadline,
                )
                .await?;

            match reply {
                TargetReply::Icmp(icmp) => {
                    if let Some(reply) = self.correlate_icmp(outstanding, &icmp) {
                        return Ok(reply);
                    }
                }
                TargetReply::Tcp(tcp) => {
                    // SYN-ACK or RST straight from the target; the port
                    // pair was already verified against the outstanding
                    // probe.
                    let flow = match tcp.dst_port.checked_sub(self.base_src_port) {
                        Some(flow) if flow < self.num_paths => flow,
                        _ => continue,
                    };
                    return Ok(ProbeReply {
                        flow,
                        responder: IpAddr::V4(tcp.src_ip),
                        icmp_type: None,
                        icmp_code: None,
                        is_dest: true,
                    });
                }
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
