//! Reply matching over a capture source.
//!
//! The sniffer is the exclusive reader of captured frames. Matching is
//! done in software on every frame: capture-level filters are never
//! trusted to be present or correct.

use crate::parser::{
    parse_ip_frame, Frame, IcmpFrame, TcpFrame, ICMP_DEST_UNREACHABLE, ICMP_ECHO_REPLY,
    ICMP_TIME_EXCEEDED,
};
use crate::source::{PacketFilterSpec, Source};
use flowtrace_core::TraceError;
use std::net::Ipv4Addr;
use std::time::Instant;
use tracing::trace;

/// Read buffer size; a full Ethernet frame fits with room to spare.
const CAPTURE_BUF_LEN: usize = 2048;

/// A reply accepted on behalf of a TCP probe.
#[derive(Debug, Clone)]
pub enum TargetReply {
    /// An ICMP error or echo reply matched by its quoted datagram.
    Icmp(IcmpFrame),
    /// A SYN-ACK or RST straight from the target.
    Tcp(TcpFrame),
}

/// Decides whether a captured ICMP frame belongs to this probe run.
///
/// For Time Exceeded and Destination Unreachable the quoted inner packet
/// must carry our (src, dst) pair; the outer source only names the
/// responding router and is never used as a correlation key. For an echo
/// reply the outer destination being our source address suffices.
fn icmp_matches(icmp: &IcmpFrame, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> bool {
    match icmp.icmp_type {
        ICMP_TIME_EXCEEDED | ICMP_DEST_UNREACHABLE => icmp
            .quoted
            .as_ref()
            .map_or(false, |q| q.src_ip == src_ip && q.dst_ip == dst_ip),
        ICMP_ECHO_REPLY => icmp.outer_dst == src_ip,
        _ => false,
    }
}

/// Demultiplexes captured frames into probe replies.
pub struct Sniffer {
    source: Box<dyn Source>,
    buf: Vec<u8>,
}

impl Sniffer {
    pub fn new(source: Box<dyn Source>) -> Self {
        Self {
            source,
            buf: vec![0u8; CAPTURE_BUF_LEN],
        }
    }

    /// Forwards a filter hint to the capture layer. Matching stays in
    /// software either way.
    pub fn set_packet_filter(&mut self, spec: PacketFilterSpec) -> Result<(), TraceError> {
        self.source.set_packet_filter(spec)
    }

    /// Reads frames until one decodes, or the deadline passes.
    async fn next_frame(&mut self, deadline: Instant) -> Result<Frame, TraceError> {
        loop {
            self.source.set_read_deadline(deadline)?;
            let n = self.source.read(&mut self.buf).await?;
            match parse_ip_frame(&self.buf[..n]) {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_retryable() => {
                    trace!(error = %e, "skipping undecodable frame");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the first ICMPv4 frame whose quoted datagram carries the
    /// given (src, dst) pair, or `ReadTimeout` once the deadline passes.
    pub async fn match_icmp_for(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        deadline: Instant,
    ) -> Result<IcmpFrame, TraceError> {
        loop {
            if let Frame::Icmp(icmp) = self.next_frame(deadline).await? {
                if icmp_matches(&icmp, src_ip, dst_ip) {
                    return Ok(icmp);
                }
                trace!(
                    responder = %icmp.responder,
                    icmp_type = icmp.icmp_type,
                    "ignoring ICMP frame for different traffic"
                );
            }
        }
    }

    /// Drains frames until `count` matches are collected or the deadline
    /// elapses; returns whatever matched so far.
    pub async fn collect_icmp_for(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        count: usize,
        deadline: Instant,
    ) -> Result<Vec<IcmpFrame>, TraceError> {
        let mut matched = Vec::with_capacity(count);
        while matched.len() < count {
            match self.match_icmp_for(src_ip, dst_ip, deadline).await {
                Ok(frame) => matched.push(frame),
                Err(TraceError::ReadTimeout) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(matched)
    }

    /// Like [`Sniffer::match_icmp_for`], but additionally accepts a
    /// SYN-ACK or RST sent by the target back to `src_port`.
    pub async fn match_target_reply(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        deadline: Instant,
    ) -> Result<TargetReply, TraceError> {
        loop {
            match self.next_frame(deadline).await? {
                Frame::Icmp(icmp) if icmp_matches(&icmp, src_ip, dst_ip) => {
                    return Ok(TargetReply::Icmp(icmp));
                }
                Frame::Tcp(tcp)
                    if tcp.src_ip == dst_ip
                        && tcp.dst_ip == src_ip
                        && tcp.src_port == dst_port
                        && tcp.dst_port == src_port
                        && (tcp.is_syn_ack || tcp.is_rst) =>
                {
                    return Ok(TargetReply::Tcp(tcp));
                }
                _ => continue,
            }
        }
    }

    /// Closes the underlying capture source.
    pub async fn close(&mut self) -> Result<(), TraceError> {
        self.source.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        echo_reply_frame, icmp_error_frame, tcp_reply_frame, udp_quote, MockSource,
    };
    use std::time::Duration;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const DST: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
    const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn test_match_icmp_by_quoted_pair() {
        let source = MockSource::with_frames(vec![icmp_error_frame(
            ROUTER,
            SRC,
            ICMP_TIME_EXCEEDED,
            0,
            SRC,
            DST,
            3,
            udp_quote(33437, 33434),
        )]);
        let mut sniffer = Sniffer::new(Box::new(source));

        let icmp = sniffer.match_icmp_for(SRC, DST, deadline()).await.unwrap();
        assert_eq!(icmp.responder, ROUTER);
        assert_eq!(icmp.quoted.unwrap().ip_id, 3);
    }

    #[tokio::test]
    async fn test_foreign_quotes_are_skipped() {
        // First frame quotes someone else's traffic and must not match
        let other: Ipv4Addr = "172.16.0.99".parse().unwrap();
        let source = MockSource::with_frames(vec![
            icmp_error_frame(
                ROUTER,
                SRC,
                ICMP_TIME_EXCEEDED,
                0,
                other,
                DST,
                1,
                udp_quote(40000, 33434),
            ),
            icmp_error_frame(
                ROUTER,
                SRC,
                ICMP_TIME_EXCEEDED,
                0,
                SRC,
                DST,
                1,
                udp_quote(33434, 33434),
            ),
        ]);
        let mut sniffer = Sniffer::new(Box::new(source));

        let icmp = sniffer.match_icmp_for(SRC, DST, deadline()).await.unwrap();
        assert_eq!(icmp.quoted.unwrap().src_ip, SRC);
    }

    #[tokio::test]
    async fn test_echo_reply_matches_on_outer_destination() {
        let source = MockSource::with_frames(vec![echo_reply_frame(DST, SRC)]);
        let mut sniffer = Sniffer::new(Box::new(source));

        let icmp = sniffer.match_icmp_for(SRC, DST, deadline()).await.unwrap();
        assert_eq!(icmp.icmp_type, ICMP_ECHO_REPLY);
        assert_eq!(icmp.responder, DST);
        assert!(icmp.quoted.is_none());
    }

    #[tokio::test]
    async fn test_match_times_out_when_nothing_arrives() {
        let mut sniffer = Sniffer::new(Box::new(MockSource::with_frames(vec![])));
        let result = sniffer.match_icmp_for(SRC, DST, deadline()).await;
        assert!(matches!(result, Err(TraceError::ReadTimeout)));
    }

    #[tokio::test]
    async fn test_collect_returns_partial_on_timeout() {
        let source = MockSource::with_frames(vec![
            icmp_error_frame(
                ROUTER,
                SRC,
                ICMP_TIME_EXCEEDED,
                0,
                SRC,
                DST,
                1,
                udp_quote(33434, 33434),
            ),
            icmp_error_frame(
                Ipv4Addr::new(10, 0, 0, 2),
                SRC,
                ICMP_TIME_EXCEEDED,
                0,
                SRC,
                DST,
                2,
                udp_quote(33435, 33434),
            ),
        ]);
        let mut sniffer = Sniffer::new(Box::new(source));

        let matched = sniffer
            .collect_icmp_for(SRC, DST, 5, deadline())
            .await
            .unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].responder, ROUTER);
    }

    #[tokio::test]
    async fn test_collect_stops_at_count() {
        let frames = (0..4)
            .map(|i| {
                icmp_error_frame(
                    ROUTER,
                    SRC,
                    ICMP_TIME_EXCEEDED,
                    0,
                    SRC,
                    DST,
                    i,
                    udp_quote(33434 + i, 33434),
                )
            })
            .collect();
        let mut sniffer = Sniffer::new(Box::new(MockSource::with_frames(frames)));

        let matched = sniffer
            .collect_icmp_for(SRC, DST, 3, deadline())
            .await
            .unwrap();
        assert_eq!(matched.len(), 3);
    }

    #[tokio::test]
    async fn test_target_reply_accepts_syn_ack() {
        let source = MockSource::with_frames(vec![tcp_reply_frame(DST, SRC, 443, 33434, true, false)]);
        let mut sniffer = Sniffer::new(Box::new(source));

        let reply = sniffer
            .match_target_reply(SRC, DST, 33434, 443, deadline())
            .await
            .unwrap();
        match reply {
            TargetReply::Tcp(tcp) => assert!(tcp.is_syn_ack),
            other => panic!("expected TCP reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_target_reply_ignores_unrelated_tcp() {
        // Wrong destination port pair, then a valid RST
        let source = MockSource::with_frames(vec![
            tcp_reply_frame(DST, SRC, 443, 40000, true, false),
            tcp_reply_frame(DST, SRC, 443, 33434, false, true),
        ]);
        let mut sniffer = Sniffer::new(Box::new(source));

        let reply = sniffer
            .match_target_reply(SRC, DST, 33434, 443, deadline())
            .await
            .unwrap();
        match reply {
            TargetReply::Tcp(tcp) => assert!(tcp.is_rst),
            other => panic!("expected RST, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capture_ended_propagates() {
        let mut sniffer = Sniffer::new(Box::new(MockSource::ended()));
        let result = sniffer.match_icmp_for(SRC, DST, deadline()).await;
        assert!(matches!(result, Err(TraceError::CaptureEnded { .. })));
    }
}
