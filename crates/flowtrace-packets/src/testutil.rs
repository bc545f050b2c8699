//! Synthetic frames and mock I/O endpoints for tests.
//!
//! Frames are assembled by hand at fixed byte offsets so tests exercise
//! the real wire layout rather than round-tripping through the encoder
//! being tested.

use crate::sink::RawSender;
use crate::source::{PacketFilterSpec, Source};
use async_trait::async_trait;
use flowtrace_core::TraceError;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A quoted transport header for an ICMP error frame.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub protocol: u8,
    pub bytes: [u8; 8],
}

/// Quoted UDP header: ports, length 16, zero checksum.
pub fn udp_quote(src_port: u16, dst_port: u16) -> Quote {
    let sp = src_port.to_be_bytes();
    let dp = dst_port.to_be_bytes();
    Quote {
        protocol: 17,
        bytes: [sp[0], sp[1], dp[0], dp[1], 0x00, 0x10, 0x00, 0x00],
    }
}

/// Quoted TCP header prefix: ports and sequence number.
pub fn tcp_quote(src_port: u16, dst_port: u16, seq: u32) -> Quote {
    let sp = src_port.to_be_bytes();
    let dp = dst_port.to_be_bytes();
    let sq = seq.to_be_bytes();
    Quote {
        protocol: 6,
        bytes: [sp[0], sp[1], dp[0], dp[1], sq[0], sq[1], sq[2], sq[3]],
    }
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, id: u16, total_len: u16) -> [u8; 20] {
    let mut h = [0u8; 20];
    h[0] = 0x45;
    h[2..4].copy_from_slice(&total_len.to_be_bytes());
    h[4..6].copy_from_slice(&id.to_be_bytes());
    h[8] = 64;
    h[9] = protocol;
    h[12..16].copy_from_slice(&src.octets());
    h[16..20].copy_from_slice(&dst.octets());
    h
}

/// An ICMP error (Time Exceeded or Destination Unreachable) quoting a
/// probe from `inner_src` to `inner_dst`.
#[allow(clippy::too_many_arguments)]
pub fn icmp_error_frame(
    router: Ipv4Addr,
    outer_dst: Ipv4Addr,
    icmp_type: u8,
    icmp_code: u8,
    inner_src: Ipv4Addr,
    inner_dst: Ipv4Addr,
    inner_id: u16,
    quote: Quote,
) -> Vec<u8> {
    // outer IP (20) + ICMP header (8) + inner IP (20) + 8 transport bytes
    let mut frame = Vec::with_capacity(56);
    frame.extend_from_slice(&ipv4_header(router, outer_dst, 1, 0x4242, 56));
    frame.extend_from_slice(&[icmp_type, icmp_code, 0, 0, 0, 0, 0, 0]);
    frame.extend_from_slice(&ipv4_header(inner_src, inner_dst, quote.protocol, inner_id, 28));
    frame.extend_from_slice(&quote.bytes);
    frame
}

/// An ICMP error wrapping an already-serialized probe prefix (inner IP
/// header plus however many transport bytes the "router" quotes).
pub fn icmp_error_wrapping(
    router: Ipv4Addr,
    outer_dst: Ipv4Addr,
    icmp_type: u8,
    icmp_code: u8,
    quoted: &[u8],
) -> Vec<u8> {
    let total = 20 + 8 + quoted.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&ipv4_header(router, outer_dst, 1, 0x4242, total as u16));
    frame.extend_from_slice(&[icmp_type, icmp_code, 0, 0, 0, 0, 0, 0]);
    frame.extend_from_slice(quoted);
    frame
}

/// An ICMP echo reply from `src` to `dst`.
pub fn echo_reply_frame(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(28);
    frame.extend_from_slice(&ipv4_header(src, dst, 1, 0x4243, 28));
    frame.extend_from_slice(&[0, 0, 0, 0, 0x12, 0x34, 0x00, 0x01]);
    frame
}

/// A bare TCP segment, as the target would answer a SYN probe.
pub fn tcp_reply_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    syn_ack: bool,
    rst: bool,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(40);
    frame.extend_from_slice(&ipv4_header(src, dst, 6, 0x4244, 40));

    let mut tcp = [0u8; 20];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[12] = 5 << 4;
    let mut flags = 0u8;
    if syn_ack {
        flags |= 0x12;
    }
    if rst {
        flags |= 0x04;
    }
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());
    frame.extend_from_slice(&tcp);
    frame
}

/// Capture source fed from a frame queue. An exhausted queue reads as a
/// timeout; an ended source reads as a closed capture stream.
pub struct MockSource {
    frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
    ended: bool,
}

impl MockSource {
    pub fn with_frames(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: Arc::new(Mutex::new(frames.into())),
            ended: false,
        }
    }

    /// A source plus a handle for feeding it frames after construction.
    pub fn shared() -> (Self, Arc<Mutex<VecDeque<Vec<u8>>>>) {
        let frames = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                frames: frames.clone(),
                ended: false,
            },
            frames,
        )
    }

    /// A source whose capture stream has already closed.
    pub fn ended() -> Self {
        Self {
            frames: Arc::new(Mutex::new(VecDeque::new())),
            ended: true,
        }
    }
}

#[async_trait]
impl Source for MockSource {
    fn set_read_deadline(&mut self, _deadline: Instant) -> Result<(), TraceError> {
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TraceError> {
        match self.frames.lock().unwrap().pop_front() {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None if self.ended => Err(TraceError::CaptureEnded { partial: None }),
            None => Err(TraceError::ReadTimeout),
        }
    }

    async fn close(&mut self) -> Result<(), TraceError> {
        Ok(())
    }

    fn set_packet_filter(&mut self, _spec: PacketFilterSpec) -> Result<(), TraceError> {
        Ok(())
    }
}

/// Sender that records every packet instead of touching the network.
pub struct MockSender {
    sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddrV4)>>>,
}

impl MockSender {
    /// Returns the sender and a handle to the packets it has recorded.
    pub fn new() -> (Self, Arc<Mutex<Vec<(Vec<u8>, SocketAddrV4)>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (Self { sent: sent.clone() }, sent)
    }
}

#[async_trait]
impl RawSender for MockSender {
    async fn send(&mut self, packet: &[u8], dst: SocketAddrV4) -> Result<(), TraceError> {
        self.sent.lock().unwrap().push((packet.to_vec(), dst));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TraceError> {
        Ok(())
    }
}
