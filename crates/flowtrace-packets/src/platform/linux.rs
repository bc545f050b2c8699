//! Linux packet I/O: AF_PACKET capture, IPPROTO_RAW transmission.

use crate::sink::RawSender;
use crate::source::{PacketFilterSpec, Source};
use crate::SourceSinkHandle;
use async_trait::async_trait;
use flowtrace_core::TraceError;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{FromRawFd, RawFd};
use std::time::Instant;
use tracing::debug;

const ETH_P_ALL: u16 = 0x0003;
const ETH_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;

fn htons(val: u16) -> u16 {
    val.to_be()
}

fn capability_error(context: &str, err: std::io::Error) -> TraceError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        TraceError::NoCapability(format!(
            "{context}: {err} (CAP_NET_RAW or root is required)"
        ))
    } else {
        TraceError::SocketCreation(err)
    }
}

/// AF_PACKET capture source.
///
/// Sees every frame on every interface, so the sniffer's software
/// matching does all the filtering.
pub struct AfPacketSource {
    file: Option<std::fs::File>,
    read_deadline: Option<Instant>,
}

impl AfPacketSource {
    pub fn new() -> Result<Self, TraceError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                i32::from(htons(ETH_P_ALL)),
            )
        };

        if fd < 0 {
            return Err(capability_error(
                "opening AF_PACKET capture socket",
                std::io::Error::last_os_error(),
            ));
        }

        debug!(fd = fd, "opened AF_PACKET capture socket");

        let file = unsafe { std::fs::File::from_raw_fd(fd) };

        Ok(Self {
            file: Some(file),
            read_deadline: None,
        })
    }

    /// Returns the IPv4 payload of an Ethernet frame.
    fn strip_ethernet_header(frame: &[u8]) -> Result<&[u8], TraceError> {
        if frame.len() < ETH_HLEN {
            return Err(TraceError::PacketTooShort {
                expected: ETH_HLEN,
                actual: frame.len(),
            });
        }

        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        if ethertype != ETHERTYPE_IPV4 {
            return Err(TraceError::PacketMismatch);
        }

        Ok(&frame[ETH_HLEN..])
    }
}

#[async_trait]
impl Source for AfPacketSource {
    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TraceError> {
        self.read_deadline = Some(deadline);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TraceError> {
        let mut raw_buf = vec![0u8; buf.len() + ETH_HLEN];

        loop {
            // Reading through &File keeps the fd owned by the File.
            let read_result = match self.file.as_ref() {
                Some(mut file) => file.read(&mut raw_buf),
                None => return Err(TraceError::CaptureEnded { partial: None }),
            };

            let n = match read_result {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if let Some(deadline) = self.read_deadline {
                        if Instant::now() >= deadline {
                            return Err(TraceError::ReadTimeout);
                        }
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // Anything else means the capture stream is gone.
                Err(_) => return Err(TraceError::CaptureEnded { partial: None }),
            };

            match Self::strip_ethernet_header(&raw_buf[..n]) {
                Ok(payload) => {
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    return Ok(len);
                }
                // Non-IPv4 frame, keep reading.
                Err(TraceError::PacketMismatch) | Err(TraceError::PacketTooShort { .. }) => {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TraceError> {
        // Dropping the File closes the fd.
        self.file.take();
        Ok(())
    }

    fn set_packet_filter(&mut self, _spec: PacketFilterSpec) -> Result<(), TraceError> {
        // Attaching a BPF program here would only be an optimization;
        // userspace matching stays authoritative.
        Ok(())
    }
}

/// Raw socket sender with IP_HDRINCL set.
///
/// IPPROTO_RAW accepts outbound datagrams of any transport protocol, so
/// the same sender carries UDP and TCP probes.
pub struct RawSocketSender {
    fd: RawFd,
    closed: bool,
}

impl RawSocketSender {
    pub fn new() -> Result<Self, TraceError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                libc::IPPROTO_RAW,
            )
        };

        if fd < 0 {
            return Err(capability_error(
                "opening raw send socket",
                std::io::Error::last_os_error(),
            ));
        }

        let one: libc::c_int = 1;
        let result = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TraceError::Internal(format!(
                "failed to set IP_HDRINCL: {err}"
            )));
        }

        debug!(fd = fd, "opened raw send socket");

        Ok(Self { fd, closed: false })
    }
}

#[async_trait]
impl RawSender for RawSocketSender {
    async fn send(&mut self, packet: &[u8], dst: SocketAddrV4) -> Result<(), TraceError> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = dst.port().to_be();
        sa.sin_addr.s_addr = u32::from_ne_bytes(dst.ip().octets());

        loop {
            let result = unsafe {
                libc::sendto(
                    self.fd,
                    packet.as_ptr() as *const libc::c_void,
                    packet.len(),
                    0,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };

            if result < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    tokio::task::yield_now().await;
                    continue;
                }
                return Err(TraceError::from_send_io(err));
            }

            return Ok(());
        }
    }

    async fn close(&mut self) -> Result<(), TraceError> {
        if !self.closed {
            self.closed = true;
            unsafe { libc::close(self.fd) };
        }
        Ok(())
    }
}

impl Drop for RawSocketSender {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Creates the capture source and raw sender for Linux.
pub async fn new_source_sink(_target_addr: Ipv4Addr) -> Result<SourceSinkHandle, TraceError> {
    // The source is opened first; its File releases the fd if the
    // sender fails to come up.
    let source = AfPacketSource::new()?;
    let sink = RawSocketSender::new()?;

    Ok(SourceSinkHandle {
        source: Box::new(source),
        sink: Box::new(sink),
    })
}
