//! macOS packet I/O: BPF device capture, raw socket transmission.

use crate::sink::RawSender;
use crate::source::{PacketFilterSpec, Source};
use crate::SourceSinkHandle;
use async_trait::async_trait;
use flowtrace_core::TraceError;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::debug;

const MAX_BPF_DEVICES: usize = 256;

// Data-link types reported by BIOCGDLT.
const DLT_NULL: libc::c_uint = 0;
const DLT_EN10MB: libc::c_uint = 1;

const ETHERTYPE_IPV4: u16 = 0x0800;

fn capability_error(context: &str, err: std::io::Error) -> TraceError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        TraceError::NoCapability(format!("{context}: {err} (run as root)"))
    } else {
        TraceError::SocketCreation(err)
    }
}

/// Opens the first free /dev/bpf* node.
fn pick_bpf_device() -> Result<RawFd, TraceError> {
    use std::os::fd::IntoRawFd;

    for i in 0..MAX_BPF_DEVICES {
        let path = format!("/dev/bpf{i}");
        match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => return Ok(file.into_raw_fd()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => continue,
            Err(e) => return Err(capability_error(&format!("opening {path}"), e)),
        }
    }

    Err(TraceError::NoCapability(format!(
        "all {MAX_BPF_DEVICES} BPF devices are busy"
    )))
}

/// Finds the interface that owns the given source address.
fn interface_for_source(src: Ipv4Addr) -> Result<String, TraceError> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(TraceError::Internal(format!(
            "getifaddrs failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut found = None;
    let mut cursor = ifap;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() {
            continue;
        }
        let family = unsafe { (*entry.ifa_addr).sa_family };
        if libc::c_int::from(family) != libc::AF_INET {
            continue;
        }

        let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
        if Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)) == src {
            let name = unsafe { CStr::from_ptr(entry.ifa_name) };
            found = Some(name.to_string_lossy().into_owned());
            break;
        }
    }
    unsafe { libc::freeifaddrs(ifap) };

    found.ok_or_else(|| {
        TraceError::Internal(format!("no interface owns source address {src}"))
    })
}

/// Picks the interface that routes toward the target: a throwaway UDP
/// connect fixes the source address (no packet is sent), and the owning
/// interface is looked up from the interface table.
fn device_for_target(target_ip: Ipv4Addr) -> Result<String, TraceError> {
    if target_ip.is_loopback() {
        return Ok("lo0".to_string());
    }

    let socket = UdpSocket::bind("0.0.0.0:0").map_err(TraceError::SocketCreation)?;
    socket
        .connect((target_ip, 53))
        .map_err(TraceError::SocketCreation)?;
    let local = socket.local_addr().map_err(TraceError::SocketCreation)?;

    match local.ip() {
        IpAddr::V4(src) => interface_for_source(src),
        IpAddr::V6(ip) => Err(TraceError::Internal(format!(
            "kernel picked a non-IPv4 source {ip}"
        ))),
    }
}

/// Link-layer framing of the bound interface, as reported by BIOCGDLT.
#[derive(Debug, Clone, Copy)]
enum LinkLayer {
    /// DLT_EN10MB: 14-byte Ethernet header.
    Ethernet,
    /// DLT_NULL: 4-byte address-family word (loopback).
    Null,
}

impl LinkLayer {
    /// Returns the IPv4 payload of a link frame, or `None` for anything
    /// that is not IPv4 traffic.
    fn strip_ip(self, frame: &[u8]) -> Option<&[u8]> {
        match self {
            LinkLayer::Ethernet => {
                if frame.len() < 14 {
                    return None;
                }
                let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
                (ethertype == ETHERTYPE_IPV4).then(|| &frame[14..])
            }
            LinkLayer::Null => frame.get(4..),
        }
    }
}

/// Splits the next capture record off a BPF read batch.
///
/// Record layout (fixed by the BPF ABI): bh_caplen is the 4 bytes at
/// offset 8, bh_hdrlen the 2 bytes at offset 16, both in host order; the
/// frame follows the header and the next record starts at the next
/// 4-byte boundary past it. Returns the frame and the batch offset of
/// the following record, or `None` once the batch is exhausted or
/// truncated.
fn split_bpf_record(batch: &[u8]) -> Option<(&[u8], usize)> {
    if batch.len() < 18 {
        return None;
    }

    let caplen = u32::from_ne_bytes(batch[8..12].try_into().ok()?) as usize;
    let hdrlen = u16::from_ne_bytes(batch[16..18].try_into().ok()?) as usize;
    if hdrlen < 18 {
        return None;
    }

    let end = hdrlen.checked_add(caplen)?;
    if end > batch.len() {
        return None;
    }

    Some((&batch[hdrlen..end], (end + 3) & !3))
}

/// BPF device capture source.
///
/// Each kernel read hands back a batch of capture records; the batch is
/// drained eagerly into a queue of IP frames so `read` only ever pops.
pub struct BpfSource {
    fd: RawFd,
    link: LinkLayer,
    /// Kernel buffer size; read(2) on a BPF device insists on it.
    buf_len: usize,
    deadline: Option<Instant>,
    pending: VecDeque<Vec<u8>>,
}

impl BpfSource {
    pub fn new(target_ip: Ipv4Addr) -> Result<Self, TraceError> {
        let iface = device_for_target(target_ip)?;
        let fd = pick_bpf_device()?;

        let (link, buf_len) = match Self::configure(fd, &iface) {
            Ok(settings) => settings,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        debug!(interface = %iface, link = ?link, buf_len = buf_len, "opened BPF device");

        Ok(Self {
            fd,
            link,
            buf_len,
            deadline: None,
            pending: VecDeque::new(),
        })
    }

    /// Binds the device to `iface` and queries its framing and buffer
    /// size.
    fn configure(fd: RawFd, iface: &str) -> Result<(LinkLayer, usize), TraceError> {
        // Deliver packets as they arrive instead of waiting for a full
        // buffer.
        let immediate: libc::c_int = 1;
        if unsafe { libc::ioctl(fd, libc::BIOCIMMEDIATE, &immediate) } < 0 {
            return Err(TraceError::Internal(format!(
                "failed to set BIOCIMMEDIATE: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
        let name_len = ifreq.ifr_name.len() - 1;
        for (slot, byte) in ifreq.ifr_name.iter_mut().zip(iface.as_bytes().iter().take(name_len)) {
            *slot = *byte as libc::c_char;
        }
        if unsafe { libc::ioctl(fd, libc::BIOCSETIF, &ifreq) } < 0 {
            return Err(TraceError::Internal(format!(
                "failed to bind BPF to {iface}: {}",
                std::io::Error::last_os_error()
            )));
        }

        // ICMP errors can come back addressed to us through any router;
        // promiscuous capture is preferred but not required.
        if unsafe { libc::ioctl(fd, libc::BIOCPROMISC) } < 0 {
            debug!(
                interface = %iface,
                error = %std::io::Error::last_os_error(),
                "promiscuous mode rejected, capturing addressed traffic only"
            );
        }

        let mut dlt: libc::c_uint = 0;
        if unsafe { libc::ioctl(fd, libc::BIOCGDLT, &mut dlt) } < 0 {
            return Err(TraceError::Internal(format!(
                "failed to query BPF link type: {}",
                std::io::Error::last_os_error()
            )));
        }
        let link = match dlt {
            DLT_EN10MB => LinkLayer::Ethernet,
            DLT_NULL => LinkLayer::Null,
            other => {
                return Err(TraceError::NoCapability(format!(
                    "unsupported link type {other} on {iface}"
                )))
            }
        };

        let mut blen: libc::c_uint = 0;
        if unsafe { libc::ioctl(fd, libc::BIOCGBLEN, &mut blen) } < 0 {
            return Err(TraceError::Internal(format!(
                "failed to query BPF buffer size: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok((link, blen as usize))
    }

    /// Blocks for the next batch of capture records, bounded by the
    /// deadline, and queues every IPv4 frame found in it.
    fn refill(&mut self) -> Result<(), TraceError> {
        if self.fd < 0 {
            return Err(TraceError::CaptureEnded { partial: None });
        }

        let timeout = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TraceError::ReadTimeout);
                }
                deadline.duration_since(now)
            }
            None => Duration::from_secs(1),
        };
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        if unsafe { libc::ioctl(self.fd, libc::BIOCSRTIMEOUT, &tv) } < 0 {
            return Err(TraceError::Internal(format!(
                "failed to set BPF read timeout: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut batch = vec![0u8; self.buf_len];
        let n = unsafe {
            libc::read(
                self.fd,
                batch.as_mut_ptr() as *mut libc::c_void,
                batch.len(),
            )
        };

        if n < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                // Interrupted; the caller's deadline still governs.
                Some(libc::EINTR) => Ok(()),
                _ => Err(TraceError::CaptureEnded { partial: None }),
            };
        }
        if n == 0 {
            // The BPF timeout expired, which is the deadline firing.
            return Err(TraceError::ReadTimeout);
        }

        let batch = &batch[..n as usize];
        let mut offset = 0;
        while offset < batch.len() {
            let (frame, advance) = match split_bpf_record(&batch[offset..]) {
                Some(record) => record,
                None => break,
            };
            if let Some(ip_frame) = self.link.strip_ip(frame) {
                self.pending.push_back(ip_frame.to_vec());
            }
            offset += advance;
        }

        Ok(())
    }
}

#[async_trait]
impl Source for BpfSource {
    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TraceError> {
        self.deadline = Some(deadline);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TraceError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                return Ok(n);
            }
            self.refill()?;
        }
    }

    async fn close(&mut self) -> Result<(), TraceError> {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        Ok(())
    }

    fn set_packet_filter(&mut self, _spec: PacketFilterSpec) -> Result<(), TraceError> {
        // No BPF program is attached; userspace matching is authoritative.
        Ok(())
    }
}

impl Drop for BpfSource {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

/// Raw socket sender with IP_HDRINCL set.
pub struct RawSocketSender {
    fd: RawFd,
    write_buf: Vec<u8>,
}

impl RawSocketSender {
    pub fn new() -> Result<Self, TraceError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_RAW) };
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

        Ok(Self {
            fd,
            write_buf: vec![0u8; 2048],
        })
    }
}

#[async_trait]
impl RawSender for RawSocketSender {
    async fn send(&mut self, packet: &[u8], dst: SocketAddrV4) -> Result<(), TraceError> {
        if packet.len() < 20 || packet.len() > self.write_buf.len() {
            return Err(TraceError::MalformedPacket(format!(
                "cannot send {}-byte packet",
                packet.len()
            )));
        }

        // macOS raw sockets expect ip_len and ip_off in host byte order.
        let buf = &mut self.write_buf[..packet.len()];
        buf.copy_from_slice(packet);
        let total_len = u16::from_be_bytes([buf[2], buf[3]]);
        buf[2..4].copy_from_slice(&total_len.to_ne_bytes());
        let frag_off = u16::from_be_bytes([buf[6], buf[7]]);
        buf[6..8].copy_from_slice(&frag_off.to_ne_bytes());

        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sa.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = dst.port().to_be();
        sa.sin_addr.s_addr = u32::from_ne_bytes(dst.ip().octets());

        let result = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };

        if result < 0 {
            return Err(TraceError::from_send_io(std::io::Error::last_os_error()));
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), TraceError> {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        Ok(())
    }
}

impl Drop for RawSocketSender {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

/// Creates the capture source and raw sender for macOS.
pub async fn new_source_sink(target_addr: Ipv4Addr) -> Result<SourceSinkHandle, TraceError> {
    let source = BpfSource::new(target_addr)?;
    let sink = RawSocketSender::new()?;

    Ok(SourceSinkHandle {
        source: Box::new(source),
        sink: Box::new(sink),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds one BPF record with an 18-byte header and the given frame.
    fn record(frame: &[u8]) -> Vec<u8> {
        let mut rec = vec![0u8; 18];
        rec[8..12].copy_from_slice(&(frame.len() as u32).to_ne_bytes());
        rec[16..18].copy_from_slice(&18u16.to_ne_bytes());
        rec.extend_from_slice(frame);
        rec
    }

    #[test]
    fn test_split_single_record() {
        let rec = record(&[0xAA; 10]);
        let (frame, advance) = split_bpf_record(&rec).unwrap();
        assert_eq!(frame, &[0xAA; 10]);
        assert_eq!(advance, 28);
    }

    #[test]
    fn test_split_walks_aligned_records() {
        // 7-byte frame pads the record to the next 4-byte boundary
        let mut batch = record(&[0x01; 7]);
        batch.resize((batch.len() + 3) & !3, 0);
        let second_at = batch.len();
        batch.extend_from_slice(&record(&[0x02; 4]));

        let (first, advance) = split_bpf_record(&batch).unwrap();
        assert_eq!(first, &[0x01; 7]);
        assert_eq!(advance, second_at);

        let (second, _) = split_bpf_record(&batch[advance..]).unwrap();
        assert_eq!(second, &[0x02; 4]);
    }

    #[test]
    fn test_split_rejects_truncated_records() {
        assert!(split_bpf_record(&[0u8; 10]).is_none());

        // Header claims more captured bytes than the batch holds
        let mut rec = record(&[0xAA; 4]);
        rec[8..12].copy_from_slice(&100u32.to_ne_bytes());
        assert!(split_bpf_record(&rec).is_none());
    }

    #[test]
    fn test_strip_ip_by_link_layer() {
        let mut ether = vec![0u8; 14];
        ether[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        ether.extend_from_slice(&[0x45, 0x00]);
        assert_eq!(LinkLayer::Ethernet.strip_ip(&ether), Some(&[0x45, 0x00][..]));

        // ARP ethertype is not ours
        let mut arp = vec![0u8; 14];
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(LinkLayer::Ethernet.strip_ip(&arp), None);

        let lo = [0x02, 0x00, 0x00, 0x00, 0x45, 0x00];
        assert_eq!(LinkLayer::Null.strip_ip(&lo), Some(&[0x45, 0x00][..]));
    }
}
