//! UDP multipath traceroute probes.
//!
//! Probes are complete hand-built IPv4 datagrams. The flow index is
//! encoded in the UDP source port (`base_src_port + flow`), which ECMP
//! routers feed into their 5-tuple hash, and comes back inside the quoted
//! header of the ICMP error a router answers with.

mod driver;
mod packet;

pub use driver::UdpDriver;
pub use packet::{build_udp_probe, PROBE_PAYLOAD};
