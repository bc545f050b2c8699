//! TCP SYN multipath traceroute probes.
//!
//! SYN probes traverse networks that filter high-port UDP. The flow index
//! rides in the TCP source port exactly as in the UDP variant; arrival at
//! the target shows up either as a quoted ICMP error or as a SYN-ACK/RST
//! from the target itself.

mod driver;
mod packet;

pub use driver::TcpDriver;
pub use packet::build_tcp_syn_probe;
