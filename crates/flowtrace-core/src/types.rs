//! Core types for multipath traceroute operations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Probe protocol.
///
/// ECMP routers hash the (src ip, dst ip, protocol, src port, dst port)
/// 5-tuple, so both protocols discover multiple paths the same way; TCP
/// traverses firewalls that drop high-port UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = crate::TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            _ => Err(crate::TraceError::ConfigInvalid(format!(
                "unknown protocol: {}",
                s
            ))),
        }
    }
}

impl Protocol {
    /// Per-probe timeout used when the caller does not set one.
    ///
    /// A TCP target answers with SYN-ACK or RST within one RTT, so its
    /// default can be much tighter than UDP's.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Protocol::Udp => Duration::from_secs(3),
            Protocol::Tcp => Duration::from_secs(1),
        }
    }

    /// Conventional destination port for this protocol.
    pub fn default_dst_port(&self) -> u16 {
        match self {
            Protocol::Udp => 33434,
            Protocol::Tcp => 80,
        }
    }
}

/// Parameters for the ttl x flow x round probe matrix.
#[derive(Debug, Clone)]
pub struct ProbeParams {
    /// First source port; flow `f` probes from `base_src_port + f`.
    pub base_src_port: u16,
    /// Destination port, fixed for the whole run.
    pub dst_port: u16,
    /// Number of parallel flows (distinct ECMP equivalence classes).
    pub num_paths: u16,
    /// Minimum TTL to start with.
    pub min_ttl: u8,
    /// Maximum TTL to probe.
    pub max_ttl: u8,
    /// Probes per (ttl, flow) cell; values above 1 enable MTR statistics.
    pub probe_count: u8,
    /// Pause between consecutive probes.
    pub delay: Duration,
    /// Per-probe timeout; `None` selects the protocol default.
    pub timeout: Option<Duration>,
}

impl Default for ProbeParams {
    fn default() -> Self {
        Self {
            base_src_port: 33434,
            dst_port: 33434,
            num_paths: 4,
            min_ttl: 1,
            max_ttl: 30,
            probe_count: 1,
            delay: Duration::from_millis(10),
            timeout: None,
        }
    }
}

impl ProbeParams {
    /// Validates the parameters.
    pub fn validate(&self) -> Result<(), crate::TraceError> {
        if self.base_src_port == 0 {
            return Err(crate::TraceError::ConfigInvalid(
                "source port must be in 1-65535".to_string(),
            ));
        }
        if self.dst_port == 0 {
            return Err(crate::TraceError::ConfigInvalid(
                "destination port must be in 1-65535".to_string(),
            ));
        }
        if self.num_paths == 0 || self.num_paths > 256 {
            return Err(crate::TraceError::ConfigInvalid(format!(
                "num_paths {} out of range 1-256",
                self.num_paths
            )));
        }
        // The whole source-port window must stay inside the port space.
        let last_port = u32::from(self.base_src_port) + u32::from(self.num_paths) - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(crate::TraceError::ConfigInvalid(format!(
                "source ports {}-{} overflow 65535",
                self.base_src_port, last_port
            )));
        }
        if self.min_ttl == 0 {
            return Err(crate::TraceError::ConfigInvalid(
                "min_ttl must be in 1-255".to_string(),
            ));
        }
        if self.max_ttl < self.min_ttl {
            return Err(crate::TraceError::ConfigInvalid(format!(
                "max_ttl {} below min_ttl {}",
                self.max_ttl, self.min_ttl
            )));
        }
        if self.probe_count == 0 || self.probe_count > 10 {
            return Err(crate::TraceError::ConfigInvalid(format!(
                "probe_count {} out of range 1-10",
                self.probe_count
            )));
        }
        Ok(())
    }

    /// Source port carrying flow `flow`.
    pub fn src_port(&self, flow: u16) -> u16 {
        self.base_src_port + flow
    }

    /// Key distinguishing round repeats of the same flow in the result.
    pub fn unique_flow_id(&self, flow: u16, round: u8) -> u16 {
        flow + u16::from(round) * self.num_paths
    }

    /// Flow index encoded in an observed source port, if it lies in this
    /// run's window.
    pub fn flow_of_src_port(&self, src_port: u16) -> Option<u16> {
        let flow = src_port.checked_sub(self.base_src_port)?;
        (flow < self.num_paths).then_some(flow)
    }

    /// Total probes emitted per hop.
    pub fn probes_per_hop(&self) -> u32 {
        u32::from(self.num_paths) * u32::from(self.probe_count)
    }
}
