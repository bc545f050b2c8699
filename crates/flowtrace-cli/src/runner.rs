//! Wires resolution, packet I/O, and the probe engine into one run.

use async_trait::async_trait;
use flowtrace_core::{
    ProbeEngine, ProbeParams, Protocol, ReverseResolver, TraceError, TracerouteResult,
};
use flowtrace_packets::new_source_sink;
use flowtrace_tcp::TcpDriver;
use flowtrace_udp::UdpDriver;
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::{debug, warn};

/// Resolves a target name or literal to an IPv4 address.
pub async fn resolve_target(hostname: &str) -> Result<Ipv4Addr, TraceError> {
    match hostname.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => return Ok(ip),
        Ok(IpAddr::V6(_)) => {
            return Err(TraceError::AddressResolution {
                hostname: hostname.to_string(),
                reason: "IPv6 targets are not supported".to_string(),
            })
        }
        Err(_) => {}
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
        TraceError::AddressResolution {
            hostname: hostname.to_string(),
            reason: format!("failed to create DNS resolver: {e}"),
        }
    })?;

    let lookup = resolver
        .lookup_ip(hostname)
        .await
        .map_err(|e| TraceError::AddressResolution {
            hostname: hostname.to_string(),
            reason: e.to_string(),
        })?;

    lookup
        .iter()
        .find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| TraceError::AddressResolution {
            hostname: hostname.to_string(),
            reason: "no IPv4 address found".to_string(),
        })
}

/// Determines the local address the kernel would route toward the target.
/// Connecting a UDP socket sends nothing; it only fixes the source.
pub fn local_source_ip(target: Ipv4Addr) -> Result<Ipv4Addr, TraceError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(TraceError::SocketCreation)?;
    socket
        .connect(SocketAddr::from((target, 33434)))
        .map_err(TraceError::SocketCreation)?;
    match socket
        .local_addr()
        .map_err(TraceError::SocketCreation)?
        .ip()
    {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => Err(TraceError::Internal(format!(
            "kernel picked a non-IPv4 source {ip}"
        ))),
    }
}

/// Reverse DNS through the system resolver.
struct HickoryReverseResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryReverseResolver {
    fn from_system_conf() -> Option<Self> {
        match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(Self { resolver }),
            Err(e) => {
                warn!(error = %e, "reverse DNS disabled, resolver unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl ReverseResolver for HickoryReverseResolver {
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        let names = self.resolver.reverse_lookup(ip).await.ok()?;
        names.iter().next().map(|name| name.to_string())
    }
}

/// Runs one traceroute end to end.
///
/// On a capture stream failure the partial result is surfaced inside the
/// error so the caller can still render what was measured.
pub async fn run_traceroute(
    hostname: &str,
    protocol: Protocol,
    params: ProbeParams,
    reverse_dns: bool,
) -> Result<TracerouteResult, TraceError> {
    // Reject bad parameters before any sockets are opened.
    params.validate()?;

    let target_ip = resolve_target(hostname).await?;
    debug!(hostname = hostname, target = %target_ip, "resolved target");

    let src_ip = local_source_ip(target_ip)?;
    debug!(src_ip = %src_ip, "selected source address");

    let handle = new_source_sink(target_ip).await?;

    match protocol {
        Protocol::Udp => {
            let driver = UdpDriver::new(
                src_ip,
                target_ip,
                params.base_src_port,
                params.dst_port,
                params.num_paths,
                handle.source,
                handle.sink,
            );
            run_engine(driver, target_ip, src_ip, params, reverse_dns).await
        }
        Protocol::Tcp => {
            let driver = TcpDriver::new(
                src_ip,
                target_ip,
                params.base_src_port,
                params.dst_port,
                params.num_paths,
                handle.source,
                handle.sink,
            );
            run_engine(driver, target_ip, src_ip, params, reverse_dns).await
        }
    }
}

async fn run_engine<D: flowtrace_core::ProbeDriver>(
    driver: D,
    target_ip: Ipv4Addr,
    src_ip: Ipv4Addr,
    params: ProbeParams,
    reverse_dns: bool,
) -> Result<TracerouteResult, TraceError> {
    let mut engine = ProbeEngine::new(
        driver,
        IpAddr::V4(target_ip),
        IpAddr::V4(src_ip),
        params,
    )?;

    if reverse_dns {
        if let Some(resolver) = HickoryReverseResolver::from_system_conf() {
            engine.set_reverse_resolver(Box::new(resolver));
        }
    }

    let outcome = engine.traceroute().await;
    if let Err(e) = engine.close().await {
        warn!(error = %e, "failed to release probe resources");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_ipv4_literal() {
        let ip = resolve_target("8.8.8.8").await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(8, 8, 8, 8));
    }

    #[tokio::test]
    async fn test_resolve_rejects_ipv6_literal() {
        let err = resolve_target("2001:db8::1").await.unwrap_err();
        assert!(matches!(err, TraceError::AddressResolution { .. }));
    }
}
