//! Derived views over a finished run: per-flow paths, per-hop statistics,
//! and network-level flags.

use crate::result::{duration_ns, TracerouteResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// One hop along a single flow's path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHop {
    pub ttl: u8,
    pub ip: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(with = "duration_ns")]
    pub rtt: Duration,
}

/// The ordered responder sequence observed by one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    pub path_id: usize,
    pub hops: Vec<PathHop>,
}

impl Path {
    /// Paths are equal iff their ordered IP sequences match exactly.
    pub fn same_route(&self, other: &Path) -> bool {
        self.hops.len() == other.hops.len()
            && self
                .hops
                .iter()
                .zip(&other.hops)
                .all(|(a, b)| a.ip == b.ip)
    }
}

/// MTR-style statistics for one TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopStats {
    pub ttl: u8,
    /// The address that answered most probes at this TTL; ties go to the
    /// lowest address so re-evaluation is deterministic.
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub sent: u32,
    pub received: u32,
    pub loss_percent: f64,
    #[serde(with = "duration_ns")]
    pub min_rtt: Duration,
    #[serde(with = "duration_ns")]
    pub avg_rtt: Duration,
    #[serde(with = "duration_ns")]
    pub max_rtt: Duration,
    /// Population standard deviation over microsecond RTTs; zero when
    /// fewer than two samples exist.
    #[serde(with = "duration_ns")]
    pub stddev_rtt: Duration,
}

/// Network-level observations derived from the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAnalysis {
    /// Some TTL saw replies from two or more distinct routers.
    pub has_load_balancing: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub load_balancing_hops: Vec<u8>,
    pub packet_loss_rate: f64,
    #[serde(with = "duration_ns")]
    pub min_rtt: Duration,
    #[serde(with = "duration_ns")]
    pub avg_rtt: Duration,
    #[serde(with = "duration_ns")]
    pub max_rtt: Duration,
    /// At least two extracted forward paths differ. Forward-path diversity
    /// only; the return path is not observable from this endpoint.
    pub has_path_diversity: bool,
    pub unique_routers: usize,
}

impl TracerouteResult {
    /// Extracts one path per flow id observed at the first probed TTL.
    ///
    /// Each path follows ascending TTLs, skips errored cells, and stops at
    /// the first hop that answered from the target. Multiplicity is
    /// preserved; use [`TracerouteResult::unique_paths`] to deduplicate.
    pub fn paths(&self) -> Vec<Path> {
        let first_hop = match self.hops.values().next() {
            Some(hop) => hop,
            None => return Vec::new(),
        };

        let mut flow_ids: Vec<u16> = first_hop.flows.keys().copied().collect();
        flow_ids.sort_unstable();

        flow_ids
            .into_iter()
            .enumerate()
            .map(|(path_id, flow_id)| {
                let mut hops = Vec::new();
                for hop in self.hops.values() {
                    let rec = match hop.flows.get(&flow_id) {
                        Some(rec) if rec.replied() => rec,
                        _ => continue,
                    };
                    let ip = match rec.response_ip {
                        Some(ip) => ip,
                        None => continue,
                    };
                    hops.push(PathHop {
                        ttl: hop.ttl,
                        ip,
                        hostname: rec.hostname.clone(),
                        rtt: rec.rtt.unwrap_or_default(),
                    });
                    if ip == self.target {
                        break;
                    }
                }
                Path { path_id, hops }
            })
            .collect()
    }

    /// Extracted paths with duplicate routes removed.
    pub fn unique_paths(&self) -> Vec<Path> {
        let mut unique: Vec<Path> = Vec::new();
        for path in self.paths() {
            if !unique.iter().any(|p| p.same_route(&path)) {
                unique.push(path);
            }
        }
        unique
    }

    /// True when at least two flows observed different routes.
    pub fn has_multiple_paths(&self) -> bool {
        let paths = self.paths();
        paths
            .iter()
            .enumerate()
            .any(|(i, a)| paths[i + 1..].iter().any(|b| !a.same_route(b)))
    }

    /// Per-hop statistics over all flows and rounds.
    pub fn hop_statistics(&self) -> BTreeMap<u8, HopStats> {
        self.hops
            .iter()
            .map(|(&ttl, hop)| {
                let sent = hop.flows.len() as u32;
                let mut rtts: Vec<Duration> = Vec::new();
                let mut counts: BTreeMap<IpAddr, u32> = BTreeMap::new();

                for rec in hop.flows.values().filter(|f| f.replied()) {
                    if let Some(ip) = rec.response_ip {
                        *counts.entry(ip).or_insert(0) += 1;
                    }
                    if let Some(rtt) = rec.rtt {
                        rtts.push(rtt);
                    }
                }

                let received = hop.flows.values().filter(|f| f.replied()).count() as u32;

                // Highest reply count wins; BTreeMap order breaks ties on
                // the lowest address.
                let ip = counts
                    .iter()
                    .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                    .map(|(&ip, _)| ip);

                let hostname = ip.and_then(|ip| {
                    hop.flows
                        .values()
                        .find(|f| f.response_ip == Some(ip) && f.hostname.is_some())
                        .and_then(|f| f.hostname.clone())
                });

                let loss_percent = if sent > 0 {
                    f64::from(sent - received) / f64::from(sent) * 100.0
                } else {
                    0.0
                };

                let (min_rtt, avg_rtt, max_rtt) = if rtts.is_empty() {
                    (Duration::ZERO, Duration::ZERO, Duration::ZERO)
                } else {
                    let min = *rtts.iter().min().unwrap();
                    let max = *rtts.iter().max().unwrap();
                    let avg = rtts.iter().sum::<Duration>() / rtts.len() as u32;
                    (min, avg, max)
                };

                (
                    ttl,
                    HopStats {
                        ttl,
                        ip,
                        hostname,
                        sent,
                        received,
                        loss_percent,
                        min_rtt,
                        avg_rtt,
                        max_rtt,
                        stddev_rtt: stddev_micros(&rtts),
                    },
                )
            })
            .collect()
    }

    /// Analyzes the run for load balancing, path diversity, loss, and RTT
    /// spread.
    pub fn analyze(&self) -> NetworkAnalysis {
        let mut load_balancing_hops: Vec<u8> = self
            .hops
            .values()
            .filter(|h| h.is_load_balancing())
            .map(|h| h.ttl)
            .collect();
        load_balancing_hops.sort_unstable();

        let rtts: Vec<Duration> = self
            .hops
            .values()
            .flat_map(|h| h.flows.values())
            .filter(|f| f.replied())
            .filter_map(|f| f.rtt)
            .collect();

        let (min_rtt, avg_rtt, max_rtt) = if rtts.is_empty() {
            (Duration::ZERO, Duration::ZERO, Duration::ZERO)
        } else {
            (
                *rtts.iter().min().unwrap(),
                rtts.iter().sum::<Duration>() / rtts.len() as u32,
                *rtts.iter().max().unwrap(),
            )
        };

        NetworkAnalysis {
            has_load_balancing: !load_balancing_hops.is_empty(),
            load_balancing_hops,
            packet_loss_rate: self.packet_loss_rate(),
            min_rtt,
            avg_rtt,
            max_rtt,
            has_path_diversity: self.has_multiple_paths(),
            unique_routers: self.unique_hosts().len(),
        }
    }
}

/// Population standard deviation, computed over microsecond samples and
/// rounded back to a duration.
fn stddev_micros(rtts: &[Duration]) -> Duration {
    if rtts.len() < 2 {
        return Duration::ZERO;
    }
    let micros: Vec<f64> = rtts.iter().map(|d| d.as_micros() as f64).collect();
    let mean = micros.iter().sum::<f64>() / micros.len() as f64;
    let variance = micros.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / micros.len() as f64;
    Duration::from_micros(variance.sqrt() as u64)
}
