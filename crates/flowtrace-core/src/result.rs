//! Result model for a traceroute run.
//!
//! The JSON shape follows the persisted output format: top-level `target`,
//! `src_ip`, `start_time`, `end_time`, `duration`, and `hops` keyed by
//! decimal TTL, each hop holding `flows` keyed by decimal unique flow id.
//! Timestamps are RFC 3339, durations signed nanoseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// Serializes a `Duration` as integer nanoseconds.
pub(crate) mod duration_ns {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_nanos() as i64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ns = i64::deserialize(d)?;
        Ok(Duration::from_nanos(ns.max(0) as u64))
    }
}

/// Serializes an `Option<Duration>` as nanoseconds or null.
pub(crate) mod opt_duration_ns {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_nanos() as i64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ns = Option::<i64>::deserialize(d)?;
        Ok(ns.map(|ns| Duration::from_nanos(ns.max(0) as u64)))
    }
}

/// Outcome of a single probe.
///
/// Exactly one of `recv_time` and `error` is set once the probe completes:
/// either a reply arrived, or the record carries a terminal error tag
/// (`"timeout"`, or the send failure text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Unique flow id: `flow + round * num_paths`.
    pub flow_id: u16,
    /// Source port the probe was sent from (`base_src_port + flow`).
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Wall-clock send time.
    pub sent_time: DateTime<Utc>,
    /// Wall-clock receive time, if a reply arrived in time.
    pub recv_time: Option<DateTime<Utc>>,
    /// Monotonic round-trip time.
    #[serde(with = "opt_duration_ns")]
    pub rtt: Option<Duration>,
    /// Address of the responding router.
    pub response_ip: Option<IpAddr>,
    /// Reverse DNS name of the responder (round 0 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<u8>,
    /// Terminal error tag; `"timeout"` for an expired deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FlowRecord {
    /// Creates a pending record stamped with its send time.
    pub fn sent(flow_id: u16, src_port: u16, dst_port: u16, sent_time: DateTime<Utc>) -> Self {
        Self {
            flow_id,
            src_port,
            dst_port,
            sent_time,
            recv_time: None,
            rtt: None,
            response_ip: None,
            hostname: None,
            icmp_type: None,
            icmp_code: None,
            error: None,
        }
    }

    /// True when a reply was received and no error is recorded.
    pub fn replied(&self) -> bool {
        self.error.is_none() && self.response_ip.is_some()
    }
}

/// All probes emitted with the same TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopResult {
    pub ttl: u8,
    /// Probe outcomes keyed by unique flow id.
    pub flows: BTreeMap<u16, FlowRecord>,
}

impl HopResult {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            flows: BTreeMap::new(),
        }
    }

    /// Distinct responder addresses among replied probes, in address order.
    pub fn responders(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .flows
            .values()
            .filter(|f| f.replied())
            .filter_map(|f| f.response_ip)
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }

    /// True when probes at this TTL reached at least two different routers.
    pub fn is_load_balancing(&self) -> bool {
        self.responders().len() > 1
    }
}

/// Complete result of one traceroute run.
///
/// Created by the engine, frozen when `traceroute()` returns, read-only
/// afterwards. Owns its hop records, which own their flow records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteResult {
    /// Target address probed.
    pub target: IpAddr,
    /// Local source address the probes were sent from.
    pub src_ip: IpAddr,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(with = "duration_ns")]
    pub duration: Duration,
    /// Hop records keyed by TTL.
    pub hops: BTreeMap<u8, HopResult>,
}

impl TracerouteResult {
    /// Number of hops probed (highest TTL with a record).
    pub fn hop_count(&self) -> u8 {
        self.hops.keys().next_back().copied().unwrap_or(0)
    }

    /// Distinct responder addresses seen anywhere in the trace.
    pub fn unique_hosts(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .hops
            .values()
            .flat_map(|h| h.flows.values())
            .filter_map(|f| f.response_ip)
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }

    /// Mean RTT over replied probes at `ttl`, if any.
    pub fn average_rtt(&self, ttl: u8) -> Option<Duration> {
        let hop = self.hops.get(&ttl)?;
        let rtts: Vec<Duration> = hop
            .flows
            .values()
            .filter(|f| f.replied())
            .filter_map(|f| f.rtt)
            .collect();
        if rtts.is_empty() {
            return None;
        }
        Some(rtts.iter().sum::<Duration>() / rtts.len() as u32)
    }

    /// Overall probe loss percentage.
    pub fn packet_loss_rate(&self) -> f64 {
        let total = self
            .hops
            .values()
            .map(|h| h.flows.len())
            .sum::<usize>();
        if total == 0 {
            return 0.0;
        }
        let replied = self
            .hops
            .values()
            .flat_map(|h| h.flows.values())
            .filter(|f| f.replied())
            .count();
        (total - replied) as f64 / total as f64 * 100.0
    }

    /// Serializes the result to indented JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Serializes the result to compact JSON.
    pub fn to_json_compact(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn record(flow_id: u16, ip: Option<&str>, rtt_ms: Option<u64>) -> FlowRecord {
        let mut rec = FlowRecord::sent(flow_id, 33434 + flow_id, 33434, Utc::now());
        match ip {
            Some(ip) => {
                rec.recv_time = Some(Utc::now());
                rec.rtt = rtt_ms.map(Duration::from_millis);
                rec.response_ip = Some(ip.parse().unwrap());
            }
            None => rec.error = Some("timeout".to_string()),
        }
        rec
    }

    fn result_with_hops(hops: Vec<(u8, Vec<FlowRecord>)>) -> TracerouteResult {
        let start = Utc::now();
        TracerouteResult {
            target: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            src_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            start_time: start,
            end_time: start,
            duration: Duration::from_millis(250),
            hops: hops
                .into_iter()
                .map(|(ttl, flows)| {
                    let mut hop = HopResult::new(ttl);
                    for f in flows {
                        hop.flows.insert(f.flow_id, f);
                    }
                    (ttl, hop)
                })
                .collect(),
        }
    }

    #[test]
    fn test_flow_record_completion_invariant() {
        let replied = record(0, Some("10.0.0.1"), Some(12));
        assert!(replied.replied());
        assert!(replied.recv_time.is_some());
        assert!(replied.error.is_none());

        let lost = record(1, None, None);
        assert!(!lost.replied());
        assert!(lost.recv_time.is_none());
        assert_eq!(lost.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_hop_load_balancing_detection() {
        let single = result_with_hops(vec![(
            1,
            vec![
                record(0, Some("10.0.0.1"), Some(5)),
                record(1, Some("10.0.0.1"), Some(6)),
            ],
        )]);
        assert!(!single.hops[&1].is_load_balancing());

        let multi = result_with_hops(vec![(
            1,
            vec![
                record(0, Some("10.0.0.1"), Some(5)),
                record(1, Some("10.0.0.2"), Some(6)),
            ],
        )]);
        assert!(multi.hops[&1].is_load_balancing());
    }

    #[test]
    fn test_packet_loss_rate() {
        let result = result_with_hops(vec![
            (1, vec![record(0, Some("10.0.0.1"), Some(5)), record(1, None, None)]),
            (2, vec![record(0, None, None), record(1, None, None)]),
        ]);
        assert_eq!(result.packet_loss_rate(), 75.0);
    }

    #[test]
    fn test_average_rtt() {
        let result = result_with_hops(vec![(
            3,
            vec![
                record(0, Some("10.0.0.1"), Some(10)),
                record(1, Some("10.0.0.1"), Some(20)),
                record(2, None, None),
            ],
        )]);
        assert_eq!(result.average_rtt(3), Some(Duration::from_millis(15)));
        assert_eq!(result.average_rtt(9), None);
    }

    #[test]
    fn test_json_shape() {
        let result = result_with_hops(vec![(
            1,
            vec![record(0, Some("10.0.0.1"), Some(5)), record(1, None, None)],
        )]);
        let json = result.to_json().unwrap();

        assert!(json.contains("\"target\": \"8.8.8.8\""));
        assert!(json.contains("\"src_ip\": \"192.168.1.10\""));
        assert!(json.contains("\"duration\": 250000000"));
        // Map keys are decimal strings
        assert!(json.contains("\"1\""));
        assert!(json.contains("\"flow_id\": 0"));
        assert!(json.contains("\"src_port\": 33434"));
        assert!(json.contains("\"error\": \"timeout\""));
        // Absent optionals are omitted
        assert!(!json.contains("\"icmp_type\""));

        let parsed: TracerouteResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.hops[&1].flows.len(), 2);
        assert_eq!(parsed.duration, Duration::from_millis(250));
        assert_eq!(
            parsed.hops[&1].flows[&0].rtt,
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn test_unique_hosts_and_hop_count() {
        let result = result_with_hops(vec![
            (1, vec![record(0, Some("10.0.0.1"), Some(5))]),
            (
                2,
                vec![
                    record(0, Some("10.0.0.2"), Some(7)),
                    record(1, Some("10.0.0.1"), Some(8)),
                ],
            ),
        ]);
        assert_eq!(result.hop_count(), 2);
        assert_eq!(result.unique_hosts().len(), 2);
    }
}
